//! Engine Configuration
//!
//! Loaded from a TOML file or from a flat property map whose keys share a
//! common prefix (`entitlement.issuer.name = ...`).

use crate::ledger::DEFAULT_MAX_RESERVE_ATTEMPTS;
use crate::rules::RuleSet;
use sase_common::{EntitlementError, EntitlementResult, ExhaustedStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Default property prefix
pub const DEFAULT_PREFIX: &str = "entitlement.";

/// Placeholder signing secret. Deployments must override it.
pub const DEFAULT_SIGNING_SECRET: &str = "change-me";

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Status reported for an exhausted pool
    pub exhausted_status: ExhaustedStatus,
    /// Certificate issuing identity
    pub issuer: IssuerConfig,
    /// Capacity ledger tuning
    pub ledger: LedgerConfig,
    /// Enabled bind rules
    pub rules: RulesConfig,
}

/// Issuer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Name embedded in every certificate
    pub name: String,
    /// HMAC secret used to sign certificate bodies
    pub signing_secret: String,
    /// First serial handed out
    pub serial_start: u64,
    /// Certificate lifetime in days
    pub validity_days: i64,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            name: "entitlement-issuer".into(),
            signing_secret: DEFAULT_SIGNING_SECRET.into(),
            serial_start: 1,
            validity_days: 365,
        }
    }
}

impl IssuerConfig {
    /// Reject empty names or secrets and out-of-range validity
    pub fn validate(&self) -> EntitlementResult<()> {
        if self.name.trim().is_empty() {
            return Err(EntitlementError::Config("issuer name must not be empty".into()));
        }
        if self.signing_secret.is_empty() {
            return Err(EntitlementError::Config("signing secret must not be empty".into()));
        }
        if !(1..=36_500).contains(&self.validity_days) {
            return Err(EntitlementError::Config(format!(
                "validity_days out of range: {}",
                self.validity_days
            )));
        }
        Ok(())
    }

    /// Whether certificates would be signed with [`DEFAULT_SIGNING_SECRET`]
    pub fn uses_default_secret(&self) -> bool {
        self.signing_secret == DEFAULT_SIGNING_SECRET
    }
}

/// Ledger tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// CAS attempts before a reservation reports a conflict
    pub max_reserve_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_reserve_attempts: DEFAULT_MAX_RESERVE_ATTEMPTS,
        }
    }
}

/// Rule selection, evaluated in the listed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Built-in rule names
    pub enabled: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                "virt_only".into(),
                "requires_consumer_type".into(),
                "multi_entitlement".into(),
            ],
        }
    }
}

impl RulesConfig {
    /// Build the configured rule set
    pub fn build(&self) -> EntitlementResult<RuleSet> {
        RuleSet::from_names(&self.enabled)
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> EntitlementResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EntitlementError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML; missing sections take their defaults
    pub fn from_toml_str(content: &str) -> EntitlementResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EntitlementError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> EntitlementResult<String> {
        toml::to_string_pretty(self).map_err(|e| EntitlementError::Config(e.to_string()))
    }

    /// Build from flat properties.
    ///
    /// Only keys starting with `prefix` are read. Unknown keys under the
    /// prefix are logged and skipped; malformed values are an error.
    pub fn from_properties(properties: &HashMap<String, String>, prefix: &str) -> EntitlementResult<Self> {
        let mut config = Self::default();

        let mut keys: Vec<_> = properties.keys().filter(|k| k.starts_with(prefix)).collect();
        keys.sort();

        for full_key in keys {
            let key = &full_key[prefix.len()..];
            let value = properties[full_key.as_str()].trim();

            match key {
                "issuer.name" => config.issuer.name = value.to_string(),
                "issuer.signing_secret" => config.issuer.signing_secret = value.to_string(),
                "issuer.serial_start" => config.issuer.serial_start = parse(full_key, value)?,
                "issuer.validity_days" => config.issuer.validity_days = parse(full_key, value)?,
                "ledger.max_reserve_attempts" => {
                    config.ledger.max_reserve_attempts = parse(full_key, value)?
                }
                "rules.enabled" => {
                    config.rules.enabled = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "exhausted_status" => config.exhausted_status = parse(full_key, value)?,
                _ => warn!(key = %full_key, "Ignoring unknown configuration property"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> EntitlementResult<()> {
        self.issuer.validate()?;
        if self.ledger.max_reserve_attempts == 0 {
            return Err(EntitlementError::Config("max_reserve_attempts must be at least 1".into()));
        }
        self.rules.build().map(|_| ())
    }
}

fn parse<T>(key: &str, value: &str) -> EntitlementResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| EntitlementError::Config(format!("{key}={value}: {e}")))
}
