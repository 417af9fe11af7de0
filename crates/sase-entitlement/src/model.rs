//! Entitlement Data Model

use chrono::{DateTime, Utc};
use sase_common::{EntitlementError, EntitlementResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Consumer UUID
pub type ConsumerUuid = Uuid;

/// Entitlement ID
pub type EntitlementId = Uuid;

/// Pool ID
pub type PoolId = String;

/// Certificate serial number
pub type Serial = u64;

/// Well-known attribute keys
pub mod attr {
    /// Entitlements from this pool are reserved for physical systems
    pub const VIRT_ONLY: &str = "virt_only";
    /// Only consumers of the named type may bind
    pub const REQUIRES_CONSUMER_TYPE: &str = "requires_consumer_type";
    /// A consumer may hold more than one entitlement from the pool
    pub const MULTI_ENTITLEMENT: &str = "multi-entitlement";
}

/// Owner (organization) that consumers and pools belong to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Unique owner key
    pub key: String,
    /// Display name
    pub display_name: String,
}

impl Owner {
    /// Create new owner
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }
}

/// Consumer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerType {
    /// Bare-metal host
    PhysicalSystem,
    /// Guest of a hypervisor
    VirtSystem,
    /// Anything else, e.g. a person or domain
    Other,
}

impl ConsumerType {
    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhysicalSystem => "physical_system",
            Self::VirtSystem => "virt_system",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsumerType {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // "system" is the legacy name for a physical system
            "physical_system" | "system" => Ok(Self::PhysicalSystem),
            "virt_system" => Ok(Self::VirtSystem),
            "other" => Ok(Self::Other),
            other => Err(EntitlementError::Validation(format!(
                "unknown consumer type: {other}"
            ))),
        }
    }
}

/// Registered system requesting entitlements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    /// Unique, immutable consumer UUID
    pub uuid: ConsumerUuid,
    /// Display name
    pub name: String,
    /// Consumer type
    pub consumer_type: ConsumerType,
    /// Owning organization key
    pub owner: String,
}

impl Consumer {
    /// Create new consumer with a fresh UUID
    pub fn new(name: impl Into<String>, consumer_type: ConsumerType, owner: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            consumer_type,
            owner: owner.into(),
        }
    }
}

/// Key/value flags on products and pools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// No attributes
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set `key`, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the attribute is set to a truthy value (`true`, `yes`, `1`)
    pub fn is_true(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("true" | "yes" | "1")
        )
    }

    /// These attributes overlaid by `overrides`
    pub fn merged_with(&self, overrides: &Attributes) -> Attributes {
        let mut merged = self.clone();
        for (k, v) in &overrides.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no attribute is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Product definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Unique product ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Product attributes
    #[serde(default)]
    pub attributes: Attributes,
    /// Units granted per purchased subscription unit
    #[serde(default = "default_multiplier")]
    pub multiplier: u64,
}

fn default_multiplier() -> u64 {
    1
}

impl Product {
    /// Create new product
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: Attributes::new(),
            multiplier: 1,
        }
    }

    /// Builder-style attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    /// Builder-style multiplier
    pub fn with_multiplier(mut self, multiplier: u64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

/// Pool definition as held by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinition {
    /// Unique pool ID
    pub id: PoolId,
    /// Product granted by this pool
    pub product_id: String,
    /// Owning organization key
    pub owner: String,
    /// Total units
    pub quantity: u64,
    /// Pool-level attribute overrides
    #[serde(default)]
    pub attributes: Attributes,
}

impl PoolDefinition {
    /// Create new pool definition
    pub fn new(
        id: impl Into<String>,
        product_id: impl Into<String>,
        owner: impl Into<String>,
        quantity: u64,
    ) -> Self {
        Self {
            id: id.into(),
            product_id: product_id.into(),
            owner: owner.into(),
            quantity,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute override
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    pub(crate) fn validate(&self) -> EntitlementResult<()> {
        if self.id.trim().is_empty() {
            return Err(EntitlementError::Validation("pool id must not be empty".into()));
        }
        if self.product_id.trim().is_empty() {
            return Err(EntitlementError::Validation("pool product must not be empty".into()));
        }
        Ok(())
    }
}

/// Pool as observed by callers: definition plus consumed units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool id
    pub id: PoolId,
    /// Product the pool grants
    pub product_id: String,
    /// Owner key
    pub owner: String,
    /// Total units
    pub quantity: u64,
    /// Units currently reserved
    pub consumed: u64,
    /// Effective attributes (product overlaid by pool)
    pub attributes: Attributes,
}

impl Pool {
    /// Units still available
    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.consumed)
    }
}

/// Proof that one unit of a pool has been reserved
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    /// Token id
    pub id: Uuid,
    /// Pool holding the unit
    pub pool_id: PoolId,
}

/// Granted entitlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Entitlement id
    pub id: EntitlementId,
    /// Holder
    pub consumer_uuid: ConsumerUuid,
    /// Pool the unit came from
    pub pool_id: PoolId,
    /// Entitled product
    pub product_id: String,
    /// Serial of the certificate currently proving this entitlement
    pub certificate_serial: Serial,
    /// Reservation released on revocation
    pub reservation: ReservationToken,
    /// Grant time
    pub created_at: DateTime<Utc>,
}

/// Signed entitlement certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Certificate serial
    pub serial: Serial,
    /// Consumer signing key, shared by all of the consumer's certificates
    pub key: String,
    /// PEM-framed signed payload
    #[serde(rename = "cert")]
    pub cert_body: String,
    /// Entitlement the certificate proves
    pub entitlement_id: EntitlementId,
    /// Holder
    pub consumer_uuid: ConsumerUuid,
    /// Entitled product
    pub product_id: String,
    /// Start of validity
    pub issued_at: DateTime<Utc>,
    /// End of validity
    pub expires_at: DateTime<Utc>,
}

/// Serial listing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSerial {
    /// Certificate serial
    pub serial: Serial,
    /// End of validity
    pub expires_at: DateTime<Utc>,
}
