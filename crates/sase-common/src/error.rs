//! Error types for the entitlement engine

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Machine-readable rule failure code, e.g. `rulefailed.virt.ents.only.for.physical.systems`.
///
/// Codes are opaque dot-separated identifiers. Callers match on the exact
/// string, so the value is carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleCode(Cow<'static, str>);

impl RuleCode {
    /// Code known at compile time
    pub const fn from_static(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }

    /// Code supplied at runtime
    pub fn new(code: impl Into<String>) -> Self {
        Self(Cow::Owned(code.into()))
    }

    /// Raw code string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of record a lookup failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Account owning consumers and pools
    Owner,
    /// Registered consumer
    Consumer,
    /// Catalog product
    Product,
    /// Subscription pool
    Pool,
    /// Granted entitlement
    Entitlement,
    /// Issued certificate
    Certificate,
}

impl ResourceKind {
    /// Lowercase name used in messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Consumer => "consumer",
            Self::Product => "product",
            Self::Pool => "pool",
            Self::Entitlement => "entitlement",
            Self::Certificate => "certificate",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entitlement engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntitlementError {
    /// Malformed or mutually exclusive request parameters
    #[error("invalid request: {0}")]
    Validation(String),

    /// Reference to a record that does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record looked up
        kind: ResourceKind,
        /// Identifier that failed to resolve
        id: String,
    },

    /// Business rule denial
    #[error("rule violation: {0}")]
    RuleViolation(RuleCode),

    /// Pool has no remaining units
    #[error("pool {pool_id} has no remaining capacity")]
    CapacityExhausted {
        /// Exhausted pool
        pool_id: String,
    },

    /// Concurrent mutation retries exhausted
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Record encoding or storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl EntitlementError {
    /// Shorthand for [`EntitlementError::NotFound`]
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Shorthand for a rule denial with a static code
    pub fn rule(code: &'static str) -> Self {
        Self::RuleViolation(RuleCode::from_static(code))
    }

    /// Transport status code for this error under the given exhaustion policy
    pub fn status(&self, exhausted: ExhaustedStatus) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::RuleViolation(_) => 403,
            Self::CapacityExhausted { .. } => exhausted.status_code(),
            Self::Conflict(_) => 409,
            Self::Config(_) | Self::Storage(_) => 500,
        }
    }

    /// Response body. Rule violations carry only the bare code.
    pub fn body(&self) -> String {
        match self {
            Self::RuleViolation(code) => code.to_string(),
            other => other.to_string(),
        }
    }

    /// Status and body for the transport layer
    pub fn to_response(&self, exhausted: ExhaustedStatus) -> ErrorResponse {
        ErrorResponse {
            status: self.status(exhausted),
            body: self.body(),
        }
    }
}

/// Deployment policy for reporting an exhausted pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedStatus {
    /// 409 Conflict
    #[default]
    Conflict,
    /// 403 Forbidden
    Forbidden,
}

impl ExhaustedStatus {
    /// HTTP status reported for exhaustion
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Conflict => 409,
            Self::Forbidden => 403,
        }
    }
}

impl std::str::FromStr for ExhaustedStatus {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conflict" | "409" => Ok(Self::Conflict),
            "forbidden" | "403" => Ok(Self::Forbidden),
            other => Err(EntitlementError::Config(format!(
                "unknown exhausted status policy: {other}"
            ))),
        }
    }
}

/// Failure as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,
    /// Human-readable message
    pub body: String,
}

/// Result type for the entitlement engine
pub type EntitlementResult<T> = Result<T, EntitlementError>;
