//! Entitlement Engine
//!
//! Grants consumers entitlements out of finite subscription pools, enforces
//! eligibility rules and issues signed certificates proving each grant.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ENTITLEMENT ENGINE                             │
//! │                                                                         │
//! │   bind_by_product / bind_by_pool          list_pools / certificates_for │
//! │              │                                        │                 │
//! │  ┌───────────▼───────────┐              ┌─────────────▼──────────────┐  │
//! │  │      RULE ENGINE      │◄─────────────│       QUERY SERVICE        │  │
//! │  │ virt_only │ type │ multi             │ pools │ ents │ certs       │  │
//! │  └───────────┬───────────┘              └──┬──────────┬──────────┬───┘  │
//! │              │ allow                       │          │          │      │
//! │  ┌───────────▼───────────┐  ┌──────────────▼───┐  ┌───▼──────────▼───┐  │
//! │  │      POOL LEDGER      │  │     CATALOG      │  │ ENTITLEMENT      │  │
//! │  │ per-pool CAS counters │  │ owners consumers │  │ ISSUER           │  │
//! │  │ reservation tokens    │  │ products pools   │  │ serials │ keys   │  │
//! │  └───────────┬───────────┘  └──────────────────┘  └────────▲─────────┘  │
//! │              │ token                                        │           │
//! │              └──────────────────────────────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod import;
pub mod issuer;
pub mod ledger;
pub mod model;
pub mod query;
pub mod rules;
pub mod service;
pub mod telemetry;

pub use catalog::Catalog;
pub use config::{EngineConfig, IssuerConfig, LedgerConfig, RulesConfig};
pub use import::ProductImporter;
pub use issuer::{CertificatePayload, EntitlementIssuer};
pub use ledger::PoolLedger;
pub use model::{
    Attributes, Certificate, CertificateSerial, Consumer, ConsumerType, ConsumerUuid, Entitlement,
    EntitlementId, Owner, Pool, PoolDefinition, PoolId, Product, ReservationToken, Serial,
};
pub use query::{PoolQuery, QueryService};
pub use rules::{Rule, RuleContext, RuleEngine, RuleSet, Verdict};
pub use sase_common::{EntitlementError, EntitlementResult, ErrorResponse, ExhaustedStatus, RuleCode};
pub use service::{EngineStats, EntitlementEngine};
pub use telemetry::init_tracing;
