//! Entitlement Engine
//!
//! Binds consumers to pools and serves the read side. A bind runs the rule
//! set, reserves one pool unit in the ledger and has the issuer mint the
//! entitlement; a failure after the reservation hands the unit back.

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::import::ProductImporter;
use crate::issuer::EntitlementIssuer;
use crate::ledger::PoolLedger;
use crate::model::{
    Certificate, CertificateSerial, Consumer, Entitlement, EntitlementId, Pool, PoolDefinition, Serial,
};
use crate::query::{PoolQuery, QueryService};
use crate::rules::{RuleSet, Verdict};
use sase_common::{
    AtomicCounter, EntitlementError, EntitlementResult, ErrorResponse, ResourceKind, RuleCode, Timestamp,
};
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Bind outcome counters
#[derive(Debug, Default)]
struct BindStats {
    granted: AtomicCounter,
    denied: AtomicCounter,
    exhausted: AtomicCounter,
    failed: AtomicCounter,
    revoked: AtomicCounter,
    bind_micros: AtomicCounter,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Successful binds
    pub binds_granted: u64,
    /// Binds refused by a rule
    pub binds_denied: u64,
    /// Binds refused for lack of capacity
    pub binds_exhausted: u64,
    /// Binds failing for any other reason
    pub binds_failed: u64,
    /// Entitlements revoked
    pub revocations: u64,
    /// Mean bind latency in microseconds
    pub avg_bind_micros: u64,
    /// Pools tracked by the ledger
    pub pools: usize,
    /// Reservations not yet released
    pub outstanding_reservations: usize,
    /// Live entitlements
    pub entitlements: usize,
}

/// Entitlement engine
pub struct EntitlementEngine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    ledger: Arc<PoolLedger>,
    issuer: Arc<EntitlementIssuer>,
    queries: QueryService,
    stats: BindStats,
}

impl EntitlementEngine {
    /// Create an engine with the configured rule set
    pub fn new(config: EngineConfig) -> EntitlementResult<Self> {
        config.validate()?;
        let rules = config.rules.build()?;
        Self::with_rules(config, rules)
    }

    /// Create an engine with an explicit rule set
    pub fn with_rules(config: EngineConfig, rules: RuleSet) -> EntitlementResult<Self> {
        let catalog = Arc::new(Catalog::new());
        let ledger = Arc::new(PoolLedger::with_max_attempts(config.ledger.max_reserve_attempts));
        let issuer = Arc::new(EntitlementIssuer::new(&config.issuer)?);
        let queries = QueryService::new(catalog.clone(), ledger.clone(), issuer.clone(), rules.clone());

        info!(
            issuer = %config.issuer.name,
            rules = ?rules.names(),
            exhausted_status = config.exhausted_status.status_code(),
            "Entitlement engine ready"
        );

        Ok(Self {
            config,
            catalog,
            ledger,
            issuer,
            queries,
            stats: BindStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared catalog
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Shared pool ledger
    pub fn ledger(&self) -> &Arc<PoolLedger> {
        &self.ledger
    }

    /// Shared issuer
    pub fn issuer(&self) -> &Arc<EntitlementIssuer> {
        &self.issuer
    }

    /// Read-side queries
    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    // =========================================================================
    // Catalog maintenance
    // =========================================================================

    /// Register a pool and open its capacity counter
    pub fn add_pool(&self, definition: PoolDefinition) -> EntitlementResult<Pool> {
        let id = definition.id.clone();
        let quantity = definition.quantity;

        self.catalog.insert_pool(definition)?;
        if let Err(e) = self.ledger.open(&id, quantity) {
            self.catalog.remove_pool(&id)?;
            return Err(e);
        }

        info!(pool = %id, quantity, "Pool added");
        self.queries.pool(&id)
    }

    /// Remove a pool with nothing consumed
    pub fn remove_pool(&self, pool_id: &str) -> EntitlementResult<PoolDefinition> {
        self.ledger.close(pool_id)?;
        let definition = self.catalog.remove_pool(pool_id)?;
        info!(pool = %pool_id, "Pool removed");
        Ok(definition)
    }

    /// Create the pool backing a purchased subscription
    pub fn add_subscription_pool(
        &self,
        owner: &str,
        product_id: &str,
        subscription_quantity: u64,
    ) -> EntitlementResult<Pool> {
        let definition = self
            .catalog
            .create_pool_for_subscription(owner, product_id, subscription_quantity)?;
        self.add_pool(definition)
    }

    /// Import a JSON product export into the catalog
    pub fn import_products<R: Read>(&self, reader: R) -> EntitlementResult<usize> {
        let products = ProductImporter::read(reader)?;
        ProductImporter::store(&self.catalog, products)
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Bind a consumer to one unit of a specific pool.
    ///
    /// Pools of another owner are reported as not found.
    pub fn bind_by_pool(&self, consumer_uuid: &str, pool_id: &str) -> EntitlementResult<Entitlement> {
        let started = Timestamp::now();
        let result = self
            .catalog
            .resolve_consumer(consumer_uuid)
            .and_then(|consumer| {
                let pool = self.catalog.pool(pool_id)?;
                if pool.owner != consumer.owner {
                    return Err(EntitlementError::not_found(ResourceKind::Pool, pool_id));
                }
                let existing = self.issuer.entitlements_for(&consumer.uuid);
                self.queries.eligibility(&consumer, &pool, &existing)?.into_result()?;
                self.reserve_and_issue(&consumer, &pool)
            });
        self.record(consumer_uuid, &result, started);
        result
    }

    /// Bind a consumer to any eligible pool of the product in its owner.
    ///
    /// Pools are tried in id order. When none can grant a unit, exhaustion
    /// of an eligible pool is reported before a rule denial.
    pub fn bind_by_product(&self, consumer_uuid: &str, product_id: &str) -> EntitlementResult<Entitlement> {
        let started = Timestamp::now();
        let result = self
            .catalog
            .resolve_consumer(consumer_uuid)
            .and_then(|consumer| self.bind_first_available(&consumer, product_id));
        self.record(consumer_uuid, &result, started);
        result
    }

    fn bind_first_available(&self, consumer: &Consumer, product_id: &str) -> EntitlementResult<Entitlement> {
        self.catalog.product(product_id)?;
        let pools = self
            .catalog
            .pools_matching(Some(consumer.owner.as_str()), Some(product_id));
        if pools.is_empty() {
            return Err(EntitlementError::not_found(
                ResourceKind::Pool,
                format!("{}/{}", consumer.owner, product_id),
            ));
        }

        let existing = self.issuer.entitlements_for(&consumer.uuid);
        let mut first_denial: Option<RuleCode> = None;
        let mut exhausted: Option<String> = None;

        for pool in &pools {
            if let Verdict::Deny(code) = self.queries.eligibility(consumer, pool, &existing)? {
                first_denial.get_or_insert(code);
                continue;
            }
            match self.reserve_and_issue(consumer, pool) {
                Err(EntitlementError::CapacityExhausted { pool_id }) => {
                    debug!(pool = %pool_id, "Pool full, trying next");
                    exhausted = Some(pool_id);
                }
                Err(EntitlementError::RuleViolation(code)) => {
                    first_denial.get_or_insert(code);
                }
                other => return other,
            }
        }

        match (exhausted, first_denial) {
            (Some(pool_id), _) => Err(EntitlementError::CapacityExhausted { pool_id }),
            (None, Some(code)) => Err(EntitlementError::RuleViolation(code)),
            (None, None) => Err(EntitlementError::not_found(ResourceKind::Pool, product_id)),
        }
    }

    /// Reserve a unit and issue against it. Eligibility is evaluated again
    /// under the issuer lock, so a concurrent bind by the same consumer is
    /// seen by the multi-entitlement rule.
    fn reserve_and_issue(&self, consumer: &Consumer, pool: &PoolDefinition) -> EntitlementResult<Entitlement> {
        let product = self.catalog.product(&pool.product_id)?;
        let token = self.ledger.reserve(&pool.id)?;

        let issued = self.issuer.issue_if(consumer, token.clone(), &product, |held| {
            self.queries.eligibility(consumer, pool, held)
        });
        match issued {
            Ok(entitlement) => Ok(entitlement),
            Err(e) => {
                if let Err(release) = self.ledger.release(&token) {
                    error!(pool = %pool.id, error = %release, "Failed to return reserved unit");
                }
                Err(e)
            }
        }
    }

    fn record(&self, consumer: &str, result: &EntitlementResult<Entitlement>, started: Timestamp) {
        self.stats.bind_micros.add(started.elapsed_micros());

        match result {
            Ok(_) => {
                self.stats.granted.inc();
            }
            Err(EntitlementError::RuleViolation(code)) => {
                self.stats.denied.inc();
                warn!(consumer, code = %code, "Bind denied by rule");
            }
            Err(EntitlementError::CapacityExhausted { pool_id }) => {
                self.stats.exhausted.inc();
                warn!(consumer, pool = %pool_id, "Bind failed, pool exhausted");
            }
            Err(e) => {
                self.stats.failed.inc();
                debug!(consumer, error = %e, "Bind failed");
            }
        }
    }

    // =========================================================================
    // Revocation and regeneration
    // =========================================================================

    /// Revoke one entitlement, returning its unit to the pool
    pub fn revoke(&self, entitlement_id: &EntitlementId) -> EntitlementResult<Entitlement> {
        let entitlement = self.issuer.revoke(entitlement_id, &self.ledger)?;
        self.stats.revoked.inc();
        Ok(entitlement)
    }

    /// Revoke everything a consumer holds and drop its registration
    pub fn unregister_consumer(&self, consumer_uuid: &str) -> EntitlementResult<usize> {
        let consumer = self.catalog.resolve_consumer(consumer_uuid)?;
        let revoked = self.issuer.revoke_consumer(&consumer.uuid, &self.ledger)?;
        self.stats.revoked.add(revoked.len() as u64);
        self.catalog.remove_consumer(&consumer.uuid)?;

        info!(consumer = %consumer.uuid, revoked = revoked.len(), "Consumer unregistered");
        Ok(revoked.len())
    }

    /// Reissue every certificate of a product
    pub fn regenerate_certificates_for_product(&self, product_id: &str) -> EntitlementResult<usize> {
        self.catalog.product(product_id)?;
        let count = self.issuer.regenerate_for_product(product_id)?;
        info!(product = %product_id, count, "Regenerated product certificates");
        Ok(count)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Pools visible under `query`; see [`QueryService::list_pools`]
    pub fn list_pools(&self, query: &PoolQuery) -> EntitlementResult<Vec<Pool>> {
        self.queries.list_pools(query)
    }

    /// Consumer's certificates, optionally restricted to `serials`
    pub fn certificates_for(&self, consumer_uuid: &str, serials: Option<&[Serial]>) -> EntitlementResult<Vec<Certificate>> {
        self.queries.certificates_for(consumer_uuid, serials)
    }

    /// Serials and expiry of the consumer's certificates
    pub fn certificate_serials_for(&self, consumer_uuid: &str) -> EntitlementResult<Vec<CertificateSerial>> {
        self.queries.certificate_serials_for(consumer_uuid)
    }

    /// Consumer's entitlements, optionally for one product
    pub fn entitlements_for(&self, consumer_uuid: &str, product_id: Option<&str>) -> EntitlementResult<Vec<Entitlement>> {
        self.queries.entitlements_for(consumer_uuid, product_id)
    }

    /// Map a failure to the transport status and body
    pub fn respond(&self, err: &EntitlementError) -> ErrorResponse {
        let response = err.to_response(self.config.exhausted_status);
        if response.status >= 500 {
            error!(status = response.status, error = %err, "Internal failure");
        }
        response
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        let granted = self.stats.granted.get();
        let denied = self.stats.denied.get();
        let exhausted = self.stats.exhausted.get();
        let failed = self.stats.failed.get();
        let attempts = granted + denied + exhausted + failed;

        EngineStats {
            binds_granted: granted,
            binds_denied: denied,
            binds_exhausted: exhausted,
            binds_failed: failed,
            revocations: self.stats.revoked.get(),
            avg_bind_micros: self.stats.bind_micros.get().checked_div(attempts).unwrap_or(0),
            pools: self.ledger.len(),
            outstanding_reservations: self.ledger.outstanding(),
            entitlements: self.issuer.entitlement_count(),
        }
    }
}
