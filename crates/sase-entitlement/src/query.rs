//! Read-side queries over pools, entitlements and certificates

use crate::catalog::Catalog;
use crate::issuer::EntitlementIssuer;
use crate::ledger::PoolLedger;
use crate::model::{Certificate, CertificateSerial, Consumer, Entitlement, Pool, PoolDefinition, Serial};
use crate::rules::{RuleContext, RuleEngine, RuleSet, Verdict};
use sase_common::{EntitlementError, EntitlementResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Pool discovery filter. At most one of `consumer` and `owner`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolQuery {
    /// Consumer uuid; only pools it may bind
    pub consumer: Option<String>,
    /// Restrict to one product
    pub product: Option<String>,
    /// Owner key
    pub owner: Option<String>,
}

impl PoolQuery {
    /// Unfiltered query
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope to a consumer
    pub fn consumer(mut self, uuid: impl Into<String>) -> Self {
        self.consumer = Some(uuid.into());
        self
    }

    /// Filter by product
    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product = Some(product_id.into());
        self
    }

    /// Scope to an owner
    pub fn owner(mut self, key: impl Into<String>) -> Self {
        self.owner = Some(key.into());
        self
    }

    /// Reject malformed filters before any lookup
    pub fn validate(&self) -> EntitlementResult<()> {
        if self.consumer.is_some() && self.owner.is_some() {
            return Err(EntitlementError::Validation(
                "consumer and owner filters are mutually exclusive".into(),
            ));
        }
        for (name, value) in [
            ("consumer", &self.consumer),
            ("product", &self.product),
            ("owner", &self.owner),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(EntitlementError::Validation(format!("{name} filter is blank")));
            }
        }
        Ok(())
    }
}

/// Query service
#[derive(Clone)]
pub struct QueryService {
    catalog: Arc<Catalog>,
    ledger: Arc<PoolLedger>,
    issuer: Arc<EntitlementIssuer>,
    rules: RuleSet,
}

impl QueryService {
    /// Query service over shared engine components
    pub fn new(
        catalog: Arc<Catalog>,
        ledger: Arc<PoolLedger>,
        issuer: Arc<EntitlementIssuer>,
        rules: RuleSet,
    ) -> Self {
        Self {
            catalog,
            ledger,
            issuer,
            rules,
        }
    }

    /// Rule set used for consumer-scoped discovery and binds
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Run the rule set for `consumer` against `pool`
    pub fn eligibility(
        &self,
        consumer: &Consumer,
        pool: &PoolDefinition,
        existing: &[Entitlement],
    ) -> EntitlementResult<Verdict> {
        let product = self.catalog.product(&pool.product_id)?;
        let attributes = product.attributes.merged_with(&pool.attributes);
        let ctx = RuleContext {
            consumer,
            pool,
            product: &product,
            attributes: &attributes,
            existing,
        };
        Ok(RuleEngine::evaluate(&self.rules, &ctx))
    }

    fn view(&self, definition: PoolDefinition, consumed: u64) -> EntitlementResult<Pool> {
        let attributes = self.catalog.effective_attributes(&definition)?;
        Ok(Pool {
            id: definition.id,
            product_id: definition.product_id,
            owner: definition.owner,
            quantity: definition.quantity,
            consumed,
            attributes,
        })
    }

    /// Get a single pool
    pub fn pool(&self, id: &str) -> EntitlementResult<Pool> {
        let definition = self.catalog.pool(id)?;
        let consumed = self.ledger.consumed(id)?;
        self.view(definition, consumed)
    }

    /// Discover pools.
    ///
    /// Consumer-scoped queries return the consumer owner's pools the rule
    /// set allows; owner-scoped queries return all of the owner's pools.
    pub fn list_pools(&self, query: &PoolQuery) -> EntitlementResult<Vec<Pool>> {
        query.validate()?;
        let product = query.product.as_deref();

        let definitions = match (&query.consumer, &query.owner) {
            (Some(uuid), _) => {
                let consumer = self.catalog.resolve_consumer(uuid)?;
                let existing = self.issuer.entitlements_for(&consumer.uuid);

                let mut allowed = Vec::new();
                for pool in self.catalog.pools_matching(Some(consumer.owner.as_str()), product) {
                    if self.eligibility(&consumer, &pool, &existing)?.is_allowed() {
                        allowed.push(pool);
                    }
                }
                allowed
            }
            (None, Some(owner)) => {
                self.catalog.owner(owner)?;
                self.catalog.pools_matching(Some(owner.as_str()), product)
            }
            (None, None) => self.catalog.pools_matching(None, product),
        };

        let mut pools = Vec::with_capacity(definitions.len());
        for definition in definitions {
            // Inserted in the catalog but not opened in the ledger yet
            let Ok(consumed) = self.ledger.consumed(&definition.id) else {
                debug!(pool = %definition.id, "Skipping pool without capacity counter");
                continue;
            };
            pools.push(self.view(definition, consumed)?);
        }
        Ok(pools)
    }

    /// Consumer's certificates, optionally restricted to `serials`.
    ///
    /// An empty serial list is the same as no filter.
    pub fn certificates_for(&self, consumer: &str, serials: Option<&[Serial]>) -> EntitlementResult<Vec<Certificate>> {
        let consumer = self.catalog.resolve_consumer(consumer)?;
        let certificates = self.issuer.certificates_for(&consumer.uuid);

        match serials {
            Some(serials) if !serials.is_empty() => {
                let wanted: HashSet<_> = serials.iter().copied().collect();
                Ok(certificates.into_iter().filter(|c| wanted.contains(&c.serial)).collect())
            }
            _ => Ok(certificates),
        }
    }

    /// Serial and expiry of each of the consumer's certificates
    pub fn certificate_serials_for(&self, consumer: &str) -> EntitlementResult<Vec<CertificateSerial>> {
        let consumer = self.catalog.resolve_consumer(consumer)?;
        Ok(self.issuer.serials_for(&consumer.uuid))
    }

    /// Consumer's entitlements, optionally for one product
    pub fn entitlements_for(&self, consumer: &str, product_id: Option<&str>) -> EntitlementResult<Vec<Entitlement>> {
        let consumer = self.catalog.resolve_consumer(consumer)?;
        let entitlements = self.issuer.entitlements_for(&consumer.uuid);

        Ok(match product_id {
            Some(product_id) => entitlements.into_iter().filter(|e| e.product_id == product_id).collect(),
            None => entitlements,
        })
    }
}
