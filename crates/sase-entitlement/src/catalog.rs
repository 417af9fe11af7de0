//! Product and Pool Catalog
//!
//! Holds owners, registered consumers, products and pool definitions.
//! Capacity counters are not kept here; see [`crate::ledger`].

use crate::model::{Attributes, Consumer, ConsumerUuid, Owner, PoolDefinition, Product};
use parking_lot::RwLock;
use sase_common::{EntitlementError, EntitlementResult, ResourceKind};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Catalog of entitlement definitions
pub struct Catalog {
    owners: RwLock<HashMap<String, Owner>>,
    consumers: RwLock<HashMap<ConsumerUuid, Consumer>>,
    products: RwLock<HashMap<String, Product>>,
    /// Ordered by pool id so discovery is deterministic
    pools: RwLock<BTreeMap<String, PoolDefinition>>,
}

impl Catalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            products: RwLock::new(HashMap::new()),
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add or replace an owner
    pub fn add_owner(&self, owner: Owner) {
        self.owners.write().insert(owner.key.clone(), owner);
    }

    /// Get owner by key
    pub fn owner(&self, key: &str) -> EntitlementResult<Owner> {
        self.owners
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Owner, key))
    }

    /// Record a consumer registered elsewhere. Its owner must exist.
    pub fn register_consumer(&self, consumer: Consumer) -> EntitlementResult<()> {
        self.owner(&consumer.owner)?;
        self.consumers.write().insert(consumer.uuid, consumer);
        Ok(())
    }

    /// Drop a consumer registration
    pub fn remove_consumer(&self, uuid: &ConsumerUuid) -> EntitlementResult<Consumer> {
        self.consumers
            .write()
            .remove(uuid)
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Consumer, uuid.to_string()))
    }

    /// Get consumer by UUID
    pub fn consumer(&self, uuid: &ConsumerUuid) -> EntitlementResult<Consumer> {
        self.consumers
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Consumer, uuid.to_string()))
    }

    /// Resolve a consumer from its textual UUID.
    ///
    /// A string that is not a UUID cannot name a registered consumer, so it
    /// is reported as not found rather than as a malformed request.
    pub fn resolve_consumer(&self, uuid: &str) -> EntitlementResult<Consumer> {
        let parsed = Uuid::parse_str(uuid.trim())
            .map_err(|_| EntitlementError::not_found(ResourceKind::Consumer, uuid))?;
        self.consumer(&parsed)
    }

    /// Add or replace a product
    pub fn add_product(&self, product: Product) -> EntitlementResult<()> {
        if product.id.trim().is_empty() {
            return Err(EntitlementError::Validation("product id must not be empty".into()));
        }
        if product.multiplier == 0 {
            return Err(EntitlementError::Validation(format!(
                "product {} has a zero multiplier",
                product.id
            )));
        }
        self.products.write().insert(product.id.clone(), product);
        Ok(())
    }

    /// Get product by ID
    pub fn product(&self, id: &str) -> EntitlementResult<Product> {
        self.products
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Product, id))
    }

    /// All products
    pub fn products(&self) -> Vec<Product> {
        let mut products: Vec<_> = self.products.read().values().cloned().collect();
        products.sort_by(|a, b| a.id.cmp(&b.id));
        products
    }

    /// Insert a pool definition. Product and owner must exist; ids are unique.
    ///
    /// Callers that also need capacity tracking go through
    /// [`crate::EntitlementEngine::add_pool`], which opens the ledger entry.
    pub fn insert_pool(&self, pool: PoolDefinition) -> EntitlementResult<()> {
        pool.validate()?;
        self.product(&pool.product_id)?;
        self.owner(&pool.owner)?;

        let mut pools = self.pools.write();
        if pools.contains_key(&pool.id) {
            return Err(EntitlementError::Conflict(format!("pool {} already exists", pool.id)));
        }
        pools.insert(pool.id.clone(), pool);
        Ok(())
    }

    /// Remove a pool definition
    pub fn remove_pool(&self, id: &str) -> EntitlementResult<PoolDefinition> {
        self.pools
            .write()
            .remove(id)
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Pool, id))
    }

    /// Get pool definition by ID
    pub fn pool(&self, id: &str) -> EntitlementResult<PoolDefinition> {
        self.pools
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EntitlementError::not_found(ResourceKind::Pool, id))
    }

    /// Pool definitions matching the optional owner and product, ordered by id
    pub fn pools_matching(&self, owner: Option<&str>, product_id: Option<&str>) -> Vec<PoolDefinition> {
        self.pools
            .read()
            .values()
            .filter(|p| owner.map_or(true, |o| p.owner == o))
            .filter(|p| product_id.map_or(true, |id| p.product_id == id))
            .cloned()
            .collect()
    }

    /// Product attributes overlaid by the pool's own overrides
    pub fn effective_attributes(&self, pool: &PoolDefinition) -> EntitlementResult<Attributes> {
        let product = self.product(&pool.product_id)?;
        Ok(product.attributes.merged_with(&pool.attributes))
    }

    /// Build a pool definition for a purchased subscription.
    ///
    /// The pool quantity is the subscription quantity scaled by the product
    /// multiplier. The definition is returned, not inserted.
    pub fn create_pool_for_subscription(
        &self,
        owner: &str,
        product_id: &str,
        subscription_quantity: u64,
    ) -> EntitlementResult<PoolDefinition> {
        self.owner(owner)?;
        let product = self.product(product_id)?;
        let quantity = subscription_quantity
            .checked_mul(product.multiplier)
            .ok_or_else(|| EntitlementError::Validation("pool quantity overflows".into()))?;

        Ok(PoolDefinition::new(
            format!("pool-{}", Uuid::new_v4().simple()),
            product_id,
            owner,
            quantity,
        ))
    }
}

impl Default for Catalog {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConsumerType;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        catalog.add_owner(Owner::new("acme", "Acme Corp"));
        catalog.add_product(Product::new("monitoring", "Monitoring")).unwrap();
        catalog
            .add_product(Product::new("provisioning", "Provisioning").with_multiplier(4))
            .unwrap();
        catalog
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = catalog();

        assert!(catalog.product("monitoring").is_ok());
        assert!(matches!(
            catalog.product("nope"),
            Err(EntitlementError::NotFound { kind: ResourceKind::Product, .. })
        ));
        assert!(catalog.owner("-1").is_err());
    }

    #[test]
    fn test_consumer_requires_owner() {
        let catalog = catalog();

        let orphan = Consumer::new("orphan", ConsumerType::PhysicalSystem, "missing");
        assert!(catalog.register_consumer(orphan).is_err());

        let consumer = Consumer::new("host1", ConsumerType::PhysicalSystem, "acme");
        catalog.register_consumer(consumer.clone()).unwrap();
        assert_eq!(catalog.resolve_consumer(&consumer.uuid.to_string()).unwrap(), consumer);
    }

    #[test]
    fn test_resolve_garbage_uuid() {
        let catalog = catalog();
        assert!(matches!(
            catalog.resolve_consumer("blah"),
            Err(EntitlementError::NotFound { kind: ResourceKind::Consumer, .. })
        ));
    }

    #[test]
    fn test_pool_insert_and_filter() {
        let catalog = catalog();
        catalog.add_owner(Owner::new("globex", "Globex"));

        catalog.insert_pool(PoolDefinition::new("p2", "monitoring", "acme", 5)).unwrap();
        catalog.insert_pool(PoolDefinition::new("p1", "provisioning", "acme", 5)).unwrap();
        catalog.insert_pool(PoolDefinition::new("p3", "monitoring", "globex", 5)).unwrap();

        let acme: Vec<_> = catalog.pools_matching(Some("acme"), None).into_iter().map(|p| p.id).collect();
        assert_eq!(acme, vec!["p1", "p2"]);

        let monitoring = catalog.pools_matching(None, Some("monitoring"));
        assert_eq!(monitoring.len(), 2);

        assert!(matches!(
            catalog.insert_pool(PoolDefinition::new("p1", "monitoring", "acme", 1)),
            Err(EntitlementError::Conflict(_))
        ));
        assert!(catalog.insert_pool(PoolDefinition::new("p4", "unknown", "acme", 1)).is_err());
    }

    #[test]
    fn test_effective_attributes() {
        let catalog = catalog();
        catalog
            .add_product(Product::new("virtualization_host", "Virt Host").with_attribute("virt_only", "true"))
            .unwrap();

        let pool = PoolDefinition::new("vh", "virtualization_host", "acme", 1).with_attribute("support", "premium");
        let attrs = catalog.effective_attributes(&pool).unwrap();

        assert!(attrs.is_true("virt_only"));
        assert_eq!(attrs.get("support"), Some("premium"));
    }

    #[test]
    fn test_subscription_multiplier() {
        let catalog = catalog();

        let pool = catalog.create_pool_for_subscription("acme", "provisioning", 10).unwrap();
        assert_eq!(pool.quantity, 40);
        assert_eq!(pool.owner, "acme");
        assert!(pool.id.starts_with("pool-"));
    }

    #[test]
    fn test_zero_multiplier_rejected() {
        let catalog = catalog();
        let bad = Product::new("broken", "Broken").with_multiplier(0);
        assert!(matches!(catalog.add_product(bad), Err(EntitlementError::Validation(_))));
    }
}
