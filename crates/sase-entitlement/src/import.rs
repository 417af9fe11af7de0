//! Product import from upstream manifests

use crate::catalog::Catalog;
use crate::model::Product;
use sase_common::{EntitlementError, EntitlementResult};
use std::io::Read;
use tracing::{debug, info};

/// Reads product definitions exported by an upstream entitlement server
pub struct ProductImporter;

impl ProductImporter {
    /// Parse a JSON array of products.
    ///
    /// Multipliers were already applied upstream, so imported products are
    /// reset to a multiplier of 1.
    pub fn read<R: Read>(reader: R) -> EntitlementResult<Vec<Product>> {
        let mut products: Vec<Product> = serde_json::from_reader(reader)
            .map_err(|e| EntitlementError::Validation(format!("malformed product export: {e}")))?;

        for product in &mut products {
            if product.id.trim().is_empty() {
                return Err(EntitlementError::Validation("imported product without id".into()));
            }
            product.multiplier = 1;
        }

        debug!(count = products.len(), "Parsed product export");
        Ok(products)
    }

    /// Create or update each product in the catalog
    pub fn store(catalog: &Catalog, products: Vec<Product>) -> EntitlementResult<usize> {
        let count = products.len();
        for product in products {
            catalog.add_product(product)?;
        }
        info!(count, "Imported products");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"[
        {"id": "monitoring", "name": "Monitoring", "multiplier": 10},
        {"id": "virtualization_host", "name": "Virtualization Host",
         "attributes": {"virt_only": "true"}}
    ]"#;

    #[test]
    fn test_import_resets_multiplier() {
        let products = ProductImporter::read(EXPORT.as_bytes()).unwrap();

        assert_eq!(products.len(), 2);
        assert!(products.iter().all(|p| p.multiplier == 1));
        assert!(products[1].attributes.is_true("virt_only"));
    }

    #[test]
    fn test_store_updates_existing() {
        let catalog = Catalog::new();
        catalog.add_product(Product::new("monitoring", "Old Name")).unwrap();

        let products = ProductImporter::read(EXPORT.as_bytes()).unwrap();
        assert_eq!(ProductImporter::store(&catalog, products).unwrap(), 2);

        assert_eq!(catalog.product("monitoring").unwrap().name, "Monitoring");
        assert!(catalog.product("virtualization_host").is_ok());
    }

    #[test]
    fn test_malformed_export() {
        assert!(matches!(
            ProductImporter::read("{not json".as_bytes()),
            Err(EntitlementError::Validation(_))
        ));
        assert!(ProductImporter::read(r#"[{"id": " ", "name": "x"}]"#.as_bytes()).is_err());
    }
}
