use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::store::ProductStore;
use crate::types::{SensorReading, StockUpdateResult, UpdateReason};

/// Number of compare-and-set rounds before a reading is handed back to the
/// redelivery path. Conflicts only happen when another writer touches the
/// same product between our read and our write.
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Applies validated readings to the inventory store.
///
/// The sensor reports an absolute current count, so the reconciler
/// overwrites `stock_quantity` with the reported value rather than
/// applying a delta. Readings for the same product are serialized through
/// a per-product mutex; different products proceed concurrently.
pub struct StockReconciler {
    store: Arc<dyn ProductStore>,
    product_locks: Mutex<HashMap<i32, Arc<tokio::sync::Mutex<()>>>>,
}

impl StockReconciler {
    pub fn new(store: Arc<dyn ProductStore>) -> Self {
        Self {
            store,
            product_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, product_id: i32) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.product_locks.lock().expect("poisoned lock map");
        locks
            .entry(product_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Apply one reading, producing a `StockUpdateResult` either way.
    ///
    /// On `StoreUnavailable` the caller must leave the reading unmarked in
    /// the dedup store so broker redelivery retries it.
    pub async fn apply(&self, reading: &SensorReading) -> StockUpdateResult {
        let product_id = reading.product_id;
        let lock = self.lock_for(product_id);
        let _guard = lock.lock().await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let product = match self.store.get_product(product_id).await {
                Ok(Some(product)) => product,
                Ok(None) => {
                    return StockUpdateResult::skipped(product_id, UpdateReason::ProductNotFound)
                }
                Err(error) => {
                    warn!(product_id, %error, "product read failed");
                    return StockUpdateResult::skipped(product_id, UpdateReason::StoreUnavailable);
                }
            };

            // Parsing guarantees a non-negative quantity; the store's CHECK
            // constraint backstops the invariant.
            let new_quantity = reading.quantity;

            match self
                .store
                .compare_and_set_stock(product_id, product.stock_quantity, new_quantity)
                .await
            {
                Ok(true) => {
                    return StockUpdateResult::applied(
                        product_id,
                        product.stock_quantity,
                        new_quantity,
                    );
                }
                Ok(false) => {
                    // Someone else moved the count, re-read and try again.
                    metrics::counter!("ingest_cas_conflicts").increment(1);
                }
                Err(error) => {
                    warn!(product_id, %error, "stock write failed");
                    return StockUpdateResult::skipped(product_id, UpdateReason::StoreUnavailable);
                }
            }
        }

        warn!(product_id, "compare-and-set budget exhausted");
        StockUpdateResult::skipped(product_id, UpdateReason::StoreUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryProductStore;
    use crate::types::Product;
    use chrono::Utc;

    fn reading(product_id: i32, quantity: i32) -> SensorReading {
        SensorReading {
            sensor_id: "sensor_01".to_owned(),
            product_id,
            quantity,
            batch_timestamp: Utc::now(),
        }
    }

    fn store_with(products: &[(i32, i32)]) -> Arc<MemoryProductStore> {
        let store = Arc::new(MemoryProductStore::new());
        for &(id, stock) in products {
            store.insert(Product {
                id,
                name: format!("product-{id}"),
                stock_quantity: stock,
                low_stock_threshold: 5,
            });
        }
        store
    }

    #[tokio::test]
    async fn overwrites_with_the_reported_level() {
        let store = store_with(&[(1, 40)]);
        let reconciler = StockReconciler::new(store.clone());

        let result = reconciler.apply(&reading(1, 12)).await;

        assert!(result.applied);
        assert_eq!(result.reason, UpdateReason::Applied);
        assert_eq!(result.previous_quantity, 40);
        assert_eq!(result.new_quantity, 12);
        assert_eq!(store.stock_of(1), Some(12));
    }

    #[tokio::test]
    async fn unknown_product_is_skipped() {
        let store = store_with(&[]);
        let reconciler = StockReconciler::new(store);

        let result = reconciler.apply(&reading(7, 3)).await;

        assert!(!result.applied);
        assert_eq!(result.reason, UpdateReason::ProductNotFound);
    }

    #[tokio::test]
    async fn store_outage_maps_to_store_unavailable() {
        let store = store_with(&[(1, 40)]);
        store.set_unavailable(true);
        let reconciler = StockReconciler::new(store.clone());

        let result = reconciler.apply(&reading(1, 12)).await;

        assert!(!result.applied);
        assert_eq!(result.reason, UpdateReason::StoreUnavailable);
        store.set_unavailable(false);
        assert_eq!(store.stock_of(1), Some(40));
    }

    #[tokio::test]
    async fn same_product_updates_serialize_to_last_wins() {
        let store = store_with(&[(1, 100)]);
        let reconciler = Arc::new(StockReconciler::new(store.clone()));

        // Race a pile of updates for one product; every CAS must land and
        // the final count must be one of the reported levels, not a blend.
        let mut handles = Vec::new();
        for quantity in [10, 20, 30, 40, 50] {
            let reconciler = reconciler.clone();
            handles.push(tokio::spawn(async move {
                reconciler.apply(&reading(1, quantity)).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.applied);
        }

        let last = store.stock_of(1).unwrap();
        assert!([10, 20, 30, 40, 50].contains(&last));
    }

    #[tokio::test]
    async fn different_products_do_not_block_each_other() {
        let store = store_with(&[(1, 5), (2, 9)]);
        let reconciler = Arc::new(StockReconciler::new(store.clone()));

        let first = reading(1, 3);
        let second = reading(2, 4);
        let (a, b) = tokio::join!(reconciler.apply(&first), reconciler.apply(&second));

        assert!(a.applied && b.applied);
        assert_eq!(store.stock_of(1), Some(3));
        assert_eq!(store.stock_of(2), Some(4));
    }
}
