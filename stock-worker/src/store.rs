use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use crate::error::StoreError;
use crate::types::Product;

/// Data-access contract for the product inventory, owned by the web
/// application. The pipeline reads products and writes `stock_quantity`
/// through a compare-and-set, nothing else.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError>;

    /// Single-statement conditional write: sets `stock_quantity` to `new`
    /// only if it still equals `expected`. Returns whether the row changed.
    async fn compare_and_set_stock(
        &self,
        id: i32,
        expected: i32,
        new: i32,
    ) -> Result<bool, StoreError>;
}

pub struct PostgresProductStore {
    pool: PgPool,
    /// Calls exceeding this are treated as failed, not as success.
    timeout: Duration,
}

impl PostgresProductStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl ProductStore for PostgresProductStore {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError> {
        let query = sqlx::query_as::<_, Product>(
            "SELECT id, name, stock_quantity, low_stock_threshold
             FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool);

        tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from)
    }

    async fn compare_and_set_stock(
        &self,
        id: i32,
        expected: i32,
        new: i32,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            "UPDATE products SET stock_quantity = $3
             WHERE id = $1 AND stock_quantity = $2",
        )
        .bind(id)
        .bind(expected)
        .bind(new)
        .execute(&self.pool);

        let result = tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| StoreError::Timeout)??;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory product store for tests, with a switch to simulate the store
/// being unreachable.
#[derive(Default)]
pub struct MemoryProductStore {
    products: Mutex<HashMap<i32, Product>>,
    unavailable: AtomicBool,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, product: Product) {
        self.products
            .lock()
            .expect("poisoned product lock")
            .insert(product.id, product);
    }

    pub fn stock_of(&self, id: i32) -> Option<i32> {
        self.products
            .lock()
            .expect("poisoned product lock")
            .get(&id)
            .map(|p| p.stock_quantity)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store is down".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError> {
        self.check_available()?;
        Ok(self
            .products
            .lock()
            .expect("poisoned product lock")
            .get(&id)
            .cloned())
    }

    async fn compare_and_set_stock(
        &self,
        id: i32,
        expected: i32,
        new: i32,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut products = self.products.lock().expect("poisoned product lock");
        match products.get_mut(&id) {
            Some(product) if product.stock_quantity == expected => {
                product.stock_quantity = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: i32, stock: i32) -> Product {
        Product {
            id,
            name: format!("product-{id}"),
            stock_quantity: stock,
            low_stock_threshold: 5,
        }
    }

    #[tokio::test]
    async fn cas_only_applies_on_matching_expectation() {
        let store = MemoryProductStore::new();
        store.insert(product(1, 10));

        assert!(store.compare_and_set_stock(1, 10, 7).await.unwrap());
        assert_eq!(store.stock_of(1), Some(7));

        // Stale expectation leaves the row untouched.
        assert!(!store.compare_and_set_stock(1, 10, 3).await.unwrap());
        assert_eq!(store.stock_of(1), Some(7));
    }

    #[tokio::test]
    async fn unknown_product_is_none() {
        let store = MemoryProductStore::new();
        assert_eq!(store.get_product(99).await.unwrap(), None);
        assert!(!store.compare_and_set_stock(99, 0, 1).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_errors_out() {
        let store = MemoryProductStore::new();
        store.insert(product(1, 10));
        store.set_unavailable(true);

        assert!(store.get_product(1).await.is_err());
        assert!(store.compare_and_set_stock(1, 10, 7).await.is_err());

        store.set_unavailable(false);
        assert!(store.get_product(1).await.unwrap().is_some());
    }
}
