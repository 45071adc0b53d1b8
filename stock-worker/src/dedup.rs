use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;

use crate::error::StoreError;
use crate::types::ReadingKey;

/// Durable set of reading keys that have already been applied to the store.
///
/// This is the only pipeline state that must survive restarts: it is what
/// makes broker redelivery safe. Keys are marked applied strictly after the
/// reconciler confirms the stock write, never before.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_applied(&self, key: &ReadingKey) -> Result<bool, StoreError>;

    /// Atomic insert-if-absent. Returns true when the key was newly marked,
    /// false when a concurrent worker got there first.
    async fn mark_applied(&self, key: &ReadingKey) -> Result<bool, StoreError>;

    /// Drop marks older than the retention window, bounding table growth.
    /// Returns the number of purged keys.
    async fn purge_older_than(&self, window: Duration) -> Result<u64, StoreError>;
}

/// Applied-key set backed by the `sensor_reading_marks` Postgres table.
pub struct PostgresDedupStore {
    pool: PgPool,
}

impl PostgresDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for PostgresDedupStore {
    async fn is_applied(&self, key: &ReadingKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM sensor_reading_marks
             WHERE sensor_id = $1 AND product_id = $2 AND batch_timestamp = $3",
        )
        .bind(&key.sensor_id)
        .bind(key.product_id)
        .bind(key.batch_timestamp)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_applied(&self, key: &ReadingKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sensor_reading_marks (sensor_id, product_id, batch_timestamp)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(&key.sensor_id)
        .bind(key.product_id)
        .bind(key.batch_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_older_than(&self, window: Duration) -> Result<u64, StoreError> {
        let cutoff: DateTime<Utc> = Utc::now() - window;
        let result = sqlx::query("DELETE FROM sensor_reading_marks WHERE applied_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// In-memory applied-key set for tests.
#[derive(Default)]
pub struct MemoryDedupStore {
    keys: Mutex<HashMap<ReadingKey, DateTime<Utc>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().expect("poisoned dedup lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn is_applied(&self, key: &ReadingKey) -> Result<bool, StoreError> {
        Ok(self
            .keys
            .lock()
            .expect("poisoned dedup lock")
            .contains_key(key))
    }

    async fn mark_applied(&self, key: &ReadingKey) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().expect("poisoned dedup lock");
        Ok(keys.insert(key.clone(), Utc::now()).is_none())
    }

    async fn purge_older_than(&self, window: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - window;
        let mut keys = self.keys.lock().expect("poisoned dedup lock");
        let before = keys.len();
        keys.retain(|_, applied_at| *applied_at >= cutoff);
        Ok((before - keys.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sensor: &str, product: i32) -> ReadingKey {
        ReadingKey {
            sensor_id: sensor.to_owned(),
            product_id: product,
            batch_timestamp: "2025-11-26T14:05:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn marking_is_insert_if_absent() {
        let store = MemoryDedupStore::new();
        let k = key("sensor_01", 1);

        assert!(!store.is_applied(&k).await.unwrap());
        assert!(store.mark_applied(&k).await.unwrap());
        // A second mark reports the key as already present.
        assert!(!store.mark_applied(&k).await.unwrap());
        assert!(store.is_applied(&k).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let store = MemoryDedupStore::new();
        assert!(store.mark_applied(&key("sensor_01", 1)).await.unwrap());
        assert!(store.mark_applied(&key("sensor_01", 2)).await.unwrap());
        assert!(store.mark_applied(&key("sensor_02", 1)).await.unwrap());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn purge_respects_the_retention_window() {
        let store = MemoryDedupStore::new();
        store.mark_applied(&key("sensor_01", 1)).await.unwrap();

        // Everything is fresh, a 1h window purges nothing.
        assert_eq!(store.purge_older_than(Duration::hours(1)).await.unwrap(), 0);
        // A zero-width window purges all of it.
        assert_eq!(store.purge_older_than(Duration::zero()).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
