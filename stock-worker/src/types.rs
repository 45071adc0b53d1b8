use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identity of a reading, used to detect broker redelivery. Readings in one
/// batch share the batch timestamp, so a sensor reporting the same product
/// twice in one batch maps to a single key on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadingKey {
    pub sensor_id: String,
    pub product_id: i32,
    pub batch_timestamp: DateTime<Utc>,
}

/// One validated sensor reading. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub sensor_id: String,
    pub product_id: i32,
    /// Absolute current count reported by the sensor, never negative.
    pub quantity: i32,
    pub batch_timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            sensor_id: self.sensor_id.clone(),
            product_id: self.product_id,
            batch_timestamp: self.batch_timestamp,
        }
    }
}

/// One broker message worth of readings. Acknowledged as a unit; readings
/// succeed or fail independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingBatch {
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<SensorReading>,
    /// Readings excluded during parsing for field-level violations.
    pub rejected: usize,
}

/// Product row as exposed by the data-access collaborator. The pipeline
/// only ever mutates `stock_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Product {
    pub id: i32,
    pub name: String,
    pub stock_quantity: i32,
    pub low_stock_threshold: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    Applied,
    Duplicate,
    ProductNotFound,
    StoreUnavailable,
}

/// Outcome of attempting to apply one reading to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockUpdateResult {
    pub product_id: i32,
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub applied: bool,
    pub reason: UpdateReason,
}

impl StockUpdateResult {
    pub fn applied(product_id: i32, previous: i32, new: i32) -> Self {
        Self {
            product_id,
            previous_quantity: previous,
            new_quantity: new,
            applied: true,
            reason: UpdateReason::Applied,
        }
    }

    pub fn skipped(product_id: i32, reason: UpdateReason) -> Self {
        Self {
            product_id,
            previous_quantity: 0,
            new_quantity: 0,
            applied: false,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Low,
    Out,
}

/// Alert handed to the notifier when stock crosses a threshold. Not
/// persisted beyond delivery attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    pub product_id: i32,
    pub level: NotificationLevel,
    pub triggered_at: DateTime<Utc>,
}
