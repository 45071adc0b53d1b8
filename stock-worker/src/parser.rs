use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;
use crate::types::{ReadingBatch, SensorReading};

/// Wire shape of one broker message. `lecturas` entries are decoded one by
/// one so a single bad reading cannot take down its siblings.
#[derive(Debug, Deserialize)]
struct RawBatch {
    timestamp: String,
    lecturas: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawReading {
    sensor_id: String,
    producto_id: i64,
    cantidad: i64,
}

/// Decode and validate the raw bytes of one broker message.
///
/// A structurally invalid message (bad UTF-8/JSON, missing or unparseable
/// `timestamp`, missing or empty `lecturas`) fails the whole batch with
/// `MalformedPayload`. A field-level violation in a single reading only
/// excludes that reading; the rest of the batch is still returned.
pub fn parse_batch(payload: &[u8]) -> Result<ReadingBatch, IngestError> {
    let raw: RawBatch = serde_json::from_slice(payload)
        .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;

    let timestamp = DateTime::parse_from_rfc3339(&raw.timestamp)
        .map_err(|e| IngestError::MalformedPayload(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);

    if raw.lecturas.is_empty() {
        return Err(IngestError::MalformedPayload(
            "batch holds no readings".to_owned(),
        ));
    }

    let mut readings = Vec::with_capacity(raw.lecturas.len());
    let mut rejected = 0;
    for entry in raw.lecturas {
        match validate_reading(entry, timestamp) {
            Ok(reading) => readings.push(reading),
            Err(error) => {
                rejected += 1;
                warn!(%error, "rejected sensor reading");
                metrics::counter!("ingest_readings_invalid").increment(1);
            }
        }
    }

    Ok(ReadingBatch {
        timestamp,
        readings,
        rejected,
    })
}

fn validate_reading(entry: Value, timestamp: DateTime<Utc>) -> Result<SensorReading, IngestError> {
    let raw: RawReading = serde_json::from_value(entry)
        .map_err(|e| IngestError::InvalidReading(e.to_string()))?;

    if raw.sensor_id.trim().is_empty() {
        return Err(IngestError::InvalidReading(
            "empty sensor_id".to_owned(),
        ));
    }
    if raw.producto_id <= 0 || raw.producto_id > i64::from(i32::MAX) {
        return Err(IngestError::InvalidReading(format!(
            "producto_id out of range: {}",
            raw.producto_id
        )));
    }
    if raw.cantidad < 0 || raw.cantidad > i64::from(i32::MAX) {
        return Err(IngestError::InvalidReading(format!(
            "cantidad out of range: {}",
            raw.cantidad
        )));
    }

    Ok(SensorReading {
        sensor_id: raw.sensor_id,
        product_id: raw.producto_id as i32,
        quantity: raw.cantidad as i32,
        batch_timestamp: timestamp,
    })
}
