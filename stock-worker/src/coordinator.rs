use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::dedup::DedupStore;
use crate::evaluator::ThresholdEvaluator;
use crate::notifier::Notifier;
use crate::parser;
use crate::reconciler::StockReconciler;
use crate::types::{SensorReading, StockUpdateResult, UpdateReason};

/// What the broker consumer should do with a message once the pipeline ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every reading reached a terminal state; acknowledge the message.
    Ack,
    /// At least one reading hit a transient store failure; leave the
    /// message unacknowledged so the broker redelivers it.
    Redeliver,
    /// The payload is unparseable; acknowledge it anyway (redelivering an
    /// unparseable message can never succeed) and log it as dead-lettered.
    DeadLetter,
}

enum ReadingDisposition {
    /// Applied, duplicate-skipped or permanently invalid.
    Terminal,
    /// Transient failure, retry via broker redelivery.
    Retry,
}

/// Drives one broker message through parse → dedup → reconcile → evaluate
/// → notify, and decides the acknowledgement outcome. The coordinator is
/// the only component that knows all pipeline stages; broker semantics
/// stay with the consumer.
pub struct IngestionCoordinator {
    dedup: Arc<dyn DedupStore>,
    reconciler: StockReconciler,
    evaluator: ThresholdEvaluator,
    notifier: Arc<Notifier>,
}

impl IngestionCoordinator {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        reconciler: StockReconciler,
        evaluator: ThresholdEvaluator,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            dedup,
            reconciler,
            evaluator,
            notifier,
        }
    }

    pub async fn process_message(&self, payload: &[u8]) -> BatchOutcome {
        metrics::counter!("ingest_batches_received").increment(1);

        let batch = match parser::parse_batch(payload) {
            Ok(batch) => batch,
            Err(error) => {
                let excerpt = String::from_utf8_lossy(&payload[..payload.len().min(256)]);
                error!(%error, payload = %excerpt, "dead-lettering malformed batch");
                metrics::counter!("ingest_batches_dead_lettered").increment(1);
                return BatchOutcome::DeadLetter;
            }
        };

        metrics::histogram!("ingest_batch_readings").record(batch.readings.len() as f64);

        // Readings are processed in batch order: two reports for the same
        // product in one batch resolve deterministically to the later one.
        let mut needs_redelivery = false;
        for reading in &batch.readings {
            if let ReadingDisposition::Retry = self.process_reading(reading).await {
                needs_redelivery = true;
            }
        }

        if needs_redelivery {
            metrics::counter!("ingest_batches_redelivered").increment(1);
            BatchOutcome::Redeliver
        } else {
            BatchOutcome::Ack
        }
    }

    async fn process_reading(&self, reading: &SensorReading) -> ReadingDisposition {
        let key = reading.key();

        let update = match self.dedup.is_applied(&key).await {
            Ok(true) => StockUpdateResult::skipped(reading.product_id, UpdateReason::Duplicate),
            Ok(false) => self.reconciler.apply(reading).await,
            Err(error) => {
                // Cannot prove the reading was not applied before; keep the
                // message around and let redelivery sort it out.
                warn!(%error, "dedup lookup failed");
                return ReadingDisposition::Retry;
            }
        };

        match update.reason {
            UpdateReason::Applied => {
                metrics::counter!("ingest_readings_applied").increment(1);
            }
            UpdateReason::Duplicate => {
                debug!(
                    sensor_id = %reading.sensor_id,
                    product_id = reading.product_id,
                    "skipping redelivered reading"
                );
                metrics::counter!("ingest_readings_duplicate").increment(1);
                return ReadingDisposition::Terminal;
            }
            UpdateReason::ProductNotFound => {
                warn!(
                    product_id = reading.product_id,
                    sensor_id = %reading.sensor_id,
                    "reading references unknown product, skipping"
                );
                metrics::counter!("ingest_readings_product_not_found").increment(1);
                return ReadingDisposition::Terminal;
            }
            UpdateReason::StoreUnavailable => {
                metrics::counter!("ingest_readings_store_unavailable").increment(1);
                return ReadingDisposition::Retry;
            }
        }

        // Mark only now that the write is confirmed; marking before a
        // failed write would make redeliveries silently drop the reading.
        match self.dedup.mark_applied(&key).await {
            Ok(true) => {}
            Ok(false) => {
                // A concurrent worker applied and marked the same key; it
                // also owns the notification.
                metrics::counter!("ingest_readings_duplicate").increment(1);
                return ReadingDisposition::Terminal;
            }
            Err(error) => {
                // The stock write is idempotent (absolute level), so a
                // redelivery re-applying it is safe. Skip notification
                // until the key can be marked.
                warn!(%error, "failed to mark reading as applied");
                return ReadingDisposition::Retry;
            }
        }

        match self.evaluator.evaluate(&update).await {
            Ok(Some(event)) => self.notifier.notify(event).await,
            Ok(None) => {}
            Err(error) => {
                // Alert loss is acceptable; inventory-data loss is not.
                warn!(%error, "threshold evaluation failed, alert skipped");
            }
        }

        ReadingDisposition::Terminal
    }
}
