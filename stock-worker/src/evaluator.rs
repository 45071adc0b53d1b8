use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::store::ProductStore;
use crate::types::{NotificationEvent, NotificationLevel, StockUpdateResult};

/// Decides whether a successful stock update warrants an alert.
///
/// The evaluator has no delivery history: it emits on every qualifying
/// update, including repeated reports at an already-depleted level.
/// Collapsing repeats is the notifier's cool-down, not ours.
pub struct ThresholdEvaluator {
    store: Arc<dyn ProductStore>,
}

impl ThresholdEvaluator {
    pub fn new(store: Arc<dyn ProductStore>) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        update: &StockUpdateResult,
    ) -> Result<Option<NotificationEvent>, StoreError> {
        if !update.applied {
            return Ok(None);
        }

        let Some(product) = self.store.get_product(update.product_id).await? else {
            return Ok(None);
        };

        Ok(
            level_for(update.new_quantity, product.low_stock_threshold).map(|level| {
                NotificationEvent {
                    product_id: update.product_id,
                    level,
                    triggered_at: Utc::now(),
                }
            }),
        )
    }
}

fn level_for(quantity: i32, threshold: i32) -> Option<NotificationLevel> {
    if quantity == 0 {
        Some(NotificationLevel::Out)
    } else if quantity <= threshold {
        Some(NotificationLevel::Low)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryProductStore;
    use crate::types::Product;

    #[test]
    fn zero_is_out_of_stock() {
        assert_eq!(level_for(0, 5), Some(NotificationLevel::Out));
        // Even with a zero threshold.
        assert_eq!(level_for(0, 0), Some(NotificationLevel::Out));
    }

    #[test]
    fn at_or_below_threshold_is_low() {
        assert_eq!(level_for(1, 5), Some(NotificationLevel::Low));
        assert_eq!(level_for(5, 5), Some(NotificationLevel::Low));
    }

    #[test]
    fn above_threshold_is_quiet() {
        assert_eq!(level_for(6, 5), None);
        assert_eq!(level_for(100, 5), None);
    }

    #[tokio::test]
    async fn repeated_qualifying_updates_keep_emitting() {
        let store = Arc::new(MemoryProductStore::new());
        store.insert(Product {
            id: 1,
            name: "widget".to_owned(),
            stock_quantity: 2,
            low_stock_threshold: 5,
        });
        let evaluator = ThresholdEvaluator::new(store);

        // Previous quantity was already below threshold; still emits.
        let update = StockUpdateResult::applied(1, 3, 2);
        let event = evaluator.evaluate(&update).await.unwrap().unwrap();
        assert_eq!(event.level, NotificationLevel::Low);

        let event = evaluator.evaluate(&update).await.unwrap().unwrap();
        assert_eq!(event.level, NotificationLevel::Low);
    }

    #[tokio::test]
    async fn skipped_updates_and_missing_products_emit_nothing() {
        let store = Arc::new(MemoryProductStore::new());
        let evaluator = ThresholdEvaluator::new(store);

        let skipped =
            StockUpdateResult::skipped(1, crate::types::UpdateReason::StoreUnavailable);
        assert_eq!(evaluator.evaluate(&skipped).await.unwrap(), None);

        // Applied, but the product row is gone by evaluation time.
        let applied = StockUpdateResult::applied(9, 4, 0);
        assert_eq!(evaluator.evaluate(&applied).await.unwrap(), None);
    }
}
