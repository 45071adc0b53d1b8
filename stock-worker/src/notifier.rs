use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use stock_common::retry::RetryPolicy;

use crate::types::{NotificationEvent, NotificationLevel};

/// Enumeration of delivery failures, split by whether retrying could help.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery failed but could be retried later: {error}")]
    Retryable {
        error: String,
        retry_after: Option<Duration>,
    },
    #[error("delivery failed and cannot be retried: {0}")]
    NonRetryable(String),
}

/// Administrator notification channel. The concrete channel (webhook here)
/// is an external collaborator behind this seam.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// Delivers alerts as JSON POSTs to the admin webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String, request_timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Stock Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                error: e.to_string(),
                retry_after: None,
            })?;

        let retry_after = parse_retry_after_header(response.headers());

        match response.error_for_status() {
            Ok(_) => Ok(()),
            Err(err) => {
                let status = err
                    .status()
                    .expect("status code is set as error is generated from a response");
                if is_retryable_status(status) {
                    Err(DeliveryError::Retryable {
                        error: err.to_string(),
                        retry_after,
                    })
                } else {
                    Err(DeliveryError::NonRetryable(err.to_string()))
                }
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Retry-After header, either as a number of seconds or
/// an RFC 2822 date. Absent or unparseable headers yield `None`.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = retry_after.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let delta = chrono::DateTime::<chrono::Utc>::from(dt) - chrono::Utc::now();
        // Negative deltas (dates in the past) yield None.
        return delta.to_std().ok();
    }

    None
}

/// Delivers `NotificationEvent`s with bounded exponential backoff and a
/// cool-down per `(product_id, level)` to keep repeated sensor reports at a
/// depleted level from storming the administrators.
///
/// After the retry budget is exhausted the event is logged as undelivered
/// and dropped: notification loss is acceptable, inventory loss is not.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    retry_policy: RetryPolicy,
    cooldown: Duration,
    last_delivered: Mutex<HashMap<(i32, NotificationLevel), Instant>>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, retry_policy: RetryPolicy, cooldown: Duration) -> Self {
        Self {
            sink,
            retry_policy,
            cooldown,
            last_delivered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn notify(&self, event: NotificationEvent) {
        let suppression_key = (event.product_id, event.level);

        // The cool-down is armed before delivering, inside the lock, so a
        // concurrent notify for the same key sees it and suppresses instead
        // of delivering a second copy while ours is still in flight.
        let armed_at = Instant::now();
        {
            let mut last_delivered = self.last_delivered.lock().await;
            if let Some(at) = last_delivered.get(&suppression_key) {
                if at.elapsed() < self.cooldown {
                    debug!(
                        product_id = event.product_id,
                        level = ?event.level,
                        "suppressed repeat notification inside cool-down window"
                    );
                    metrics::counter!("notifications_suppressed").increment(1);
                    return;
                }
            }
            last_delivered.insert(suppression_key, armed_at);
        }

        let max_attempts = self.retry_policy.max_attempts();
        for attempt in 0..max_attempts {
            match self.sink.deliver(&event).await {
                Ok(()) => {
                    metrics::counter!("notifications_delivered").increment(1);
                    return;
                }
                Err(DeliveryError::Retryable { error, retry_after })
                    if attempt + 1 < max_attempts =>
                {
                    warn!(
                        product_id = event.product_id,
                        attempt, %error,
                        "notification delivery failed, backing off"
                    );
                    metrics::counter!("notifications_retried").increment(1);
                    tokio::time::sleep(self.retry_policy.retry_interval(attempt, retry_after))
                        .await;
                }
                Err(DeliveryError::Retryable { error, .. }) => {
                    error!(
                        product_id = event.product_id,
                        %error,
                        "notification undelivered after exhausting retries, dropping"
                    );
                    metrics::counter!("notifications_dropped").increment(1);
                    self.disarm(&suppression_key, armed_at).await;
                    return;
                }
                Err(DeliveryError::NonRetryable(error)) => {
                    error!(
                        product_id = event.product_id,
                        %error,
                        "notification rejected by the admin channel, dropping"
                    );
                    metrics::counter!("notifications_dropped").increment(1);
                    self.disarm(&suppression_key, armed_at).await;
                    return;
                }
            }
        }
    }

    /// Remove the cool-down entry armed by a delivery that ended up
    /// dropped, unless a later notify re-armed the key meanwhile.
    async fn disarm(&self, key: &(i32, NotificationLevel), armed_at: Instant) {
        let mut last_delivered = self.last_delivered.lock().await;
        if last_delivered.get(key) == Some(&armed_at) {
            last_delivered.remove(key);
        }
    }
}

/// Sink recording deliveries instead of sending them, optionally failing
/// the first N attempts with a retryable error. Used by tests.
#[derive(Default)]
pub struct MemorySink {
    delivered: std::sync::Mutex<Vec<NotificationEvent>>,
    attempts: std::sync::atomic::AtomicU32,
    failures_remaining: std::sync::atomic::AtomicU32,
    latency: Duration,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        let sink = Self::default();
        sink.failures_remaining
            .store(times, std::sync::atomic::Ordering::SeqCst);
        sink
    }

    /// A sink whose deliveries take `latency` to complete, for exercising
    /// overlapping notify calls.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<NotificationEvent> {
        self.delivered.lock().expect("poisoned sink lock").clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        use std::sync::atomic::Ordering;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::Retryable {
                error: "simulated delivery failure".to_owned(),
                retry_after: None,
            });
        }
        self.delivered
            .lock()
            .expect("poisoned sink lock")
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    fn event(product_id: i32, level: NotificationLevel) -> NotificationEvent {
        NotificationEvent {
            product_id,
            level,
            triggered_at: Utc::now(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), None, max_attempts)
    }

    #[tokio::test]
    async fn delivers_and_then_suppresses_within_cooldown() {
        let sink = Arc::new(MemorySink::default());
        let notifier = Notifier::new(sink.clone(), fast_policy(3), Duration::from_secs(60));

        notifier.notify(event(1, NotificationLevel::Out)).await;
        notifier.notify(event(1, NotificationLevel::Out)).await;

        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn different_levels_are_not_suppressed_together() {
        let sink = Arc::new(MemorySink::default());
        let notifier = Notifier::new(sink.clone(), fast_policy(3), Duration::from_secs(60));

        notifier.notify(event(1, NotificationLevel::Low)).await;
        notifier.notify(event(1, NotificationLevel::Out)).await;
        notifier.notify(event(2, NotificationLevel::Low)).await;

        assert_eq!(sink.delivered().len(), 3);
    }

    #[tokio::test]
    async fn overlapping_notifies_for_one_key_deliver_exactly_once() {
        let sink = Arc::new(MemorySink::with_latency(Duration::from_millis(50)));
        let notifier = Arc::new(Notifier::new(
            sink.clone(),
            fast_policy(3),
            Duration::from_secs(300),
        ));

        // Both calls start before either delivery completes; the second
        // must hit the armed cool-down, not race past it.
        let first = tokio::spawn({
            let notifier = notifier.clone();
            async move { notifier.notify(event(1, NotificationLevel::Out)).await }
        });
        let second = tokio::spawn({
            let notifier = notifier.clone();
            async move { notifier.notify(event(1, NotificationLevel::Out)).await }
        });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn retries_until_the_sink_recovers() {
        let sink = Arc::new(MemorySink::failing(2));
        let notifier = Notifier::new(sink.clone(), fast_policy(5), Duration::from_secs(60));

        notifier.notify(event(1, NotificationLevel::Out)).await;

        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn drops_after_exhausting_the_retry_budget() {
        let sink = Arc::new(MemorySink::failing(3));
        let notifier = Notifier::new(sink.clone(), fast_policy(3), Duration::from_secs(60));

        notifier.notify(event(1, NotificationLevel::Out)).await;

        assert_eq!(sink.attempts(), 3);
        assert!(sink.delivered().is_empty());

        // The drop did not arm the cool-down: once the sink recovers, a
        // later event for the same key goes straight through.
        notifier.notify(event(1, NotificationLevel::Out)).await;
        assert_eq!(sink.delivered().len(), 1);
    }

    #[test]
    fn retryable_status_classification() {
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(
            parse_retry_after_header(&headers),
            Some(Duration::from_secs(120))
        );

        headers.remove(header::RETRY_AFTER);
        assert_eq!(parse_retry_after_header(&headers), None);

        // Dates in the past yield None.
        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);
    }
}
