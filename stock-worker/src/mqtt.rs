use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stock_common::health::HealthHandle;

use crate::config::Config;
use crate::coordinator::{BatchOutcome, IngestionCoordinator};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscribes to the sensor topic and feeds each broker message through the
/// coordinator, one bounded task per message.
///
/// The consumer is the only component aware of broker semantics: it owns
/// manual acknowledgement (QoS 1, persistent session) so that a message is
/// acked exactly when the coordinator says so, and redelivered otherwise.
pub struct MqttConsumer {
    options: MqttOptions,
    topic: String,
    coordinator: Arc<IngestionCoordinator>,
    permits: Arc<Semaphore>,
    liveness: HealthHandle,
}

impl MqttConsumer {
    pub fn new(
        config: &Config,
        coordinator: Arc<IngestionCoordinator>,
        liveness: HealthHandle,
    ) -> Self {
        let mut options = MqttOptions::new(
            &config.mqtt_client_id,
            &config.mqtt_broker,
            config.mqtt_port,
        );
        options.set_keep_alive(KEEP_ALIVE);
        // Acks are issued by the pipeline once a batch reaches a terminal
        // state, and the session is kept across reconnects so unacked
        // QoS 1 messages come back.
        options.set_manual_acks(true);
        options.set_clean_session(false);

        Self {
            options,
            topic: config.mqtt_topic.as_str().to_owned(),
            coordinator,
            permits: Arc::new(Semaphore::new(config.max_concurrent_batches)),
            liveness,
        }
    }

    /// Run the consumer until `shutdown` fires. Cancellation never acks:
    /// whatever was in flight is redelivered on the next start.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 128);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down, in-flight messages stay unacknowledged");
                    if let Err(error) = client.disconnect().await {
                        warn!(%error, "failed to disconnect from broker");
                    }
                    return Ok(());
                }
                polled = eventloop.poll() => match polled {
                    Ok(event) => {
                        self.liveness.report_healthy().await;
                        self.handle_event(&client, event).await?;
                    }
                    Err(error) => {
                        warn!(%error, "broker connection error, reconnecting");
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, client: &AsyncClient, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!(topic = %self.topic, "connected to MQTT broker, subscribing");
                client.subscribe(&self.topic, QoS::AtLeastOnce).await?;
            }
            Event::Incoming(Packet::SubAck(_)) => {
                debug!("subscription acknowledged");
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore has been closed");
                metrics::gauge!("ingest_batches_in_flight")
                    .set(self.permits.available_permits() as f64);

                let coordinator = self.coordinator.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let outcome = coordinator.process_message(&publish.payload).await;
                    match outcome {
                        BatchOutcome::Ack | BatchOutcome::DeadLetter => {
                            if let Err(error) = client.ack(&publish).await {
                                warn!(%error, "failed to acknowledge message");
                            }
                        }
                        BatchOutcome::Redeliver => {
                            warn!(
                                topic = %publish.topic,
                                "leaving message unacknowledged for redelivery"
                            );
                        }
                    }
                    drop(permit);
                });
            }
            _ => {}
        }
        Ok(())
    }
}
