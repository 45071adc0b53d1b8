//! Consume sensor reading batches from the MQTT broker and reconcile them
//! against the product inventory store.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stock_common::health::{HealthHandle, HealthRegistry};
use stock_common::metrics::{serve, setup_metrics_router};
use stock_common::retry::RetryPolicy;
use stock_worker::config::Config;
use stock_worker::coordinator::IngestionCoordinator;
use stock_worker::dedup::{DedupStore, PostgresDedupStore};
use stock_worker::evaluator::ThresholdEvaluator;
use stock_worker::mqtt::MqttConsumer;
use stock_worker::notifier::{Notifier, WebhookSink};
use stock_worker::reconciler::StockReconciler;
use stock_worker::store::{PostgresProductStore, ProductStore};

async fn index() -> &'static str {
    "sensor stock ingestion service"
}

fn start_probe_server(bind: String, liveness: HealthRegistry) {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving probes and metrics");
    });
}

/// Keeps the dedup key set bounded by dropping marks older than the
/// retention window.
async fn purge_loop(
    dedup: Arc<dyn DedupStore>,
    retention: chrono::Duration,
    interval: std::time::Duration,
    liveness: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        liveness.report_healthy().await;

        match dedup.purge_older_than(retention).await {
            Ok(purged) if purged > 0 => info!(purged, "purged expired reading marks"),
            Ok(_) => {}
            Err(error) => error!(%error, "reading mark purge failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness
        .register("consumer".to_string(), time::Duration::seconds(60))
        .await;
    let purge_deadline =
        time::Duration::milliseconds(2 * config.dedup_purge_interval.0.as_millis() as i64);
    let purge_liveness = liveness
        .register("dedup-purge".to_string(), purge_deadline)
        .await;

    start_probe_server(config.bind(), liveness);

    let dedup: Arc<dyn DedupStore> = Arc::new(PostgresDedupStore::new(pool.clone()));
    let products: Arc<dyn ProductStore> =
        Arc::new(PostgresProductStore::new(pool, config.store_timeout.0));

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
        config.retry_policy.max_attempts,
    );
    let sink = Arc::new(WebhookSink::new(
        config.admin_webhook_url.clone(),
        config.request_timeout.0,
    )?);
    let notifier = Arc::new(Notifier::new(
        sink,
        retry_policy,
        config.notification_cooldown.0,
    ));

    let coordinator = Arc::new(IngestionCoordinator::new(
        dedup.clone(),
        StockReconciler::new(products.clone()),
        ThresholdEvaluator::new(products),
        notifier,
    ));

    tokio::spawn(purge_loop(
        dedup,
        chrono::Duration::hours(config.dedup_retention_hours),
        config.dedup_purge_interval.0,
        purge_liveness,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    info!(
        broker = %config.mqtt_broker,
        port = config.mqtt_port,
        topic = %config.mqtt_topic.as_str(),
        "starting sensor stock ingestion"
    );
    let consumer = MqttConsumer::new(&config, coordinator, consumer_liveness);
    consumer.run(shutdown).await
}
