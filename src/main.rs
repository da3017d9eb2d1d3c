use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use resonate_listen::persistance::SqliteStore;
use resonate_listen::server::{router, AppState};
use resonate_listen::streaming::models::EventProducer;
use resonate_listen::streaming::PublishQueue;
use resonate_listen::{EngineConfig, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = EngineConfig::from_env()?;
    config.validate()?;
    let transport = TransportConfig::from_env()?;

    let database_url = std::env::var("RESONATE_DATABASE_URL").unwrap_or_else(|_| "sqlite:resonate.db".into());
    let store = SqliteStore::connect(&database_url)
        .await
        .with_context(|| format!("opening {database_url}"))?;

    let queue = producer(&transport)?.map(|producer| PublishQueue::spawn(producer, &transport));
    if queue.is_none() {
        info!("no transport configured, detections are only returned to callers");
    }

    let addr = std::env::var("RESONATE_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(%addr, songs = store.song_count().await?, "serving");

    let grace = config.shutdown_grace();
    let app = router(AppState {
        store: Arc::new(store),
        config: Arc::new(config),
        publisher: queue.as_ref().map(PublishQueue::handle),
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    if let Some(queue) = queue {
        queue.close(grace).await;
    }

    Ok(())
}

#[cfg(feature = "kafka")]
fn producer(transport: &TransportConfig) -> anyhow::Result<Option<Arc<dyn EventProducer>>> {
    use resonate_listen::streaming::models::KafkaProducer;

    let Some(brokers) = transport.kafka_brokers.as_deref() else {
        return Ok(None);
    };
    let producer = KafkaProducer::connect(brokers).with_context(|| format!("connecting to {brokers}"))?;
    info!(brokers, prefix = %transport.topic_prefix, "publishing detections to kafka");
    Ok(Some(Arc::new(producer)))
}

#[cfg(not(feature = "kafka"))]
fn producer(transport: &TransportConfig) -> anyhow::Result<Option<Arc<dyn EventProducer>>> {
    if let Some(brokers) = transport.kafka_brokers.as_deref() {
        tracing::warn!(brokers, "RESONATE_KAFKA_BROKERS is set but this build lacks the `kafka` feature");
    }
    Ok(None)
}
