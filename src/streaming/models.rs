use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistance::{Metadata, SongId};

/// A confirmed, debounced recognition.
///
/// Serializes to the wire payload; `song_id` stays local to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(skip)]
    pub song_id: SongId,
    pub song_name: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    /// Seconds into the reference recording at which the analysis window starts.
    pub offset: f64,
    pub hashes_matched: usize,
    pub total_hashes: usize,
}

#[async_trait::async_trait]
pub trait EventProducer: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: String,
    ) -> anyhow::Result<()>;
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaProducer;

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;

    use super::EventProducer;

    pub struct KafkaProducer {
        pub inner: FutureProducer,
    }

    impl KafkaProducer {
        pub fn connect(brokers: &str) -> anyhow::Result<Self> {
            let inner = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .create()?;
            Ok(Self { inner })
        }
    }

    /// Kafka topic names cannot hold `/`, so `prefix/event/name` becomes
    /// `prefix.event.name`.
    fn kafka_topic(topic: &str) -> String {
        topic.replace('/', ".")
    }

    #[async_trait::async_trait]
    impl EventProducer for KafkaProducer {
        async fn send(
            &self,
            topic: &str,
            key: &str,
            payload: String,
        ) -> anyhow::Result<()> {
            let topic = kafka_topic(topic);
            self.inner
                .send(
                    FutureRecord::to(&topic)
                        .key(key)
                        .payload(&payload),
                    Duration::from_secs(0),
                )
                .await
                .map_err(|(e, _)| anyhow::anyhow!(e))?;

            Ok(())
        }
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// Keeps every message it is sent.
#[derive(Debug, Default)]
pub struct MemoryProducer {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl EventProducer for MemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: String,
    ) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            });
        Ok(())
    }
}
