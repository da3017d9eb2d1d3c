//! Hand-off of detection events to the transport.
//!
//! The recognition loop only ever calls [`PublishHandle::publish_event`],
//! which enqueues without waiting. A background worker owns the producer and
//! retries failed sends, so a slow or absent broker costs events, never
//! recognition latency.

pub mod models;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::TransportConfig;
use crate::streaming::models::{DetectionEvent, EventProducer};

pub use models::{MemoryProducer, PublishedMessage};

#[derive(Debug)]
struct Outgoing {
    topic: String,
    key: String,
    payload: String,
}

/// Owns the publish worker.
pub struct PublishQueue {
    handle: PublishHandle,
    worker: JoinHandle<()>,
}

/// Cheap, cloneable sender side of a [`PublishQueue`].
#[derive(Clone)]
pub struct PublishHandle {
    sender: mpsc::Sender<Outgoing>,
    prefix: Arc<str>,
}

impl PublishQueue {
    pub fn spawn(producer: Arc<dyn EventProducer>, config: &TransportConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = tokio::spawn(run_publisher(
            producer,
            receiver,
            config.max_attempts.max(1),
            config.backoff(),
        ));

        Self {
            handle: PublishHandle {
                sender,
                prefix: Arc::from(config.topic_prefix.as_str()),
            },
            worker,
        }
    }

    pub fn handle(&self) -> PublishHandle {
        self.handle.clone()
    }

    /// Stop accepting messages and wait up to `grace` for the backlog to
    /// drain. Handles still held elsewhere keep the worker alive until they
    /// are dropped or the grace period ends.
    pub async fn close(self, grace: Duration) {
        let PublishQueue { handle, mut worker } = self;
        drop(handle);

        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            warn!(?grace, "publish queue did not drain in time, abandoning backlog");
            worker.abort();
        }
    }
}

impl PublishHandle {
    pub fn event_topic(&self, song_name: &str) -> String {
        format!("{}/event/{}", self.prefix, song_name)
    }

    /// Enqueue a fully assembled event. Returns `false` when it was dropped.
    pub fn publish_event(&self, event: &DetectionEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(song = %event.song_name, error = %err, "could not serialize event");
                return false;
            }
        };

        self.enqueue(Outgoing {
            topic: self.event_topic(&event.song_name),
            key: event.song_name.clone(),
            payload,
        })
    }

    /// Publish `on` / `off` under `{prefix}/system/running`.
    pub fn publish_status(&self, status: &str) -> bool {
        self.enqueue(Outgoing {
            topic: format!("{}/system/running", self.prefix),
            key: "running".into(),
            payload: status.to_string(),
        })
    }

    fn enqueue(&self, message: Outgoing) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "publish queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!(topic = %message.topic, "publish queue closed, dropping message");
                false
            }
        }
    }
}

async fn run_publisher(
    producer: Arc<dyn EventProducer>,
    mut receiver: mpsc::Receiver<Outgoing>,
    max_attempts: u32,
    backoff: Duration,
) {
    while let Some(message) = receiver.recv().await {
        let mut delay = backoff;

        for attempt in 1..=max_attempts {
            match producer
                .send(&message.topic, &message.key, message.payload.clone())
                .await
            {
                Ok(()) => {
                    debug!(topic = %message.topic, "published");
                    break;
                }
                Err(err) if attempt < max_attempts => {
                    warn!(topic = %message.topic, attempt, error = %err, "publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    error!(topic = %message.topic, attempts = max_attempts, error = %err, "giving up on message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;

    use super::*;

    fn event(name: &str) -> DetectionEvent {
        DetectionEvent {
            song_id: 1,
            song_name: name.into(),
            confidence: 1.0,
            timestamp: Utc::now(),
            metadata: Default::default(),
            offset: 0.0,
            hashes_matched: 60,
            total_hashes: 70,
        }
    }

    struct FlakyProducer {
        failures_left: AtomicU32,
        inner: MemoryProducer,
    }

    #[async_trait::async_trait]
    impl EventProducer for FlakyProducer {
        async fn send(&self, topic: &str, key: &str, payload: String) -> anyhow::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("broker unavailable");
            }
            self.inner.send(topic, key, payload).await
        }
    }

    #[tokio::test]
    async fn events_are_published_under_prefixed_topic() {
        let producer = Arc::new(MemoryProducer::new());
        let queue = PublishQueue::spawn(producer.clone(), &TransportConfig::default());

        assert!(queue.handle().publish_event(&event("door_bell")));
        queue.close(Duration::from_secs(1)).await;

        let messages = producer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "audio_events/event/door_bell");
        assert_eq!(messages[0].key, "door_bell");

        let payload: serde_json::Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(payload["song_name"], "door_bell");
        assert_eq!(payload["hashes_matched"], 60);
    }

    #[tokio::test]
    async fn failed_sends_are_retried() {
        let producer = Arc::new(FlakyProducer {
            failures_left: AtomicU32::new(2),
            inner: MemoryProducer::new(),
        });
        let config = TransportConfig {
            backoff_ms: 1,
            ..TransportConfig::default()
        };
        let queue = PublishQueue::spawn(producer.clone(), &config);

        queue.handle().publish_status("on");
        queue.close(Duration::from_secs(1)).await;

        let messages = producer.inner.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "audio_events/system/running");
        assert_eq!(messages[0].payload, "on");
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_message_only() {
        let producer = Arc::new(FlakyProducer {
            failures_left: AtomicU32::new(3),
            inner: MemoryProducer::new(),
        });
        let config = TransportConfig {
            backoff_ms: 1,
            ..TransportConfig::default()
        };
        let queue = PublishQueue::spawn(producer.clone(), &config);

        let handle = queue.handle();
        handle.publish_event(&event("lost"));
        handle.publish_event(&event("kept"));
        drop(handle);
        queue.close(Duration::from_secs(1)).await;

        let names: Vec<_> = producer.inner.messages().into_iter().map(|m| m.key).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        struct Stuck;

        #[async_trait::async_trait]
        impl EventProducer for Stuck {
            async fn send(&self, _: &str, _: &str, _: String) -> anyhow::Result<()> {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }

        let config = TransportConfig {
            queue_capacity: 1,
            ..TransportConfig::default()
        };
        let queue = PublishQueue::spawn(Arc::new(Stuck), &config);
        let handle = queue.handle();

        let accepted = (0..5).filter(|_| handle.publish_status("on")).count();
        assert!(accepted <= 2, "accepted {accepted}");

        drop(handle);
        queue.close(Duration::from_millis(20)).await;
    }
}
