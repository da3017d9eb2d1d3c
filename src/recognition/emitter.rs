use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::persistance::{with_retry, Metadata, MetadataStore, SongId};
use crate::streaming::models::DetectionEvent;
use crate::streaming::PublishHandle;

/// Everything about an accepted match except its metadata.
#[derive(Debug, Clone)]
pub struct Detection {
    pub song_id: SongId,
    pub song_name: String,
    pub confidence: f64,
    pub offset: f64,
    pub hashes_matched: usize,
    pub total_hashes: usize,
}

/// Builds detection events and hands them to the transport.
///
/// Neither step can fail the caller: missing or unreadable metadata becomes
/// an empty object, and a full or absent publish queue only costs the
/// downstream copy of the event.
pub struct EventEmitter {
    metadata: Option<Arc<dyn MetadataStore>>,
    publisher: Option<PublishHandle>,
    retry: RetryConfig,
}

impl EventEmitter {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            metadata: None,
            publisher: None,
            retry,
        }
    }

    pub fn set_metadata(&mut self, store: Arc<dyn MetadataStore>) {
        self.metadata = Some(store);
    }

    pub fn set_publisher(&mut self, publisher: PublishHandle) {
        self.publisher = Some(publisher);
    }

    pub fn publisher(&self) -> Option<&PublishHandle> {
        self.publisher.as_ref()
    }

    pub async fn metadata_for(&self, song_name: &str) -> Metadata {
        let Some(store) = &self.metadata else {
            return Metadata::new();
        };

        match with_retry(&self.retry, "metadata lookup", move || store.get_metadata(song_name)).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                debug!(song = song_name, "no metadata registered");
                Metadata::new()
            }
            Err(err) => {
                warn!(song = song_name, error = %err, "metadata unavailable, emitting without it");
                Metadata::new()
            }
        }
    }

    pub async fn assemble(&self, detection: Detection) -> DetectionEvent {
        let metadata = self.metadata_for(&detection.song_name).await;

        DetectionEvent {
            song_id: detection.song_id,
            song_name: detection.song_name,
            confidence: detection.confidence,
            timestamp: Utc::now(),
            metadata,
            offset: detection.offset,
            hashes_matched: detection.hashes_matched,
            total_hashes: detection.total_hashes,
        }
    }

    /// Returns whether the event was handed to a publisher.
    pub fn dispatch(&self, event: &DetectionEvent) -> bool {
        match &self.publisher {
            Some(publisher) => publisher.publish_event(event),
            None => false,
        }
    }
}
