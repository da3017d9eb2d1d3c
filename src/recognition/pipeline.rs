use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioChunk, EnergyGate, RingBuffer};
use crate::config::EngineConfig;
use crate::error::{ConfigError, RecognitionError};
use crate::fingerprint::Fingerprinter;
use crate::matching::{ConfidenceScorer, MatchAggregator};
use crate::persistance::{with_retry, FingerprintStore, MetadataStore};
use crate::recognition::debounce::{cooldown_override, Debouncer};
use crate::recognition::emitter::{Detection, EventEmitter};
use crate::streaming::models::DetectionEvent;
use crate::streaming::PublishHandle;

/// Counters since construction or the last [`RecognitionPipeline::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub total_chunks: u64,
    pub processed_windows: u64,
    pub skipped_silent: u64,
    pub detections: u64,
    pub suppressed: u64,
    pub below_threshold: u64,
    pub lookup_failures: u64,
    pub buffer_len: usize,
    pub buffer_full: bool,
}

/// Per-source recognition state machine.
///
/// Owns its ring buffer and debounce map; independent pipelines share only
/// the stores they were given.
pub struct RecognitionPipeline {
    config: EngineConfig,
    ring: RingBuffer,
    gate: EnergyGate,
    fingerprinter: Arc<Fingerprinter>,
    scorer: ConfidenceScorer,
    debouncer: Debouncer,
    emitter: EventEmitter,
    store: Arc<dyn FingerprintStore>,
    stats: PipelineStats,
}

impl RecognitionPipeline {
    pub fn new(config: EngineConfig, store: Arc<dyn FingerprintStore>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            ring: RingBuffer::new(config.window_samples()),
            gate: EnergyGate::new(config.energy_threshold_db),
            fingerprinter: Arc::new(Fingerprinter::new(&config)),
            scorer: ConfidenceScorer::new(config.normalization_constant, config.confidence_threshold),
            debouncer: Debouncer::new(config.cooldown()),
            emitter: EventEmitter::new(config.retry.clone()),
            store,
            stats: PipelineStats::default(),
            config,
        })
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.emitter.set_metadata(metadata);
        self
    }

    pub fn with_publisher(mut self, publisher: PublishHandle) -> Self {
        self.emitter.set_publisher(publisher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn publisher(&self) -> Option<&PublishHandle> {
        self.emitter.publisher()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            buffer_len: self.ring.len(),
            buffer_full: self.ring.is_full(),
            ..self.stats
        }
    }

    /// Forget buffered audio, cooldowns and counters.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.debouncer.clear();
        self.stats = PipelineStats::default();
    }

    /// Feed one chunk through gate, analysis, matching and debounce.
    ///
    /// Returns the emitted event, if any. Only malformed input and broken
    /// internal invariants are errors; store trouble downgrades the chunk to
    /// a non-match.
    pub async fn process_chunk(&mut self, chunk: &AudioChunk) -> Result<Option<DetectionEvent>, RecognitionError> {
        self.check_chunk(chunk)?;

        self.stats.total_chunks += 1;
        self.ring.push(chunk.samples());

        let reading = self.gate.evaluate(chunk.samples());
        if !reading.passed {
            self.stats.skipped_silent += 1;
            debug!(energy_db = reading.energy_db, "chunk below energy threshold");
            return Ok(None);
        }

        if !self.ring.is_full() {
            debug!(buffered = self.ring.len(), capacity = self.ring.capacity(), "warming up");
            return Ok(None);
        }

        self.stats.processed_windows += 1;
        let mut window = self.ring.snapshot();
        if window.len() != self.ring.capacity() {
            return Err(RecognitionError::Invariant(format!(
                "window holds {} samples, expected {}",
                window.len(),
                self.ring.capacity()
            )));
        }
        normalize(&mut window);

        let fingerprinter = Arc::clone(&self.fingerprinter);
        let fingerprints = tokio::task::spawn_blocking(move || fingerprinter.fingerprint(&window)).await?;
        let total_hashes = fingerprints.len();

        let aggregator = match MatchAggregator::collect(self.store.as_ref(), &fingerprints, &self.config.retry).await {
            Ok(aggregator) => aggregator,
            Err(err) => {
                self.stats.lookup_failures += 1;
                warn!(error = %err, "fingerprint lookup failed, treating window as no match");
                return Ok(None);
            }
        };

        let Some(candidate) = aggregator.best() else {
            debug!(total_hashes, "no stored hashes matched");
            return Ok(None);
        };

        let confidence = self.scorer.score(candidate.hashes_matched);
        if !self.scorer.accepts(confidence) {
            self.stats.below_threshold += 1;
            debug!(
                song_id = candidate.song_id,
                hashes_matched = candidate.hashes_matched,
                confidence,
                "best candidate below threshold"
            );
            return Ok(None);
        }

        let now = Instant::now();
        if self.debouncer.is_cooling(candidate.song_id, now) {
            self.stats.suppressed += 1;
            debug!(song_id = candidate.song_id, "suppressed by cooldown");
            return Ok(None);
        }

        let store = self.store.as_ref();
        let song_id = candidate.song_id;
        let song_name = match with_retry(&self.config.retry, "song name lookup", move || store.song_name(song_id)).await {
            Ok(Some(name)) => name,
            Ok(None) => {
                warn!(song_id, "matched song is no longer registered");
                return Ok(None);
            }
            Err(err) => {
                self.stats.lookup_failures += 1;
                warn!(song_id, error = %err, "song name lookup failed, treating window as no match");
                return Ok(None);
            }
        };

        let event = self
            .emitter
            .assemble(Detection {
                song_id,
                song_name,
                confidence,
                offset: self.fingerprinter.frames_to_seconds(candidate.delta),
                hashes_matched: candidate.hashes_matched,
                total_hashes,
            })
            .await;

        self.debouncer.arm(song_id, now, cooldown_override(&event.metadata));
        self.emitter.dispatch(&event);
        self.stats.detections += 1;

        info!(
            song = %event.song_name,
            confidence = event.confidence,
            offset = event.offset,
            hashes_matched = event.hashes_matched,
            total_hashes = event.total_hashes,
            "detected"
        );

        Ok(Some(event))
    }

    fn check_chunk(&self, chunk: &AudioChunk) -> Result<(), RecognitionError> {
        if chunk.sample_rate() != self.config.sample_rate {
            return Err(RecognitionError::SampleRateMismatch {
                expected: self.config.sample_rate,
                got: chunk.sample_rate(),
            });
        }
        if chunk.channels() != 1 {
            return Err(RecognitionError::ChannelCount(chunk.channels()));
        }
        if chunk.samples().iter().any(|s| !s.is_finite()) {
            return Err(RecognitionError::NonFiniteSamples);
        }
        Ok(())
    }
}

/// Scale into [-1, 1] when the window clips; otherwise leave it alone.
fn normalize(window: &mut [f32]) {
    let peak = window.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 1.0 {
        window.iter_mut().for_each(|s| *s /= peak);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::audio::chunk_clip;
    use crate::config::{RetryConfig, TransportConfig};
    use crate::error::StoreError;
    use crate::persistance::{MemoryStore, Metadata, SongId, SqliteStore, StoredMatch};
    use crate::streaming::{MemoryProducer, PublishQueue};
    use crate::test_support::noise;

    const RATE: u32 = 16_000;
    const CLIP: usize = 32_000;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    fn reference_clip() -> Vec<f32> {
        noise(CLIP, 0.5, 7)
    }

    fn registered(config: &EngineConfig) -> (Arc<MemoryStore>, Vec<f32>, usize) {
        let clip = reference_clip();
        let fingerprints = Fingerprinter::new(config).fingerprint(&clip);
        let store = Arc::new(MemoryStore::new());
        store.register("door_bell", &fingerprints);
        (store, clip, fingerprints.len())
    }

    #[tokio::test]
    async fn reference_clip_is_detected_once_the_window_fills() {
        let config = EngineConfig::default();
        let (store, clip, registered_hashes) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config.clone(), store).unwrap();

        let mut events = Vec::new();
        for (i, chunk) in chunk_clip(&clip, config.chunk_samples(), RATE).iter().enumerate() {
            if let Some(event) = pipeline.process_chunk(chunk).await.unwrap() {
                events.push((i, event));
            }
        }

        assert_eq!(events.len(), 1);
        let (index, event) = &events[0];
        assert_eq!(*index, 3);
        assert_eq!(event.song_name, "door_bell");
        assert_eq!(event.confidence, 1.0);
        assert_eq!(event.offset, 0.0);
        assert_eq!(event.total_hashes, registered_hashes);
        assert_eq!(event.hashes_matched, registered_hashes);

        let stats = pipeline.stats();
        assert_eq!(stats.total_chunks, 4);
        assert_eq!(stats.processed_windows, 1);
        assert_eq!(stats.detections, 1);
        assert!(stats.buffer_full);
    }

    #[tokio::test]
    async fn quiet_noise_never_reaches_analysis() {
        let config = EngineConfig::default();
        let (store, _, _) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config.clone(), store).unwrap();

        let quiet = noise(RATE as usize * 10, 0.005, 99);
        for chunk in chunk_clip(&quiet, config.chunk_samples(), RATE) {
            assert!(pipeline.process_chunk(&chunk).await.unwrap().is_none());
        }

        let stats = pipeline.stats();
        assert_eq!(stats.total_chunks, 20);
        assert_eq!(stats.skipped_silent, 20);
        assert_eq!(stats.processed_windows, 0);
        assert_eq!(stats.detections, 0);
    }

    #[tokio::test]
    async fn unrelated_loud_noise_is_not_detected() {
        let config = EngineConfig::default();
        let (store, _, _) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config.clone(), store).unwrap();

        let other = noise(RATE as usize * 10, 0.5, 12345);
        for chunk in chunk_clip(&other, config.chunk_samples(), RATE) {
            assert!(pipeline.process_chunk(&chunk).await.unwrap().is_none());
        }

        let stats = pipeline.stats();
        assert_eq!(stats.detections, 0);
        assert_eq!(stats.processed_windows, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_detection_is_debounced_until_cooldown_expires() {
        let config = EngineConfig::default();
        let (store, clip, _) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config, store).unwrap();
        let whole = AudioChunk::mono(clip, RATE);

        assert!(pipeline.process_chunk(&whole).await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(pipeline.process_chunk(&whole).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(pipeline.process_chunk(&whole).await.unwrap().is_some());

        let stats = pipeline.stats();
        assert_eq!(stats.detections, 2);
        assert_eq!(stats.suppressed, 1);
    }

    /// Four held notes, half a second each, with continuous phase.
    fn jingle() -> Vec<f32> {
        let notes = [440.0, 660.0, 880.0, 1250.0];
        let mut phase = 0.0f64;
        (0..CLIP)
            .map(|n| {
                phase += 2.0 * std::f64::consts::PI * notes[n / (CLIP / 4)] / RATE as f64;
                (0.4 * phase.sin()) as f32
            })
            .collect()
    }

    #[tokio::test]
    async fn tonal_jingle_is_detected_off_the_frame_grid() {
        let config = EngineConfig {
            cooldown_secs: 60.0,
            ..EngineConfig::default()
        };
        let reference = jingle();
        let store = Arc::new(MemoryStore::new());
        store.register("chime", &Fingerprinter::new(&config).fingerprint(&reference));

        for shift in [100, 256, 3_000] {
            let mut stream = noise(shift, 0.001, 5);
            stream.extend_from_slice(&reference);
            stream.extend(noise(RATE as usize, 0.001, 6));

            let mut pipeline = RecognitionPipeline::new(config.clone(), store.clone()).unwrap();
            let mut events = Vec::new();
            for chunk in chunk_clip(&stream, config.chunk_samples(), RATE) {
                if let Some(event) = pipeline.process_chunk(&chunk).await.unwrap() {
                    events.push(event);
                }
            }

            assert_eq!(events.len(), 1, "shift {shift}: {:?}", pipeline.stats());
            assert_eq!(events[0].song_name, "chime");
            assert_eq!(events[0].confidence, 1.0, "shift {shift}");
        }
    }

    #[tokio::test]
    async fn metadata_cooldown_overrides_default() {
        let config = EngineConfig {
            cooldown_secs: 60.0,
            ..EngineConfig::default()
        };
        let (store, clip, _) = registered(&config);
        store.insert_metadata("door_bell", meta(json!({"cooldown_seconds": 0, "room": "hall"})));

        let mut pipeline = RecognitionPipeline::new(config, store.clone())
            .unwrap()
            .with_metadata(store);
        let whole = AudioChunk::mono(clip, RATE);

        let first = pipeline.process_chunk(&whole).await.unwrap().unwrap();
        assert_eq!(first.metadata["room"], "hall");
        assert!(pipeline.process_chunk(&whole).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn equal_support_resolves_to_first_registered_song() {
        let config = EngineConfig::default();
        let clip = reference_clip();
        let fingerprints = Fingerprinter::new(&config).fingerprint(&clip);

        let store = Arc::new(MemoryStore::new());
        store.register("first", &fingerprints);
        store.register("second", &fingerprints);

        for _ in 0..3 {
            let mut pipeline = RecognitionPipeline::new(config.clone(), store.clone()).unwrap();
            let event = pipeline
                .process_chunk(&AudioChunk::mono(clip.clone(), RATE))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.song_name, "first");
        }
    }

    #[tokio::test]
    async fn malformed_chunks_are_rejected() {
        let config = EngineConfig::default();
        let (store, _, _) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config, store).unwrap();

        let wrong_rate = AudioChunk::mono(vec![0.1; 100], 44_100);
        assert!(matches!(
            pipeline.process_chunk(&wrong_rate).await,
            Err(RecognitionError::SampleRateMismatch { expected: 16_000, got: 44_100 })
        ));

        let stereo = AudioChunk::new(vec![0.1; 100], RATE, 2);
        assert!(matches!(
            pipeline.process_chunk(&stereo).await,
            Err(RecognitionError::ChannelCount(2))
        ));

        let nan = AudioChunk::mono(vec![f32::NAN; 100], RATE);
        assert!(matches!(
            pipeline.process_chunk(&nan).await,
            Err(RecognitionError::NonFiniteSamples)
        ));

        assert_eq!(pipeline.stats().total_chunks, 0);
    }

    struct HangingStore;

    #[async_trait]
    impl FingerprintStore for HangingStore {
        async fn lookup(&self, _: u64) -> Result<Vec<StoredMatch>, StoreError> {
            futures::future::pending().await
        }

        async fn song_name(&self, _: SongId) -> Result<Option<String>, StoreError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn store_timeouts_are_not_fatal() {
        let config = EngineConfig {
            retry: RetryConfig {
                timeout_ms: 10,
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
            ..EngineConfig::default()
        };
        let mut pipeline = RecognitionPipeline::new(config, Arc::new(HangingStore)).unwrap();

        let event = pipeline
            .process_chunk(&AudioChunk::mono(reference_clip(), RATE))
            .await
            .unwrap();

        assert!(event.is_none());
        assert_eq!(pipeline.stats().lookup_failures, 1);
    }

    #[tokio::test]
    async fn events_reach_the_publisher() {
        let config = EngineConfig::default();
        let (store, clip, _) = registered(&config);
        let producer = Arc::new(MemoryProducer::new());
        let queue = PublishQueue::spawn(producer.clone(), &TransportConfig::default());

        let mut pipeline = RecognitionPipeline::new(config, store)
            .unwrap()
            .with_publisher(queue.handle());
        pipeline.process_chunk(&AudioChunk::mono(clip, RATE)).await.unwrap();
        drop(pipeline);
        queue.close(Duration::from_secs(1)).await;

        let messages = producer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "audio_events/event/door_bell");
    }

    #[tokio::test]
    async fn sqlite_backed_recognition_round_trips() {
        let config = EngineConfig::default();
        let clip = reference_clip();
        let fingerprints = Fingerprinter::new(&config).fingerprint(&clip);

        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store
            .register("zelda_secret", &fingerprints, Some(&meta(json!({"game": "zelda"}))), None)
            .await
            .unwrap();

        let mut pipeline = RecognitionPipeline::new(config, store.clone())
            .unwrap()
            .with_metadata(store);
        let event = pipeline
            .process_chunk(&AudioChunk::mono(clip, RATE))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.song_name, "zelda_secret");
        assert_eq!(event.metadata["game"], "zelda");
        assert!(event.confidence >= 0.3);
    }

    #[tokio::test]
    async fn reset_clears_buffer_cooldowns_and_counters() {
        let config = EngineConfig::default();
        let (store, clip, _) = registered(&config);
        let mut pipeline = RecognitionPipeline::new(config, store).unwrap();
        let whole = AudioChunk::mono(clip, RATE);

        assert!(pipeline.process_chunk(&whole).await.unwrap().is_some());
        pipeline.reset();
        assert_eq!(pipeline.stats(), PipelineStats::default());

        assert!(pipeline.process_chunk(&whole).await.unwrap().is_some());
    }

    #[test]
    fn clipping_windows_are_rescaled() {
        let mut loud = vec![0.5, -4.0, 2.0];
        normalize(&mut loud);
        assert_eq!(loud, vec![0.125, -1.0, 0.5]);

        let mut fine = vec![0.5, -1.0];
        normalize(&mut fine);
        assert_eq!(fine, vec![0.5, -1.0]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            window_duration_secs: 0.01,
            ..EngineConfig::default()
        };
        assert!(RecognitionPipeline::new(config, Arc::new(MemoryStore::new())).is_err());
    }
}
