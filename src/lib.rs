//! Real-time recognition of registered audio events.
//!
//! Chunks of mono audio go through [`recognition::RecognitionPipeline`]:
//! a sliding window is gated on loudness, fingerprinted from its spectral
//! peaks, matched against a [`persistance::FingerprintStore`] by alignment
//! voting, and debounced before a [`DetectionEvent`] is emitted.

pub mod audio;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod matching;
pub mod persistance;
pub mod recognition;
pub mod server;
pub mod streaming;

#[cfg(test)]
mod test_support;

pub use audio::AudioChunk;
pub use config::{EngineConfig, TransportConfig};
pub use error::{ConfigError, DecodeError, RecognitionError, StoreError};
pub use recognition::{run_listener, PipelineStats, RecognitionPipeline};
pub use streaming::models::DetectionEvent;
