use std::time::Duration;

use thiserror::Error;

/// Errors that end a listening session.
///
/// Transient store failures never surface here; the pipeline downgrades them
/// to a non-matching chunk.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("sample rate mismatch: pipeline expects {expected} Hz, chunk declared {got} Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    #[error("unsupported channel count {0}: pipeline expects mono audio")]
    ChannelCount(u16),

    #[error("chunk contains non-finite samples")]
    NonFiniteSamples,

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("analysis task failed: {0}")]
    Analysis(#[from] tokio::task::JoinError),
}

/// Errors returned by fingerprint and metadata stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed metadata for {song}: {source}")]
    Metadata {
        song: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) | StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            StoreError::Metadata { .. } => false,
        }
    }
}

/// Errors raised while decoding encoded audio into PCM.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported or corrupt audio: {0}")]
    Format(#[from] symphonia::core::errors::Error),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("audio track does not declare {0}")]
    MissingParameter(&'static str),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Invalid engine or transport configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Parse { key: String, value: String },

    #[error("{0}")]
    Invalid(String),
}
