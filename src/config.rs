//! Engine and transport configuration.
//!
//! Every struct carries working defaults; [`EngineConfig::from_env`] applies
//! `RESONATE_*` overrides on top of them.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Framing of the short-time spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    pub frame_size: usize,
    pub hop_size: usize,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            hop_size: 512,
        }
    }
}

/// Constellation density controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Neighborhood half-width in frames.
    pub time_radius: usize,
    /// Neighborhood half-height in frequency bins.
    pub freq_radius: usize,
    /// Log-magnitude floor a peak must reach.
    pub min_magnitude_db: f32,
    /// Neighbours within this many dB of a cell count as equal to it, so a
    /// steady tone peaks in every frame instead of wherever rounding lands.
    pub plateau_tolerance_db: f32,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            time_radius: 3,
            freq_radius: 10,
            min_magnitude_db: -20.0,
            plateau_tolerance_db: 0.05,
        }
    }
}

/// Anchor/target pairing limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    pub fan_out: usize,
    pub min_time_delta: usize,
    pub max_time_delta: usize,
    pub max_freq_delta: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            fan_out: 5,
            min_time_delta: 1,
            max_time_delta: 50,
            max_freq_delta: 200,
        }
    }
}

/// Timeout and backoff for store and metadata calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            max_retries: 2,
            initial_backoff_ms: 25,
            max_backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub window_duration_secs: f64,
    /// Chunk length used when slicing whole clips into the pipeline.
    pub chunk_duration_secs: f64,
    pub energy_threshold_db: f32,
    pub confidence_threshold: f64,
    pub normalization_constant: usize,
    pub cooldown_secs: f64,
    pub shutdown_grace_ms: u64,
    pub spectral: SpectralConfig,
    pub peaks: PeakConfig,
    pub hashing: HashConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_duration_secs: 2.0,
            chunk_duration_secs: 0.5,
            energy_threshold_db: -40.0,
            confidence_threshold: 0.3,
            normalization_constant: 50,
            cooldown_secs: 1.0,
            shutdown_grace_ms: 2_000,
            spectral: SpectralConfig::default(),
            peaks: PeakConfig::default(),
            hashing: HashConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `RESONATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_from(&lookup, "RESONATE_SAMPLE_RATE", &mut config.sample_rate)?;
        override_from(&lookup, "RESONATE_WINDOW_SECONDS", &mut config.window_duration_secs)?;
        override_from(&lookup, "RESONATE_CHUNK_SECONDS", &mut config.chunk_duration_secs)?;
        override_from(&lookup, "RESONATE_ENERGY_THRESHOLD_DB", &mut config.energy_threshold_db)?;
        override_from(&lookup, "RESONATE_CONFIDENCE_THRESHOLD", &mut config.confidence_threshold)?;
        override_from(&lookup, "RESONATE_COOLDOWN_SECONDS", &mut config.cooldown_secs)?;
        override_from(&lookup, "RESONATE_LOOKUP_TIMEOUT_MS", &mut config.retry.timeout_ms)?;
        override_from(&lookup, "RESONATE_LOOKUP_RETRIES", &mut config.retry.max_retries)?;

        Ok(config)
    }

    pub fn window_samples(&self) -> usize {
        (self.window_duration_secs * self.sample_rate as f64).round() as usize
    }

    pub fn chunk_samples(&self) -> usize {
        (self.chunk_duration_secs * self.sample_rate as f64).round() as usize
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sample_rate == 0 {
            return invalid("sample_rate must be positive".into());
        }
        if self.spectral.frame_size < 2 || self.spectral.frame_size / 2 > u16::MAX as usize + 1 {
            return invalid(format!("frame_size {} out of range", self.spectral.frame_size));
        }
        if self.spectral.hop_size == 0 || self.spectral.hop_size > self.spectral.frame_size {
            return invalid(format!(
                "hop_size {} must be in 1..={}",
                self.spectral.hop_size, self.spectral.frame_size
            ));
        }
        if !self.window_duration_secs.is_finite() || self.window_samples() < self.spectral.frame_size {
            return invalid(format!(
                "window of {}s is shorter than one analysis frame",
                self.window_duration_secs
            ));
        }
        if !(self.chunk_duration_secs.is_finite() && self.chunk_duration_secs > 0.0) {
            return invalid("chunk_duration_secs must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return invalid(format!(
                "confidence_threshold {} must be within [0, 1]",
                self.confidence_threshold
            ));
        }
        if self.normalization_constant == 0 {
            return invalid("normalization_constant must be positive".into());
        }
        if !(self.cooldown_secs.is_finite() && self.cooldown_secs >= 0.0) {
            return invalid("cooldown_secs must be a non-negative number".into());
        }
        if !(self.peaks.plateau_tolerance_db.is_finite() && self.peaks.plateau_tolerance_db >= 0.0) {
            return invalid("plateau_tolerance_db must be a non-negative number".into());
        }
        if self.hashing.fan_out == 0 {
            return invalid("fan_out must be positive".into());
        }
        if self.hashing.min_time_delta > self.hashing.max_time_delta
            || self.hashing.max_time_delta > u16::MAX as usize
        {
            return invalid(format!(
                "time delta range {}..={} is invalid",
                self.hashing.min_time_delta, self.hashing.max_time_delta
            ));
        }

        Ok(())
    }
}

/// Where detection events go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub topic_prefix: String,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Kafka bootstrap servers; events are only published when set.
    pub kafka_brokers: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "audio_events".into(),
            queue_capacity: 64,
            max_attempts: 3,
            backoff_ms: 100,
            kafka_brokers: None,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_from(&lookup, "RESONATE_TOPIC_PREFIX", &mut config.topic_prefix)?;
        override_from(&lookup, "RESONATE_PUBLISH_QUEUE", &mut config.queue_capacity)?;
        override_from(&lookup, "RESONATE_PUBLISH_ATTEMPTS", &mut config.max_attempts)?;
        if let Some(brokers) = lookup("RESONATE_KAFKA_BROKERS").filter(|b| !b.trim().is_empty()) {
            config.kafka_brokers = Some(brokers.trim().to_string());
        }

        Ok(config)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::Parse {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
