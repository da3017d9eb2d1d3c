//! Audio ingestion: captured chunks, the sliding window, the energy gate
//! and decoding of reference clips.

use std::sync::Arc;
use std::time::Duration;

pub mod decode;
pub mod energy;
pub mod ring;

pub use energy::{energy_db, EnergyGate, GateReading, SILENCE_FLOOR_DB};
pub use ring::RingBuffer;

/// A fixed-duration block of samples handed over by the capture side.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

/// Split a clip into mono chunks of `chunk_len` samples; the tail chunk may
/// be shorter.
pub fn chunk_clip(samples: &[f32], chunk_len: usize, sample_rate: u32) -> Vec<AudioChunk> {
    samples
        .chunks(chunk_len.max(1))
        .map(|chunk| AudioChunk::mono(chunk.to_vec(), sample_rate))
        .collect()
}
