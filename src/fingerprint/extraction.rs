//! Spectral extraction helpers.
//!
//! Provides framing, windowing and FFT log-magnitude computation used by the
//! fingerprinting pipeline.

use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::config::SpectralConfig;

const MIN_MAGNITUDE: f32 = 1e-10;

/// Log-magnitude spectrogram indexed by `[frame][bin]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    frames: Vec<Vec<f32>>,
    bins: usize,
}

impl Spectrogram {
    pub fn from_frames(frames: Vec<Vec<f32>>, bins: usize) -> Self {
        debug_assert!(frames.iter().all(|f| f.len() == bins));
        Self { frames, bins }
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_bins(&self) -> usize {
        self.bins
    }
}

/// Short-time spectrum with a fixed frame and hop size.
#[derive(Clone)]
pub struct SpectralAnalyzer {
    frame_size: usize,
    hop_size: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("frame_size", &self.frame_size)
            .field("hop_size", &self.hop_size)
            .finish()
    }
}

impl SpectralAnalyzer {
    pub fn new(config: &SpectralConfig) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            frame_size: config.frame_size,
            hop_size: config.hop_size,
            window: hann_window(config.frame_size),
            fft: planner.plan_fft_forward(config.frame_size),
        }
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn analyze(&self, samples: &[f32]) -> Spectrogram {
        let frames = frame(samples, self.frame_size, self.hop_size, &self.window);
        Spectrogram::from_frames(self.log_magnitude(frames), self.frame_size / 2)
    }

    /// Magnitude in dB of the first `n/2` bins of each frame.
    fn log_magnitude(&self, frames: Vec<Vec<f32>>) -> Vec<Vec<f32>> {
        let n = self.frame_size;

        frames
            .into_par_iter()
            .map(|frame| {
                let mut buffer: Vec<Complex<f32>> =
                    frame.iter().map(|&v| Complex { re: v, im: 0.0 }).collect();
                self.fft.process(&mut buffer);

                buffer[..n / 2]
                    .iter()
                    .map(|c| 20.0 * c.norm().max(MIN_MAGNITUDE).log10())
                    .collect()
            })
            .collect()
    }
}

/// Split samples into overlapping Hann-windowed frames. Only complete frames
/// are produced, so the frame grid depends on nothing but the input length.
pub fn frame(samples: &[f32], frame_size: usize, hop_size: usize, window: &[f32]) -> Vec<Vec<f32>> {
    if samples.len() < frame_size {
        return Vec::new();
    }

    (0..=samples.len() - frame_size)
        .step_by(hop_size)
        .map(|position| {
            samples[position..position + frame_size]
                .iter()
                .zip(window)
                .map(|(s, w)| s * w)
                .collect()
        })
        .collect()
}

fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    let n = size as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1.0)).cos()))
        .collect()
}
