//! Fingerprint pipeline glue.
//!
//! Wires framing, spectral analysis, peak picking and hashing together. The
//! same [`Fingerprinter`] serves registration and recognition, so a clip
//! registered here hashes bit-for-bit like the identical audio heard live.

use crate::audio::decode::ingest;
use crate::config::{EngineConfig, HashConfig, PeakConfig};
use crate::error::DecodeError;

pub mod extraction;
pub mod hashing;

pub use extraction::{SpectralAnalyzer, Spectrogram};
pub use hashing::{find_peaks, generate_hashes, Fingerprint, Peak};

#[derive(Debug, Clone)]
pub struct Fingerprinter {
    analyzer: SpectralAnalyzer,
    peaks: PeakConfig,
    hashing: HashConfig,
    sample_rate: u32,
}

impl Fingerprinter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            analyzer: SpectralAnalyzer::new(&config.spectral),
            peaks: config.peaks.clone(),
            hashing: config.hashing.clone(),
            sample_rate: config.sample_rate,
        }
    }

    pub fn analyze(&self, samples: &[f32]) -> Spectrogram {
        self.analyzer.analyze(samples)
    }

    pub fn constellation(&self, samples: &[f32]) -> Vec<Peak> {
        find_peaks(&self.analyze(samples), &self.peaks)
    }

    pub fn fingerprint(&self, samples: &[f32]) -> Vec<Fingerprint> {
        generate_hashes(&self.constellation(samples), &self.hashing)
    }

    /// Convert a frame count into seconds at the engine rate.
    pub fn frames_to_seconds(&self, frames: i64) -> f64 {
        frames as f64 * self.analyzer.hop_size() as f64 / self.sample_rate as f64
    }
}

/// Decode encoded audio and fingerprint it at the configured rate.
pub fn fingerprint_pipeline(audio_bytes: &[u8], config: &EngineConfig) -> Result<Vec<Fingerprint>, DecodeError> {
    let pcm_buffer = ingest(audio_bytes, config.sample_rate)?;
    Ok(Fingerprinter::new(config).fingerprint(&pcm_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::noise;

    #[test]
    fn identical_audio_gives_identical_fingerprints() {
        let fingerprinter = Fingerprinter::new(&EngineConfig::default());
        let clip = noise(32_000, 0.5, 7);

        let first = fingerprinter.fingerprint(&clip);
        let second = fingerprinter.fingerprint(&clip.clone());
        assert!(first.len() >= 50, "only {} hashes", first.len());
        assert_eq!(first, second);
    }

    #[test]
    fn overlapping_excerpts_share_hashes() {
        let fingerprinter = Fingerprinter::new(&EngineConfig::default());
        let clip = noise(48_000, 0.5, 11);

        // Offsets that are whole hops keep the frame grid aligned.
        let early: std::collections::HashSet<u64> = fingerprinter
            .fingerprint(&clip[..32_000])
            .iter()
            .map(|fp| fp.hash)
            .collect();
        let late = fingerprinter.fingerprint(&clip[512 * 10..512 * 10 + 32_000]);

        let shared = late.iter().filter(|fp| early.contains(&fp.hash)).count();
        assert!(shared * 2 > late.len(), "{shared} of {} shared", late.len());
    }

    #[test]
    fn offsets_convert_to_seconds() {
        let fingerprinter = Fingerprinter::new(&EngineConfig::default());
        assert_eq!(fingerprinter.frames_to_seconds(125), 4.0);
        assert_eq!(fingerprinter.frames_to_seconds(-125), -4.0);
    }
}
