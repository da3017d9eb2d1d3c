//! Loudness pre-filter run on every incoming chunk.

/// Reported level for digital silence.
pub const SILENCE_FLOOR_DB: f32 = -100.0;

const MIN_RMS: f64 = 1e-10;

/// RMS level of `samples` in dBFS, clamped to [`SILENCE_FLOOR_DB`].
pub fn energy_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DB;
    }

    let mean_square = samples
        .iter()
        .map(|&s| s as f64 * s as f64)
        .sum::<f64>()
        / samples.len() as f64;
    let rms = mean_square.sqrt();

    if rms > MIN_RMS {
        (20.0 * rms.log10()) as f32
    } else {
        SILENCE_FLOOR_DB
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateReading {
    pub energy_db: f32,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnergyGate {
    threshold_db: f32,
}

impl EnergyGate {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    /// Passes when the level reaches the threshold (inclusive).
    pub fn evaluate(&self, samples: &[f32]) -> GateReading {
        let energy_db = energy_db(samples);
        GateReading {
            energy_db,
            passed: energy_db >= self.threshold_db,
        }
    }
}
