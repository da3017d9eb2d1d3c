//! Constellation peaks and anchor/target hashes.

use serde::{Deserialize, Serialize};

use crate::config::{HashConfig, PeakConfig};
use crate::fingerprint::extraction::Spectrogram;

/// One landmark hash and the frame its anchor sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: u64,
    pub frame_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub time: usize,
    pub freq: usize,
    pub magnitude: f32,
}

/// Pack `(anchor bin, target bin, frame delta)` into one key.
///
/// Layout: bits 32..48 anchor bin, 16..32 target bin, 0..16 frame delta.
pub fn pack_hash(f1: usize, f2: usize, dt: usize) -> u64 {
    ((f1 as u64 & 0xFFFF) << 32) | ((f2 as u64 & 0xFFFF) << 16) | (dt as u64 & 0xFFFF)
}

pub fn unpack_hash(hash: u64) -> (usize, usize, usize) {
    (
        ((hash >> 32) & 0xFFFF) as usize,
        ((hash >> 16) & 0xFFFF) as usize,
        (hash & 0xFFFF) as usize,
    )
}

/// Pair every peak with up to `fan_out` later peaks inside the target zone.
///
/// `peaks` must be sorted by `(time, freq)`, as [`find_peaks`] returns them.
pub fn generate_hashes(peaks: &[Peak], config: &HashConfig) -> Vec<Fingerprint> {
    debug_assert!(
        peaks.windows(2).all(|w| (w[0].time, w[0].freq) <= (w[1].time, w[1].freq)),
        "peaks must be sorted by (time, freq)"
    );

    let mut fingerprints = Vec::new();

    for (i, anchor) in peaks.iter().enumerate() {
        let mut targets = 0;

        for target in &peaks[i + 1..] {
            let dt = target.time.saturating_sub(anchor.time);
            if dt > config.max_time_delta {
                break;
            }
            if dt < config.min_time_delta || target.freq.abs_diff(anchor.freq) > config.max_freq_delta {
                continue;
            }

            fingerprints.push(Fingerprint {
                hash: pack_hash(anchor.freq, target.freq, dt),
                frame_index: anchor.time,
            });

            targets += 1;
            if targets == config.fan_out {
                break;
            }
        }
    }

    fingerprints
}

/// Local maxima above the magnitude floor.
///
/// A cell is kept when no other cell within `time_radius` frames and
/// `freq_radius` bins is louder by more than `plateau_tolerance_db`. Every
/// cell of a plateau is kept, so a held tone yields one peak per frame no
/// matter where the frame grid falls. The neighborhood size is what bounds
/// constellation density.
pub fn find_peaks(spectrogram: &Spectrogram, config: &PeakConfig) -> Vec<Peak> {
    let number_of_frames = spectrogram.num_frames();
    let number_of_bins = spectrogram.num_bins();
    let frames = spectrogram.frames();

    let mut peaks = Vec::new();

    for t in 0..number_of_frames {
        for f in 0..number_of_bins {
            let val = frames[t][f];
            if val < config.min_magnitude_db {
                continue;
            }

            let t_lo = t.saturating_sub(config.time_radius);
            let t_hi = (t + config.time_radius).min(number_of_frames - 1);
            let f_lo = f.saturating_sub(config.freq_radius);
            let f_hi = (f + config.freq_radius).min(number_of_bins - 1);

            let ceiling = val + config.plateau_tolerance_db;
            let is_peak = (t_lo..=t_hi).all(|nt| frames[nt][f_lo..=f_hi].iter().all(|&other| other <= ceiling));

            if is_peak {
                peaks.push(Peak {
                    time: t,
                    freq: f,
                    magnitude: val,
                });
            }
        }
    }

    peaks
}
