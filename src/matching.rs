//! Alignment voting and confidence scoring.

use std::collections::{BTreeMap, HashMap};

use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::persistance::{with_retry, FingerprintStore, SongId, StoredMatch};

/// Best-supported `(song, alignment)` pair for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub song_id: SongId,
    /// Reference frame minus query frame.
    pub delta: i64,
    pub hashes_matched: usize,
}

/// Counts `(song_id, delta)` votes across a window's hashes.
#[derive(Debug, Default)]
pub struct MatchAggregator {
    votes: HashMap<(SongId, i64), usize>,
}

impl MatchAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, query_offset: usize, matches: &[StoredMatch]) {
        for m in matches {
            let delta = m.offset - query_offset as i64;
            *self.votes.entry((m.song_id, delta)).or_default() += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Highest vote count wins; ties go to the lowest song id, then the
    /// lowest delta.
    pub fn best(&self) -> Option<Candidate> {
        self.votes
            .iter()
            .max_by(|(a_key, a_count), (b_key, b_count)| {
                a_count
                    .cmp(b_count)
                    .then_with(|| b_key.0.cmp(&a_key.0))
                    .then_with(|| b_key.1.cmp(&a_key.1))
            })
            .map(|(&(song_id, delta), &hashes_matched)| Candidate {
                song_id,
                delta,
                hashes_matched,
            })
    }

    /// Look up every distinct hash of the window once and tally the votes.
    ///
    /// Any lookup that still fails after retries fails the whole window, so a
    /// partially counted window is never scored.
    pub async fn collect(
        store: &dyn FingerprintStore,
        fingerprints: &[Fingerprint],
        retry: &RetryConfig,
    ) -> Result<Self, StoreError> {
        let mut by_hash: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for fingerprint in fingerprints {
            by_hash.entry(fingerprint.hash).or_default().push(fingerprint.frame_index);
        }

        let mut aggregator = Self::new();
        for (&hash, offsets) in &by_hash {
            let matches = with_retry(retry, "fingerprint lookup", move || store.lookup(hash)).await?;
            if matches.is_empty() {
                continue;
            }
            for &offset in offsets {
                aggregator.add(offset, &matches);
            }
        }

        Ok(aggregator)
    }
}

/// Linear, saturating confidence.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceScorer {
    normalization: usize,
    threshold: f64,
}

impl ConfidenceScorer {
    pub fn new(normalization: usize, threshold: f64) -> Self {
        Self {
            normalization: normalization.max(1),
            threshold,
        }
    }

    /// `min(count / normalization, 1.0)`.
    pub fn score(&self, hashes_matched: usize) -> f64 {
        (hashes_matched as f64 / self.normalization as f64).min(1.0)
    }

    pub fn accepts(&self, confidence: f64) -> bool {
        confidence >= self.threshold
    }
}
