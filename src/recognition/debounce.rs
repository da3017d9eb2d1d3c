use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::persistance::{Metadata, SongId};

/// Metadata key that overrides the cooldown for one song, in seconds.
pub const COOLDOWN_METADATA_KEY: &str = "cooldown_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Cooldown { expires_at: Instant },
}

/// Per-song cooldown bookkeeping.
///
/// An expired cooldown is treated exactly like `Idle`; entries are replaced on
/// the next emission rather than swept.
#[derive(Debug)]
pub struct Debouncer {
    default_cooldown: Duration,
    expiries: HashMap<SongId, Instant>,
}

impl Debouncer {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            expiries: HashMap::new(),
        }
    }

    pub fn state(&self, song_id: SongId, now: Instant) -> DebounceState {
        match self.expiries.get(&song_id) {
            Some(&expires_at) if now < expires_at => DebounceState::Cooldown { expires_at },
            _ => DebounceState::Idle,
        }
    }

    pub fn is_cooling(&self, song_id: SongId, now: Instant) -> bool {
        matches!(self.state(song_id, now), DebounceState::Cooldown { .. })
    }

    /// Start a cooldown for `song_id`, using `cooldown` when given.
    pub fn arm(&mut self, song_id: SongId, now: Instant, cooldown: Option<Duration>) -> Instant {
        let expires_at = now + cooldown.unwrap_or(self.default_cooldown);
        self.expiries.insert(song_id, expires_at);
        expires_at
    }

    pub fn clear(&mut self) {
        self.expiries.clear();
    }
}

/// Read a per-song cooldown from metadata. Negative, non-finite or
/// non-numeric values are ignored.
pub fn cooldown_override(metadata: &Metadata) -> Option<Duration> {
    let secs = metadata.get(COOLDOWN_METADATA_KEY)?.as_f64()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
