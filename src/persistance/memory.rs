//! In-process fingerprint index. Not persistent.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::persistance::{FingerprintStore, Metadata, MetadataStore, SongId, SongRecord, StoredMatch};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    songs: BTreeMap<SongId, String>,
    index: HashMap<u64, Vec<StoredMatch>>,
    metadata: HashMap<String, Metadata>,
    next_id: SongId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a song and its hashes; ids are assigned in registration order.
    pub fn register(&self, name: &str, fingerprints: &[Fingerprint]) -> SongId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        inner.next_id += 1;
        let song_id = inner.next_id;
        inner.songs.insert(song_id, name.to_string());

        for fingerprint in fingerprints {
            inner.index.entry(fingerprint.hash).or_default().push(StoredMatch {
                song_id,
                offset: fingerprint.frame_index as i64,
            });
        }

        song_id
    }

    pub fn register_with_metadata(&self, name: &str, fingerprints: &[Fingerprint], metadata: Metadata) -> SongId {
        let song_id = self.register(name, fingerprints);
        self.insert_metadata(name, metadata);
        song_id
    }

    pub fn insert_metadata(&self, name: &str, metadata: Metadata) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.metadata.insert(name.to_string(), metadata);
    }

    pub fn songs(&self) -> Vec<SongRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts: HashMap<SongId, usize> = HashMap::new();
        for matches in inner.index.values() {
            for m in matches {
                *counts.entry(m.song_id).or_default() += 1;
            }
        }

        inner
            .songs
            .iter()
            .map(|(&id, name)| SongRecord {
                id,
                name: name.clone(),
                fingerprints: counts.get(&id).copied().unwrap_or(0),
            })
            .collect()
    }

    pub fn song_count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).songs.len()
    }

    pub fn fingerprint_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.index.values().map(Vec::len).sum()
    }

    /// Remove every song registered under `name`, with its hashes and metadata.
    pub fn delete_song(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let doomed: Vec<SongId> = inner
            .songs
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(&id, _)| id)
            .collect();
        if doomed.is_empty() {
            return false;
        }

        for id in &doomed {
            inner.songs.remove(id);
        }
        inner.index.retain(|_, matches| {
            matches.retain(|m| !doomed.contains(&m.song_id));
            !matches.is_empty()
        });
        inner.metadata.remove(name);
        true
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = Inner::default();
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    async fn lookup(&self, hash: u64) -> Result<Vec<StoredMatch>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.index.get(&hash).cloned().unwrap_or_default())
    }

    async fn song_name(&self, song_id: SongId) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.songs.get(&song_id).cloned())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_metadata(&self, song_name: &str) -> Result<Option<Metadata>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.metadata.get(song_name).cloned())
    }
}
