use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::persistance::{FingerprintStore, Metadata, MetadataStore, SongId, SongRecord, StoredMatch};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS songs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fingerprints (
        hash INTEGER NOT NULL,
        song_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
        time_offset INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints (hash)",
    r#"
    CREATE TABLE IF NOT EXISTS song_metadata (
        song_name TEXT PRIMARY KEY,
        metadata TEXT NOT NULL,
        source_file TEXT,
        date_added TEXT NOT NULL
    )
    "#,
];

/// SQLite-backed fingerprint index and metadata table.
pub struct SqliteStore {
    connection: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let connection = SqlitePoolOptions::new().connect_with(options).await?;

        Self::init(connection).await
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let connection = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(connection).await
    }

    async fn init(connection: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&connection).await?;
        }
        debug!("sqlite schema ready");

        Ok(Self { connection })
    }

    /// Insert or replace the metadata row for `song_name`.
    pub async fn insert_metadata(
        &self,
        song_name: &str,
        metadata: &Metadata,
        source_file: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.acquire().await?;
        write_metadata(&mut conn, song_name, metadata, source_file).await
    }

    /// Insert a song, its hashes and optional metadata in one transaction.
    pub async fn register(
        &self,
        title: &str,
        fingerprints: &[Fingerprint],
        metadata: Option<&Metadata>,
        source_file: Option<&str>,
    ) -> Result<SongId, StoreError> {
        let mut tx = self.connection.begin().await?;

        let song_id = write_song(&mut tx, title).await?;
        write_fingerprints(&mut tx, song_id, fingerprints).await?;
        if let Some(metadata) = metadata {
            write_metadata(&mut tx, title, metadata, source_file).await?;
        }

        tx.commit().await?;
        info!(song = title, song_id, hashes = fingerprints.len(), "registered song");
        Ok(song_id)
    }

    pub async fn songs(&self) -> Result<Vec<SongRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS id, s.title AS title, COUNT(f.hash) AS fingerprints
            FROM songs s
            LEFT JOIN fingerprints f ON f.song_id = s.id
            GROUP BY s.id, s.title
            ORDER BY s.id
            "#,
        )
        .fetch_all(&self.connection)
        .await?;

        rows.iter()
            .map(|row| -> Result<SongRecord, StoreError> {
                Ok(SongRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("title")?,
                    fingerprints: row.try_get::<i64, _>("fingerprints")? as usize,
                })
            })
            .collect()
    }

    pub async fn song_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM songs")
            .fetch_one(&self.connection)
            .await?
            .try_get("n")?;
        Ok(count as usize)
    }

    /// Delete a song by title; hashes go with it via the cascade.
    pub async fn delete_song(&self, title: &str) -> Result<bool, StoreError> {
        let mut tx = self.connection.begin().await?;

        let deleted = sqlx::query("DELETE FROM songs WHERE title = ?")
            .bind(title)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM song_metadata WHERE song_name = ?")
            .bind(title)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Songs whose metadata holds `value` at the dot-separated `path`
    /// (`"game"`, `"artist.name"`).
    pub async fn query_by_field(
        &self,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<(String, Metadata)>, StoreError> {
        let pointer = format!("/{}", path.split('.').collect::<Vec<_>>().join("/"));
        let rows = sqlx::query("SELECT song_name, metadata FROM song_metadata ORDER BY song_name")
            .fetch_all(&self.connection)
            .await?;

        let mut found = Vec::new();
        for row in rows {
            let song: String = row.try_get("song_name")?;
            let metadata = decode_metadata(&song, row.try_get("metadata")?)?;

            let document = serde_json::Value::Object(metadata);
            if document.pointer(&pointer) == Some(value) {
                if let serde_json::Value::Object(metadata) = document {
                    found.push((song, metadata));
                }
            }
        }

        Ok(found)
    }
}

async fn write_song(conn: &mut SqliteConnection, title: &str) -> Result<SongId, StoreError> {
    let row = sqlx::query("INSERT INTO songs (title) VALUES (?) RETURNING id")
        .bind(title)
        .fetch_one(&mut *conn)
        .await?;

    Ok(row.try_get("id")?)
}

async fn write_fingerprints(
    conn: &mut SqliteConnection,
    song_id: SongId,
    fingerprints: &[Fingerprint],
) -> Result<(), StoreError> {
    for fingerprint in fingerprints {
        sqlx::query("INSERT INTO fingerprints (hash, song_id, time_offset) VALUES (?, ?, ?)")
            .bind(fingerprint.hash as i64)
            .bind(song_id)
            .bind(fingerprint.frame_index as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_metadata(
    conn: &mut SqliteConnection,
    song_name: &str,
    metadata: &Metadata,
    source_file: Option<&str>,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(metadata).map_err(|source| StoreError::Metadata {
        song: song_name.to_string(),
        source,
    })?;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO song_metadata (song_name, metadata, source_file, date_added)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(song_name)
    .bind(encoded)
    .bind(source_file)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn decode_metadata(song: &str, raw: String) -> Result<Metadata, StoreError> {
    serde_json::from_str(&raw).map_err(|source| StoreError::Metadata {
        song: song.to_string(),
        source,
    })
}

#[async_trait]
impl FingerprintStore for SqliteStore {
    async fn lookup(&self, hash: u64) -> Result<Vec<StoredMatch>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT song_id, time_offset
            FROM fingerprints
            WHERE hash = ?
            ORDER BY song_id, time_offset
            "#,
        )
        .bind(hash as i64)
        .fetch_all(&self.connection)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredMatch, StoreError> {
                Ok(StoredMatch {
                    song_id: row.try_get("song_id")?,
                    offset: row.try_get("time_offset")?,
                })
            })
            .collect()
    }

    async fn song_name(&self, song_id: SongId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT title FROM songs WHERE id = ?")
            .bind(song_id)
            .fetch_optional(&self.connection)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("title")?),
            None => None,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get_metadata(&self, song_name: &str) -> Result<Option<Metadata>, StoreError> {
        let row = sqlx::query("SELECT metadata FROM song_metadata WHERE song_name = ?")
            .bind(song_name)
            .fetch_optional(&self.connection)
            .await?;

        match row {
            Some(row) => Ok(Some(decode_metadata(song_name, row.try_get("metadata")?)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fp(hash: u64, frame_index: usize) -> Fingerprint {
        Fingerprint { hash, frame_index }
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let store = SqliteStore::in_memory().await.unwrap();
        let big_hash = (511u64 << 32) | (300 << 16) | 49;
        let id = store
            .register("jingle", &[fp(big_hash, 3), fp(7, 10), fp(big_hash, 12)], None, None)
            .await
            .unwrap();

        let matches = store.lookup(big_hash).await.unwrap();
        assert_eq!(
            matches,
            vec![
                StoredMatch { song_id: id, offset: 3 },
                StoredMatch { song_id: id, offset: 12 },
            ]
        );
        assert_eq!(store.song_name(id).await.unwrap().as_deref(), Some("jingle"));
        assert_eq!(store.song_name(id + 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_titles_are_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.register("alarm", &[fp(1, 0)], None, None).await.unwrap();
        assert!(store.register("alarm", &[fp(2, 0)], None, None).await.is_err());

        // The failed registration rolled back, leaving only the first song's hashes.
        assert_eq!(store.song_count().await.unwrap(), 1);
        assert!(store.lookup(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_round_trips_and_queries_by_path() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .register(
                "secret",
                &[fp(1, 0)],
                Some(&meta(json!({"game": "zelda", "artist": {"name": "kondo"}}))),
                Some("secret.wav"),
            )
            .await
            .unwrap();
        store
            .insert_metadata("door", &meta(json!({"game": "doom"})), None)
            .await
            .unwrap();

        let stored = store.get_metadata("secret").await.unwrap().unwrap();
        assert_eq!(stored["game"], "zelda");
        assert!(store.get_metadata("missing").await.unwrap().is_none());

        let by_game = store.query_by_field("game", &json!("doom")).await.unwrap();
        assert_eq!(by_game.len(), 1);
        assert_eq!(by_game[0].0, "door");

        let nested = store.query_by_field("artist.name", &json!("kondo")).await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].0, "secret");
    }

    #[tokio::test]
    async fn delete_cascades_to_fingerprints() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.register("a", &[fp(1, 0), fp(2, 1)], None, None).await.unwrap();
        store.register("b", &[fp(1, 5)], None, None).await.unwrap();

        assert!(store.delete_song("a").await.unwrap());
        assert!(!store.delete_song("a").await.unwrap());

        assert_eq!(store.song_count().await.unwrap(), 1);
        assert_eq!(store.lookup(1).await.unwrap().len(), 1);
        assert!(store.lookup(2).await.unwrap().is_empty());

        let songs = store.songs().await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!((songs[0].name.as_str(), songs[0].fingerprints), ("b", 1));
    }
}
