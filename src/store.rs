//! Versioned collection store over SQLite.
//!
//! Collections are named partitions of a single `records` table keyed by
//! `(collection, key)`. They are registered on first write; registering a new
//! collection bumps a schema version counter in `schema_meta`. Reopening at a
//! newer version never destroys existing collections. If the database cannot
//! be opened at all, the store deletes and recreates the file — a recovery
//! path, not routine behavior, logged as fatal for that session's data.
//!
//! Item collections are mirrored into a `records_fts` FTS5 table so the
//! lexical side of hybrid search can match against title and body text.
//! The `meta` and `vectors` collections are bookkeeping and stay out of it.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error, warn};

use crate::models::IndexItem;

/// Collection holding job progress, last-run times, and the heartbeat lock.
pub const META: &str = "meta";
/// Collection holding the vector worker's persisted embeddings.
pub const VECTORS: &str = "vectors";

pub struct Store {
    pool: SqlitePool,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// On open failure the database file is deleted and recreated once.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::try_open(path).await {
            Ok(store) => Ok(store),
            Err(e) => {
                error!(
                    db = %path.display(),
                    error = %e,
                    "store open failed; deleting and recreating the database (existing data is lost)"
                );
                let _ = std::fs::remove_file(path);
                Self::try_open(path)
                    .await
                    .with_context(|| format!("Failed to recreate store at {}", path.display()))
            }
        }
    }

    async fn try_open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current collection-set version.
    pub async fn schema_version(&self) -> Result<i64> {
        let v: Option<String> =
            sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'version'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(v.and_then(|s| s.parse().ok()).unwrap_or(1))
    }

    /// All registered collections, in registration order.
    pub async fn collections(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM collections ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    /// Register a collection, bumping the schema version if it is new.
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO collections (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE schema_meta SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) WHERE key = 'version'",
            )
            .execute(&self.pool)
            .await?;
            debug!(collection = name, "registered new collection");
        }
        Ok(())
    }

    /// Store a serializable value under `(collection, key)`.
    pub async fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        self.ensure_collection(collection).await?;
        let json = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO records (collection, key, value) VALUES (?, ?, ?)
            ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store an item and mirror it into the lexical index.
    pub async fn put_item(&self, collection: &str, item: &IndexItem) -> Result<()> {
        self.put(collection, &item.id, item).await?;

        sqlx::query("DELETE FROM records_fts WHERE collection = ? AND item_id = ?")
            .bind(collection)
            .bind(&item.id)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO records_fts (item_id, collection, text, content) VALUES (?, ?, ?, ?)")
            .bind(&item.id)
            .bind(collection)
            .bind(&item.text)
            .bind(&item.content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM records WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let rows = sqlx::query("SELECT key, value FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.get("value");
            match serde_json::from_str(&json) {
                Ok(value) => out.push(value),
                Err(e) => {
                    let key: String = row.get("key");
                    warn!(collection, key = %key, error = %e, "skipping undecodable record");
                }
            }
        }
        Ok(out)
    }

    /// All items in a collection, skipping records that fail validation.
    pub async fn get_all_items(&self, collection: &str) -> Result<Vec<IndexItem>> {
        let items: Vec<IndexItem> = self.get_all(collection).await?;
        Ok(items
            .into_iter()
            .filter(|item| {
                if item.is_valid() {
                    true
                } else {
                    warn!(collection, id = %item.id, "skipping invalid stored item");
                    false
                }
            })
            .collect())
    }

    pub async fn remove(&self, collection: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM records_fts WHERE collection = ? AND item_id = ?")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear(&self, collection: &str) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM records_fts WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All keys in a collection, sorted.
    pub async fn keys(&self, collection: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM records WHERE collection = ? ORDER BY key")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }

    pub async fn count(&self, collection: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO schema_meta (key, value) VALUES ('version', '1') ON CONFLICT(key) DO NOTHING")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (collection, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='records_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE records_fts USING fts5(
                item_id UNINDEXED,
                collection UNINDEXED,
                text,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn item(id: &str, text: &str) -> IndexItem {
        IndexItem {
            id: id.to_string(),
            text: text.to_string(),
            category: "feed".to_string(),
            content: format!("body of {}", id),
            date_added: 1_700_000_000_000,
            metadata: Map::new(),
            action_id: "open".to_string(),
            render_component_id: "row".to_string(),
        }
    }

    async fn open_temp() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("t.sqlite")).await.unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_tmp, store) = open_temp().await;
        store.put_item("feed", &item("a", "hello")).await.unwrap();

        let got: Option<IndexItem> = store.get("feed", "a").await.unwrap();
        assert_eq!(got.unwrap().text, "hello");
        assert_eq!(store.count("feed").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let (_tmp, store) = open_temp().await;
        store.put_item("feed", &item("a", "v1")).await.unwrap();
        store.put_item("feed", &item("a", "v2")).await.unwrap();

        assert_eq!(store.count("feed").await.unwrap(), 1);
        let got: IndexItem = store.get("feed", "a").await.unwrap().unwrap();
        assert_eq!(got.text, "v2");
    }

    #[tokio::test]
    async fn new_collection_bumps_version() {
        let (_tmp, store) = open_temp().await;
        let before = store.schema_version().await.unwrap();

        store.put_item("feed", &item("a", "x")).await.unwrap();
        let after_first = store.schema_version().await.unwrap();
        assert_eq!(after_first, before + 1);

        // Same collection again: no bump.
        store.put_item("feed", &item("b", "y")).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), after_first);

        store.put_item("bulletins", &item("c", "z")).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), after_first + 1);
    }

    #[tokio::test]
    async fn reopen_preserves_collections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.sqlite");

        {
            let store = Store::open(&path).await.unwrap();
            store.put_item("feed", &item("a", "x")).await.unwrap();
            store.close().await;
        }

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.count("feed").await.unwrap(), 1);
        assert!(store
            .collections()
            .await
            .unwrap()
            .contains(&"feed".to_string()));
    }

    #[tokio::test]
    async fn clear_scopes_to_one_collection() {
        let (_tmp, store) = open_temp().await;
        store.put_item("feed", &item("a", "x")).await.unwrap();
        store.put_item("bulletins", &item("b", "y")).await.unwrap();

        store.clear("feed").await.unwrap();
        assert_eq!(store.count("feed").await.unwrap(), 0);
        assert_eq!(store.count("bulletins").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_items_are_skipped_on_load() {
        let (_tmp, store) = open_temp().await;
        store.put_item("feed", &item("a", "x")).await.unwrap();
        // A record with an empty text is stored but filtered on load.
        store
            .put("feed", "broken", &serde_json::json!({
                "id": "broken", "text": "", "category": "feed", "content": "",
                "date_added": 0, "action_id": "", "render_component_id": ""
            }))
            .await
            .unwrap();

        let items = store.get_all_items("feed").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a");
    }
}
