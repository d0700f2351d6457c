use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;
use shared::{paths::StorePath, protocol::StoreWrite};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{tree, KvStore, MemoryStore, Snapshot, StoreError, Subscription};

/// Durable store: leaves are written through to SQLite, reads and
/// notifications are served from the in-memory tree.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    tree: MemoryStore,
    write_lane: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let store = Self {
            pool,
            tree: MemoryStore::new(),
            write_lane: Arc::new(Mutex::new(())),
        };
        store.load().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn subscriber_count(&self) -> usize {
        self.tree.subscriber_count()
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn load(&self) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT path, value FROM store_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut loaded = 0usize;
        for row in rows {
            let raw_path: String = row.try_get("path")?;
            let raw_value: String = row.try_get("value")?;
            let path = match StorePath::parse(&raw_path) {
                Ok(path) => path,
                Err(error) => {
                    warn!(path = %raw_path, %error, "storage: skipping entry with invalid path");
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&raw_value) {
                Ok(value) => {
                    self.tree.apply(&path, tree::prune(value));
                    loaded += 1;
                }
                Err(error) => {
                    warn!(path = %raw_path, %error, "storage: skipping entry with malformed value")
                }
            }
        }
        info!(entries = loaded, "storage: loaded persisted store entries");
        Ok(())
    }

    async fn persist(&self, path: &StorePath, value: &Snapshot) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // The written path, everything below it, and any leaf above it that
        // the write turns into an object.
        sqlx::query(
            r#"
            DELETE FROM store_entries
            WHERE path = ?1
               OR substr(path, 1, length(?2)) = ?2
               OR substr(?1, 1, length(path) + 1) = path || '/'
            "#,
        )
        .bind(path.as_str())
        .bind(format!("{}/", path.as_str()))
        .execute(&mut *tx)
        .await?;

        if let Some(value) = value {
            let mut leaves = Vec::new();
            tree::flatten(path.as_str(), value, &mut leaves);
            for (leaf_path, leaf_value) in leaves {
                let encoded = serde_json::to_string(&leaf_value).map_err(|error| {
                    StoreError::Malformed {
                        path: leaf_path.clone(),
                        reason: error.to_string(),
                    }
                })?;
                sqlx::query(
                    r#"
                    INSERT INTO store_entries (path, value, updated_at)
                    VALUES (?1, ?2, CURRENT_TIMESTAMP)
                    ON CONFLICT(path) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
                    "#,
                )
                .bind(&leaf_path)
                .bind(encoded)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        Ok(self.tree.read(path))
    }

    async fn set(&self, path: &StorePath, write: StoreWrite) -> Result<(), StoreError> {
        let _lane = self.write_lane.lock().await;
        let value = self.tree.resolve(write);
        self.persist(path, &value).await?;
        self.tree.apply(path, value);
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        Ok(self.tree.watch(path))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<(), StoreError> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent)?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
