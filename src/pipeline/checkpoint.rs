//! Durable snapshots of suspended runs, keyed by thread id.
//!
//! Every store keeps the state as serialized JSON. A snapshot that no longer
//! deserializes is reported as [`CheckpointError::Corrupt`] so the
//! orchestrator can fail the run instead of guessing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

use super::state::PipelineState;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Invalid thread id: {0}")]
    InvalidThreadId(String),

    #[error("Checkpoint for thread {thread_id} is corrupt: {reason}")]
    Corrupt { thread_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CheckpointError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CheckpointError::Corrupt { .. })
    }
}

/// Persistence for suspended runs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<(), CheckpointError>;

    /// `Ok(None)` when nothing is stored under `thread_id`.
    async fn load(&self, thread_id: &str) -> Result<Option<PipelineState>, CheckpointError>;

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

fn decode(thread_id: &str, raw: &str) -> Result<PipelineState, CheckpointError> {
    serde_json::from_str(raw).map_err(|e| CheckpointError::Corrupt {
        thread_id: thread_id.to_string(),
        reason: e.to_string(),
    })
}

/// Thread ids double as file names: ASCII alphanumerics, `-`, `_` and `.`, at most 128 chars.
pub fn validate_thread_id(thread_id: &str) -> Result<(), CheckpointError> {
    let valid = !thread_id.is_empty()
        && thread_id.len() <= 128
        && thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && thread_id != "."
        && thread_id != "..";
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidThreadId(thread_id.to_string()))
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store, used by tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    snapshots: RwLock<HashMap<String, String>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under `thread_id`, bypassing serialization.
    pub fn insert_raw(&self, thread_id: &str, raw: impl Into<String>) {
        self.snapshots
            .write()
            .expect("checkpoint lock poisoned")
            .insert(thread_id.to_string(), raw.into());
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().expect("checkpoint lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<(), CheckpointError> {
        let raw = serde_json::to_string(state)?;
        self.insert_raw(thread_id, raw);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<PipelineState>, CheckpointError> {
        let raw = self
            .snapshots
            .read()
            .expect("checkpoint lock poisoned")
            .get(thread_id)
            .cloned();
        raw.map(|raw| decode(thread_id, &raw)).transpose()
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        self.snapshots
            .write()
            .expect("checkpoint lock poisoned")
            .remove(thread_id);
        Ok(())
    }
}

// ============================================================================
// File
// ============================================================================

/// One JSON file per thread under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_thread_id(thread_id)?;
        Ok(self.dir.join(format!("{}.json", thread_id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<(), CheckpointError> {
        let path = self.path_for(thread_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(thread_id, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<PipelineState>, CheckpointError> {
        let path = self.path_for(thread_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => decode(thread_id, &raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(thread_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// Checkpoints in a SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Connect to `database_url` (e.g. `sqlite://aria.db`), creating the file
    /// and table when missing.
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool; the table is created if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aria_checkpoints (
                thread_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<(), CheckpointError> {
        let raw = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO aria_checkpoints (thread_id, status, state, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (thread_id) DO UPDATE SET
                status = excluded.status,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(thread_id)
        .bind(state.status.to_string())
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<PipelineState>, CheckpointError> {
        let row = sqlx::query("SELECT state FROM aria_checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("state")?;
                decode(thread_id, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM aria_checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
