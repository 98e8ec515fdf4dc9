use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{RunId, RunRecord, RunStatus};
use crate::config::{StorageBackend, StorageConfig};
use crate::errors::StoreError;

/// Durable keyed storage for run records.
///
/// Every `upsert` is durable before it returns. Upserts for the same run are
/// serialized by the implementation; the pipeline engine is the only writer
/// while a run is active.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or replace the record with the same `run_id`.
    async fn upsert(&self, run: RunRecord) -> Result<RunRecord, StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    /// All runs, newest first by `created_at`.
    async fn list(&self) -> Result<Vec<RunRecord>, StoreError>;

    async fn list_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| statuses.contains(&r.status))
            .collect())
    }
}

/// Open the store selected by the storage configuration.
pub fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    match config.backend {
        StorageBackend::Sqlite => {
            if let Some(parent) = config.db_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .context("Failed to create run store directory")?;
            }
            let store = SqliteRunStore::open(&config.db_path)
                .with_context(|| format!("Failed to open run store at {}", config.db_path.display()))?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryRunStore::default())),
    }
}

// ── SQLite backend ───────────────────────────────────────────────────

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA synchronous = FULL;")
            .context("Failed to configure synchronous writes")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    client_id TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    record TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let record = serde_json::to_string(run).map_err(|source| StoreError::Encode {
            run_id: run.run_id,
            source,
        })?;
        self.conn
            .execute(
                "INSERT INTO runs (run_id, client_id, mode, status, created_at, updated_at, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at,
                    record = excluded.record",
                params![
                    run.run_id.to_string(),
                    run.client_id,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    run.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    record,
                ],
            )
            .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("Failed to upsert run")))?;
        Ok(())
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Database(anyhow::Error::new(e).context("Failed to query run")))?;
        record
            .map(|json| serde_json::from_str(&json).map_err(StoreError::Decode))
            .transpose()
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let db_err = |e: rusqlite::Error| {
            StoreError::Database(anyhow::Error::new(e).context("Failed to list runs"))
        };
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM runs ORDER BY created_at DESC, rowid DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut runs = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            runs.push(serde_json::from_str(&json).map_err(StoreError::Decode)?);
        }
        Ok(runs)
    }
}

/// SQLite-backed run store.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads. The mutex also serializes upserts of the same run.
#[derive(Clone)]
pub struct SqliteRunStore {
    inner: Arc<Mutex<RunDb>>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_db(RunDb::new(path)?))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::from_db(RunDb::new_in_memory()?))
    }

    pub fn from_db(db: RunDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&RunDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn upsert(&self, run: RunRecord) -> Result<RunRecord, StoreError> {
        self.call(move |db| {
            db.upsert_run(&run)?;
            Ok(run)
        })
        .await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        self.call(move |db| db.get_run(run_id)).await
    }

    async fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.call(|db| db.list_runs()).await
    }
}

// ── In-memory backend ────────────────────────────────────────────────

/// Process-local run store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, (u64, RunRecord)>>,
    next_seq: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn upsert(&self, run: RunRecord) -> Result<RunRecord, StoreError> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        let seq = match runs.get(&run.run_id) {
            Some((seq, _)) => *seq,
            None => self
                .next_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        };
        runs.insert(run.run_id, (seq, run.clone()));
        Ok(run)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(runs.get(&run_id).map(|(_, run)| run.clone()))
    }

    async fn list(&self) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut entries: Vec<&(u64, RunRecord)> = runs.values().collect();
        entries.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(entries.into_iter().map(|(_, run)| run.clone()).collect())
    }
}
