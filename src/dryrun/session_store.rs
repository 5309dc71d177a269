//! Session Snapshot Store
//!
//! SQLite-backed persistence for supervisor snapshots. Snapshots are opaque
//! JSON blobs to this module; the supervisor owns their shape. Saves are
//! upserts keyed by session id; loads that fail to parse surface as
//! `dry_run_session_invalid` rather than panicking on corrupt rows.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Schema version for migrations.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    NotFound { session_id: String },
    InvalidSnapshot { session_id: String, detail: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "session store error: {e}"),
            Self::NotFound { session_id } => {
                write!(f, "dry_run_session_not_found: {session_id}")
            }
            Self::InvalidSnapshot { session_id, detail } => {
                write!(f, "dry_run_session_invalid: {session_id} ({detail})")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// Listing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub symbol: String,
    pub saved_at_ms: i64,
}

pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        "#,
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match current {
            None => {
                conn.execute(
                    r#"
                    CREATE TABLE IF NOT EXISTS dryrun_sessions (
                        session_id TEXT PRIMARY KEY,
                        symbol TEXT NOT NULL,
                        saved_at_ms INTEGER NOT NULL,
                        snapshot_blob TEXT NOT NULL
                    )
                "#,
                    [],
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("created session store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("session store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                return Err(StoreError::InvalidSnapshot {
                    session_id: String::new(),
                    detail: format!("unsupported schema version {v}"),
                });
            }
        }
        Ok(())
    }

    /// Upsert a snapshot.
    pub fn save<T: Serialize>(
        &self,
        session_id: &str,
        symbol: &str,
        saved_at_ms: i64,
        snapshot: &T,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_string(snapshot).map_err(|e| StoreError::InvalidSnapshot {
            session_id: session_id.to_string(),
            detail: e.to_string(),
        })?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO dryrun_sessions (session_id, symbol, saved_at_ms, snapshot_blob)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id) DO UPDATE SET
                symbol = excluded.symbol,
                saved_at_ms = excluded.saved_at_ms,
                snapshot_blob = excluded.snapshot_blob
        "#,
            params![session_id, symbol, saved_at_ms, blob],
        )?;
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, session_id: &str) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        let blob: Option<String> = conn
            .query_row(
                "SELECT snapshot_blob FROM dryrun_sessions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        let blob = blob.ok_or_else(|| StoreError::NotFound {
            session_id: session_id.to_string(),
        })?;
        serde_json::from_str(&blob).map_err(|e| StoreError::InvalidSnapshot {
            session_id: session_id.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, symbol, saved_at_ms FROM dryrun_sessions ORDER BY saved_at_ms DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                symbol: row.get(1)?,
                saved_at_ms: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
