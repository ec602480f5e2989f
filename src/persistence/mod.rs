//! Durable storage for the audit log.
//!
//! Records are append-only: the SQLite schema rejects updates and deletes
//! with triggers, so history can only grow.

use crate::audit::AuditRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info};

/// Backing store for audit records.
pub trait AuditStore: Send {
    /// Persist one record. Sequences arrive strictly increasing.
    fn append(&mut self, record: &AuditRecord) -> Result<()>;

    /// All records ordered by sequence.
    fn load_all(&self) -> Result<Vec<AuditRecord>>;
}

/// SQLite-backed audit store, one row per record.
pub struct SqliteAuditStore {
    conn: Connection,
}

impl SqliteAuditStore {
    /// Open (or create) the audit database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Audit store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                sequence INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_log(kind);

            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit log is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit log is append-only');
            END;
            "#,
            )
            .context("Failed to initialize audit schema")?;

        debug!("Audit schema initialized");
        Ok(())
    }
}

impl AuditStore for SqliteAuditStore {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_log (sequence, kind, payload, recorded_at, prev_hash, hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.sequence as i64,
                    record.kind,
                    record.payload,
                    record.recorded_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    record.prev_hash,
                    record.hash,
                ],
            )
            .with_context(|| format!("Failed to persist audit record {}", record.sequence))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence, kind, payload, recorded_at, prev_hash, hash
             FROM audit_log ORDER BY sequence ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (sequence, kind, payload, recorded_at, prev_hash, hash) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .with_context(|| format!("Invalid timestamp on audit record {}", sequence))?
                .with_timezone(&Utc);
            records.push(AuditRecord {
                sequence: sequence as u64,
                kind,
                payload,
                recorded_at,
                prev_hash,
                hash,
            });
        }

        Ok(records)
    }
}

/// Volatile audit store.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Vec<AuditRecord>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.clone())
    }
}
