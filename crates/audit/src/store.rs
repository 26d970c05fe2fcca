//! SQLite storage for audit records
//!
//! The interface is insert-and-read only. No update or delete method
//! exists on this type, so append-only is structural, not convention.

use crate::error::AuditError;
use crate::record::{AuditAction, AuditRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

/// Append-only SQLite store for audit records
pub(crate) struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Open (or create) a store at the given database path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), AuditError> {
        let conn = self.conn.lock().expect("audit store mutex poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                action TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                actor_name TEXT NOT NULL,
                actor_role TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                details TEXT,
                previous_status TEXT,
                new_status TEXT NOT NULL,
                signature TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_records_request
             ON audit_records(request_id)",
            [],
        )?;

        Ok(())
    }

    /// Insert a fully-formed record, returning it with its assigned id
    #[allow(clippy::too_many_arguments)]
    pub fn append_row(
        &self,
        request_id: &str,
        action: AuditAction,
        actor_id: &str,
        actor_name: &str,
        actor_role: &str,
        timestamp: &DateTime<Utc>,
        timestamp_canonical: &str,
        details: Option<&serde_json::Value>,
        previous_status: Option<&str>,
        new_status: &str,
        signature: &str,
    ) -> Result<AuditRecord, AuditError> {
        let details_json = details.map(serde_json::Value::to_string);

        let conn = self.conn.lock().expect("audit store mutex poisoned");
        conn.execute(
            "INSERT INTO audit_records
             (request_id, action, actor_id, actor_name, actor_role,
              timestamp, details, previous_status, new_status, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request_id,
                action.as_str(),
                actor_id,
                actor_name,
                actor_role,
                timestamp_canonical,
                details_json,
                previous_status,
                new_status,
                signature,
            ],
        )?;

        let id = conn.last_insert_rowid();

        Ok(AuditRecord {
            id,
            request_id: request_id.to_string(),
            action,
            actor_id: actor_id.to_string(),
            actor_name: actor_name.to_string(),
            actor_role: actor_role.to_string(),
            timestamp: *timestamp,
            details: details.cloned(),
            previous_status: previous_status.map(str::to_string),
            new_status: new_status.to_string(),
            signature: signature.to_string(),
        })
    }

    /// Get one record by id
    pub fn get(&self, id: i64) -> Result<AuditRecord, AuditError> {
        let conn = self.conn.lock().expect("audit store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, request_id, action, actor_id, actor_name, actor_role,
                    timestamp, details, previous_status, new_status, signature
             FROM audit_records WHERE id = ?1",
        )?;

        let raw = stmt
            .query_row(params![id], raw_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AuditError::NotFound(id),
                other => AuditError::Database(other),
            })?;

        record_from_raw(raw)
    }

    /// All records for one request, ordered by id (insertion order)
    pub fn for_request(&self, request_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock().expect("audit store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, request_id, action, actor_id, actor_name, actor_role,
                    timestamp, details, previous_status, new_status, signature
             FROM audit_records WHERE request_id = ?1 ORDER BY id ASC",
        )?;

        let raws: Vec<RawRecord> = stmt
            .query_map(params![request_id], raw_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(record_from_raw).collect()
    }
}

/// Column tuple straight out of SQLite, before decoding
type RawRecord = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn record_from_raw(raw: RawRecord) -> Result<AuditRecord, AuditError> {
    let (
        id,
        request_id,
        action_str,
        actor_id,
        actor_name,
        actor_role,
        timestamp_str,
        details_json,
        previous_status,
        new_status,
        signature,
    ) = raw;

    let action = AuditAction::from_str(&action_str)
        .ok_or(AuditError::UnknownAction(action_str))?;

    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|e| AuditError::Corrupt(format!("bad timestamp in record {}: {}", id, e)))?
        .with_timezone(&Utc);

    let details = match details_json {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(AuditRecord {
        id,
        request_id,
        action,
        actor_id,
        actor_name,
        actor_role,
        timestamp,
        details,
        previous_status,
        new_status,
        signature,
    })
}
