//! SQLite storage for approval requests
//!
//! Transitions are conditional updates: `UPDATE ... WHERE id = ? AND
//! status = ?`, with the affected-row count deciding who wins a race.
//! The sign-off tally uses an additional compare-and-swap on the
//! serialized tally so concurrent approvers cannot lose each other's
//! sign-offs. Rows are never deleted.
//!
//! Timestamps are stored RFC 3339 UTC with fixed microsecond precision,
//! so lexicographic comparison in SQL is chronological comparison.

use crate::request::{ApprovalRequest, ApprovalSignoff, RequestStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Errors from the request store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Corrupt request row: {0}")]
    Corrupt(String),
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad {} timestamp: {}", field, e)))
}

/// Durable store for approval requests
pub struct RequestStore {
    conn: Mutex<Connection>,
}

impl RequestStore {
    /// Open (or create) a store at the given database path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approval_requests (
                id TEXT PRIMARY KEY,
                operation_type TEXT NOT NULL,
                requester_id TEXT NOT NULL,
                requester_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                approvals TEXT NOT NULL,
                approved_by TEXT,
                approved_by_name TEXT,
                approved_at TEXT,
                rejection_reason TEXT,
                execution_result TEXT,
                executed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_approval_requests_status
             ON approval_requests(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_approval_requests_requester
             ON approval_requests(requester_id)",
            [],
        )?;

        Ok(())
    }

    /// Insert a freshly created request
    pub fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let approvals_json = serde_json::to_string(&request.approvals)?;

        let conn = self.conn.lock().expect("request store mutex poisoned");
        conn.execute(
            "INSERT INTO approval_requests
             (id, operation_type, requester_id, requester_name, payload, reason,
              status, created_at, expires_at, approvals, approved_by,
              approved_by_name, approved_at, rejection_reason, execution_result,
              executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                request.id,
                request.operation_type,
                request.requester_id,
                request.requester_name,
                request.payload.to_string(),
                request.reason,
                request.status.as_str(),
                fmt_ts(&request.created_at),
                fmt_ts(&request.expires_at),
                approvals_json,
                request.approved_by,
                request.approved_by_name,
                request.approved_at.as_ref().map(fmt_ts),
                request.rejection_reason,
                request.execution_result.as_ref().map(Value::to_string),
                request.executed_at.as_ref().map(fmt_ts),
            ],
        )?;

        Ok(())
    }

    /// Get a request by id
    pub fn get(&self, id: &str) -> Result<ApprovalRequest, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_REQUEST))?;

        let raw = stmt
            .query_row(params![id], raw_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(id.to_string()),
                other => StoreError::Database(other),
            })?;

        request_from_raw(raw)
    }

    /// Compare-and-swap the sign-off tally of a pending request
    ///
    /// Succeeds only if the request is still pending and its tally is
    /// exactly `expected`; returns false when a concurrent writer got
    /// there first (caller re-reads and retries).
    pub fn append_signoff(
        &self,
        id: &str,
        expected: &[ApprovalSignoff],
        updated: &[ApprovalSignoff],
    ) -> Result<bool, StoreError> {
        let expected_json = serde_json::to_string(expected)?;
        let updated_json = serde_json::to_string(updated)?;

        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests SET approvals = ?1
             WHERE id = ?2 AND status = 'pending' AND approvals = ?3",
            params![updated_json, id, expected_json],
        )?;

        Ok(rows > 0)
    }

    /// Conditional pending -> approved transition
    ///
    /// Guards on both the status and the tally, so the final sign-off
    /// cannot race another approver's tally write.
    pub fn mark_approved(
        &self,
        id: &str,
        expected: &[ApprovalSignoff],
        updated: &[ApprovalSignoff],
        approved_by: &str,
        approved_by_name: &str,
        approved_at: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let expected_json = serde_json::to_string(expected)?;
        let updated_json = serde_json::to_string(updated)?;

        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests
             SET status = 'approved', approvals = ?1, approved_by = ?2,
                 approved_by_name = ?3, approved_at = ?4
             WHERE id = ?5 AND status = 'pending' AND approvals = ?6",
            params![
                updated_json,
                approved_by,
                approved_by_name,
                fmt_ts(approved_at),
                id,
                expected_json,
            ],
        )?;

        Ok(rows > 0)
    }

    /// Conditional pending -> rejected transition
    pub fn mark_rejected(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests SET status = 'rejected', rejection_reason = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![reason, id],
        )?;

        Ok(rows > 0)
    }

    /// Conditional pending -> cancelled transition
    pub fn mark_cancelled(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests SET status = 'cancelled'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;

        Ok(rows > 0)
    }

    /// Conditional pending -> expired transition
    pub fn mark_expired(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests SET status = 'expired'
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;

        Ok(rows > 0)
    }

    /// Atomically claim an approved request for execution
    ///
    /// Stamps `executed_at` while the status is still `approved`; the
    /// affected-row count decides which of several racing executors gets
    /// to invoke the handler. The status transition itself happens after
    /// the handler returns, via `mark_executed`/`mark_execution_failed`.
    pub fn claim_execution(
        &self,
        id: &str,
        claimed_at: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests SET executed_at = ?1
             WHERE id = ?2 AND status = 'approved' AND executed_at IS NULL",
            params![fmt_ts(claimed_at), id],
        )?;

        Ok(rows > 0)
    }

    /// Conditional approved -> executed transition
    pub fn mark_executed(
        &self,
        id: &str,
        result: &Value,
        executed_at: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests
             SET status = 'executed', execution_result = ?1, executed_at = ?2
             WHERE id = ?3 AND status = 'approved'",
            params![result.to_string(), fmt_ts(executed_at), id],
        )?;

        Ok(rows > 0)
    }

    /// Conditional approved -> execution_failed transition
    pub fn mark_execution_failed(
        &self,
        id: &str,
        error: &Value,
        executed_at: &DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let rows = conn.execute(
            "UPDATE approval_requests
             SET status = 'execution_failed', execution_result = ?1, executed_at = ?2
             WHERE id = ?3 AND status = 'approved'",
            params![error.to_string(), fmt_ts(executed_at), id],
        )?;

        Ok(rows > 0)
    }

    /// All pending requests, optionally filtered by operation type
    pub fn list_pending(
        &self,
        operation_type: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");

        let raws: Vec<RawRequest> = match operation_type {
            Some(op) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = 'pending' AND operation_type = ?1
                     ORDER BY created_at DESC",
                    SELECT_REQUEST
                ))?;
                let rows = stmt.query_map(params![op], raw_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = 'pending' ORDER BY created_at DESC",
                    SELECT_REQUEST
                ))?;
                let rows = stmt.query_map([], raw_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        raws.into_iter().map(request_from_raw).collect()
    }

    /// All requests made by one requester, newest first
    pub fn list_by_requester(
        &self,
        requester_id: &str,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE requester_id = ?1 ORDER BY created_at DESC",
            SELECT_REQUEST
        ))?;

        let raws: Vec<RawRequest> = stmt
            .query_map(params![requester_id], raw_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(request_from_raw).collect()
    }

    /// Paginated history, optionally filtered by status and operation type
    pub fn list_history(
        &self,
        status: Option<RequestStatus>,
        operation_type: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let status_str = status.map(|s| s.as_str().to_string());

        let conn = self.conn.lock().expect("request store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "{} WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR operation_type = ?2)
             ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
            SELECT_REQUEST
        ))?;

        let raws: Vec<RawRequest> = stmt
            .query_map(
                params![status_str, operation_type, limit, offset],
                raw_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(request_from_raw).collect()
    }

    /// Ids of pending requests whose deadline has passed
    ///
    /// Inclusive comparison, matching `ApprovalRequest::is_expired_at`:
    /// at the exact deadline instant the request is already expired.
    pub fn list_expired(&self, now: &DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id FROM approval_requests
             WHERE status = 'pending' AND expires_at <= ?1
             ORDER BY expires_at ASC",
        )?;

        let ids = stmt
            .query_map(params![fmt_ts(now)], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    /// Number of requests with the given status
    pub fn count_by_status(&self, status: RequestStatus) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("request store mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approval_requests WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }
}

const SELECT_REQUEST: &str = "SELECT id, operation_type, requester_id, requester_name,
        payload, reason, status, created_at, expires_at, approvals, approved_by,
        approved_by_name, approved_at, rejection_reason, execution_result, executed_at
 FROM approval_requests";

/// Column tuple straight out of SQLite, before decoding
type RawRequest = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawRequest> {
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
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
    ))
}

fn request_from_raw(raw: RawRequest) -> Result<ApprovalRequest, StoreError> {
    let (
        id,
        operation_type,
        requester_id,
        requester_name,
        payload_json,
        reason,
        status_str,
        created_at_str,
        expires_at_str,
        approvals_json,
        approved_by,
        approved_by_name,
        approved_at_str,
        rejection_reason,
        execution_result_json,
        executed_at_str,
    ) = raw;

    let status = RequestStatus::from_str(&status_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status: {}", status_str)))?;

    let approved_at = approved_at_str
        .map(|s| parse_ts(&s, "approved_at"))
        .transpose()?;
    let executed_at = executed_at_str
        .map(|s| parse_ts(&s, "executed_at"))
        .transpose()?;
    let execution_result = execution_result_json
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(ApprovalRequest {
        id,
        operation_type,
        requester_id,
        requester_name,
        payload: serde_json::from_str(&payload_json)?,
        reason,
        status,
        created_at: parse_ts(&created_at_str, "created_at")?,
        expires_at: parse_ts(&expires_at_str, "expires_at")?,
        approvals: serde_json::from_str(&approvals_json)?,
        approved_by,
        approved_by_name,
        approved_at,
        rejection_reason,
        execution_result,
        executed_at,
    })
}
