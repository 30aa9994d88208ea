use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{AuditEvent, AuditPersistenceError, RunOutcome, RunRecord, RunStatus};
use crate::catalog::PrivilegeTier;

/// Captured output larger than this is truncated in the stored record; the
/// byte counters keep the true size.
const CAPTURE_CAP_BYTES: usize = 64 * 1024;

/// SQLite-backed run log.
///
/// `correlation_id` is the primary key, which makes the write path
/// idempotent: replaying a `Begin` after a crash-recovery retry is an
/// `INSERT OR IGNORE` no-op, and replaying a `Finish` only matches rows
/// still in the pending state. Terminal rows are immutable.
pub struct AuditStore {
    db: Mutex<Connection>,
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct RunQuery {
    pub capability_id: Option<String>,
    pub status: Option<RunStatus>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditStore {
    /// Open (or create) the run log in the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self, AuditPersistenceError> {
        let db_path = data_dir.join("runs.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| AuditPersistenceError::Store(format!("failed to open run log: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, AuditPersistenceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, AuditPersistenceError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| AuditPersistenceError::Store(format!("failed to set WAL mode: {}", e)))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS run_log (
                correlation_id TEXT    PRIMARY KEY,
                capability_id  TEXT    NOT NULL,
                tier           TEXT    NOT NULL,
                status         TEXT    NOT NULL DEFAULT 'pending',
                started_at     TEXT    NOT NULL,
                finished_at    TEXT,
                exit_code      INTEGER,
                stdout         TEXT,
                stderr         TEXT,
                stdout_bytes   INTEGER NOT NULL DEFAULT 0,
                stderr_bytes   INTEGER NOT NULL DEFAULT 0,
                parsed         TEXT,
                failure        TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_run_started    ON run_log(started_at);
            CREATE INDEX IF NOT EXISTS idx_run_capability ON run_log(capability_id);
            CREATE INDEX IF NOT EXISTS idx_run_status     ON run_log(status);
            ",
        )
        .map_err(|e| AuditPersistenceError::Store(format!("failed to init run log schema: {}", e)))?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Apply a batch of writer events in one transaction, preserving order.
    pub fn apply(&self, events: &[AuditEvent]) -> Result<(), AuditPersistenceError> {
        if events.is_empty() {
            return Ok(());
        }

        let conn = self.db.lock().expect("run log lock poisoned");
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| AuditPersistenceError::Store(format!("transaction error: {}", e)))?;

        for event in events {
            match event {
                AuditEvent::Begin(record) => Self::insert_begin(&tx, record)?,
                AuditEvent::Finish {
                    correlation_id,
                    outcome,
                } => Self::apply_finish(&tx, correlation_id, outcome)?,
            }
        }

        tx.commit()
            .map_err(|e| AuditPersistenceError::Store(format!("commit error: {}", e)))
    }

    fn insert_begin(conn: &Connection, record: &RunRecord) -> Result<(), AuditPersistenceError> {
        conn.execute(
            "INSERT OR IGNORE INTO run_log
                 (correlation_id, capability_id, tier, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.correlation_id.to_string(),
                record.capability_id,
                record.tier.as_str(),
                record.status.as_str(),
                record.started_at.to_rfc3339(),
            ],
        )
        .map_err(|e| AuditPersistenceError::Store(format!("insert error: {}", e)))?;
        Ok(())
    }

    fn apply_finish(
        conn: &Connection,
        correlation_id: &Uuid,
        outcome: &RunOutcome,
    ) -> Result<(), AuditPersistenceError> {
        let (stdout, stdout_bytes) = truncate_capture(outcome.stdout.as_deref());
        let (stderr, stderr_bytes) = truncate_capture(outcome.stderr.as_deref());
        let parsed = outcome
            .parsed
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        // Only pending rows transition; replaying a finish is a no-op and a
        // terminal record can never be edited.
        conn.execute(
            "UPDATE run_log
                SET status = ?2, finished_at = ?3, exit_code = ?4,
                    stdout = ?5, stderr = ?6, stdout_bytes = ?7, stderr_bytes = ?8,
                    parsed = ?9, failure = ?10
              WHERE correlation_id = ?1 AND status = 'pending'",
            params![
                correlation_id.to_string(),
                outcome.status.as_str(),
                outcome.finished_at.to_rfc3339(),
                outcome.exit_code,
                stdout,
                stderr,
                stdout_bytes,
                stderr_bytes,
                parsed,
                outcome.failure,
            ],
        )
        .map_err(|e| AuditPersistenceError::Store(format!("update error: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, correlation_id: &Uuid) -> Result<Option<RunRecord>, AuditPersistenceError> {
        let conn = self.db.lock().expect("run log lock poisoned");
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM run_log WHERE correlation_id = ?1",
                COLUMNS
            ))
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))?;

        let mut rows = stmt
            .query_map(params![correlation_id.to_string()], row_to_record)
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))?;

        match rows.next() {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(AuditPersistenceError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    /// Query the run log with optional filters, most recent first.
    pub fn query(&self, q: &RunQuery) -> Result<Vec<RunRecord>, AuditPersistenceError> {
        let (sql, values) = build_query(
            &format!("SELECT {} FROM run_log", COLUMNS),
            q,
            true,
        );
        let conn = self.db.lock().expect("run log lock poisoned");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))?;

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(params_refs.as_slice(), row_to_record)
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| AuditPersistenceError::Store(e.to_string()))?);
        }
        Ok(results)
    }

    pub fn count(&self, q: &RunQuery) -> Result<usize, AuditPersistenceError> {
        let (sql, values) = build_query("SELECT COUNT(*) FROM run_log", q, false);
        let conn = self.db.lock().expect("run log lock poisoned");
        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|p| p.as_ref()).collect();
        conn.query_row(&sql, params_refs.as_slice(), |row| row.get(0))
            .map_err(|e| AuditPersistenceError::Store(e.to_string()))
    }

    /// Bulk export of matching records as a JSON array.
    pub fn export_json(&self, q: &RunQuery) -> Result<String, AuditPersistenceError> {
        let records = self.query(q)?;
        serde_json::to_string_pretty(&records)
            .map_err(|e| AuditPersistenceError::Export(e.to_string()))
    }

    /// Delete terminal records older than the cutoff. Pending records are
    /// never purged. Returns the number of deleted rows. Callers are
    /// responsible for auditing the cleanup itself.
    pub fn purge_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize, AuditPersistenceError> {
        let conn = self.db.lock().expect("run log lock poisoned");
        conn.execute(
            "DELETE FROM run_log WHERE started_at < ?1 AND status != 'pending'",
            params![cutoff.to_rfc3339()],
        )
        .map_err(|e| AuditPersistenceError::Store(format!("purge error: {}", e)))
    }
}

const COLUMNS: &str = "correlation_id, capability_id, tier, status, started_at, finished_at, \
                       exit_code, stdout, stderr, stdout_bytes, stderr_bytes, parsed, failure";

fn build_query(
    base: &str,
    q: &RunQuery,
    paged: bool,
) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut sql = base.to_string();
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref capability_id) = q.capability_id {
        if capability_id.contains('*') {
            conditions.push(format!("capability_id GLOB ?{}", values.len() + 1));
        } else {
            conditions.push(format!("capability_id = ?{}", values.len() + 1));
        }
        values.push(Box::new(capability_id.clone()));
    }

    if let Some(status) = q.status {
        conditions.push(format!("status = ?{}", values.len() + 1));
        values.push(Box::new(status.as_str().to_string()));
    }

    if let Some(since) = q.since {
        conditions.push(format!("started_at >= ?{}", values.len() + 1));
        values.push(Box::new(since.to_rfc3339()));
    }

    if let Some(until) = q.until {
        conditions.push(format!("started_at <= ?{}", values.len() + 1));
        values.push(Box::new(until.to_rfc3339()));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if paged {
        sql.push_str(" ORDER BY started_at DESC");
        let limit = q.limit.unwrap_or(100).min(10_000);
        let offset = q.offset.unwrap_or(0);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
    }

    (sql, values)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let correlation: String = row.get(0)?;
    let tier: String = row.get(2)?;
    let status: String = row.get(3)?;
    let started: String = row.get(4)?;
    let finished: Option<String> = row.get(5)?;
    let parsed: Option<String> = row.get(11)?;

    Ok(RunRecord {
        correlation_id: Uuid::parse_str(&correlation).unwrap_or_default(),
        capability_id: row.get(1)?,
        tier: parse_tier(&tier),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        started_at: parse_timestamp(&started),
        finished_at: finished.as_deref().map(parse_timestamp),
        exit_code: row.get(6)?,
        stdout: row.get(7)?,
        stderr: row.get(8)?,
        stdout_bytes: row.get::<_, i64>(9)? as u64,
        stderr_bytes: row.get::<_, i64>(10)? as u64,
        parsed: parsed.and_then(|s| serde_json::from_str(&s).ok()),
        failure: row.get(12)?,
    })
}

fn parse_tier(s: &str) -> PrivilegeTier {
    match s {
        "elevated" => PrivilegeTier::Elevated,
        "automation" => PrivilegeTier::Automation,
        _ => PrivilegeTier::User,
    }
}

fn parse_timestamp(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_default()
}

fn truncate_capture(capture: Option<&str>) -> (Option<String>, i64) {
    match capture {
        None => (None, 0),
        Some(s) => {
            let bytes = s.len() as i64;
            if s.len() <= CAPTURE_CAP_BYTES {
                (Some(s.to_string()), bytes)
            } else {
                let mut cut = CAPTURE_CAP_BYTES;
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                (Some(s[..cut].to_string()), bytes)
            }
        }
    }
}
