use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use trilha_common::{
    AttendanceStatus, AuditStamp, Case, CaseField, CasePatch, Session, SessionId,
    SessionNotesPatch, StageKey, sort_newest_first,
};

use super::history::{HistoryEntry, HistoryKind, NewHistoryEntry};
use crate::errors::PipelineError;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open an in-memory database and wrap it. Used by tests and the CLI's
    /// dry paths.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(PipelineDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PipelineDb {
    conn: Connection,
}

const CASE_COLUMNS: &str = "id, status, patient, assignments, availability, contribution_amount, clinical_notes, attached_files, records, last_updated_at, last_updated_by, created_at";

const SESSION_COLUMNS: &str = "id, case_id, assignment_id, scheduled_at, legacy_date, legacy_hour, attendance, notes, status_changed_at, status_changed_by, notes_updated_at, notes_updated_by, created_at, created_by";

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS cases (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    patient TEXT NOT NULL,
                    assignments TEXT NOT NULL DEFAULT '[]',
                    availability TEXT NOT NULL DEFAULT '[]',
                    contribution_amount REAL,
                    clinical_notes TEXT NOT NULL DEFAULT '{}',
                    attached_files TEXT NOT NULL DEFAULT '[]',
                    records TEXT NOT NULL DEFAULT '{}',
                    last_updated_at TEXT NOT NULL,
                    last_updated_by TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    case_id TEXT NOT NULL REFERENCES cases(id),
                    assignment_id TEXT,
                    scheduled_at TEXT,
                    legacy_date TEXT,
                    legacy_hour TEXT,
                    attendance TEXT NOT NULL DEFAULT 'scheduled',
                    notes TEXT NOT NULL DEFAULT '{}',
                    status_changed_at TEXT,
                    status_changed_by TEXT,
                    notes_updated_at TEXT,
                    notes_updated_by TEXT,
                    created_at TEXT,
                    created_by TEXT
                );

                CREATE TABLE IF NOT EXISTS case_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    case_id TEXT NOT NULL REFERENCES cases(id),
                    kind TEXT NOT NULL,
                    from_status TEXT,
                    to_status TEXT,
                    actor TEXT NOT NULL,
                    detail TEXT,
                    at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status);
                CREATE INDEX IF NOT EXISTS idx_sessions_case ON sessions(case_id);
                CREATE INDEX IF NOT EXISTS idx_history_case ON case_history(case_id);
                ",
            )
            .context("Failed to create tables")?;

        // Sessions tables created before these columns existed.
        for column in [
            "notes_updated_at",
            "notes_updated_by",
            "created_at",
            "created_by",
        ] {
            if !self.has_column("sessions", column)? {
                self.conn
                    .execute(&format!("ALTER TABLE sessions ADD COLUMN {column} TEXT"), [])
                    .with_context(|| format!("Failed to add sessions.{} column", column))?;
            }
        }

        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .context("Failed to read table info")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .context("Failed to read table columns")?;
        for name in names {
            if name? == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Cases ────────────────────────────────────────────────────────────

    pub fn insert_case(&self, case: &Case) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO cases ({CASE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    case.id,
                    case.status.as_str(),
                    serde_json::to_string(&case.patient)?,
                    serde_json::to_string(&case.assignments)?,
                    serde_json::to_string(&case.availability)?,
                    case.contribution_amount,
                    serde_json::to_string(&case.clinical_notes)?,
                    serde_json::to_string(&case.attached_files)?,
                    serde_json::to_string(&case.records)?,
                    fmt_instant(&case.audit.last_updated_at),
                    serde_json::to_string(&case.audit.last_updated_by)?,
                    fmt_instant(&case.created_at),
                ],
            )
            .context("Failed to insert case")?;
        Ok(())
    }

    pub fn get_case(&self, id: &str) -> Result<Option<Case>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = ?1"))
            .context("Failed to prepare get_case")?;
        let row = stmt
            .query_row(params![id], CaseRow::from_row)
            .optional()
            .context("Failed to query case")?;
        row.map(CaseRow::into_case).transpose()
    }

    /// Every case whose status is in `statuses`, oldest update first.
    pub fn list_cases_by_status(&self, statuses: &BTreeSet<StageKey>) -> Result<Vec<Case>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CASE_COLUMNS} FROM cases WHERE status IN ({placeholders}) ORDER BY last_updated_at, id"
            ))
            .context("Failed to prepare list_cases_by_status")?;
        let keys: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(keys), CaseRow::from_row)
            .context("Failed to query cases")?;
        let mut cases = Vec::new();
        for row in rows {
            let r = row.context("Failed to read case row")?;
            cases.push(r.into_case()?);
        }
        Ok(cases)
    }

    /// Apply `patch` to the freshest persisted copy and write back only the
    /// touched columns plus the audit stamp, in one transaction. Returns the
    /// case as it was before and after the write.
    pub fn update_case(
        &self,
        id: &str,
        patch: &CasePatch,
        stamp: &AuditStamp,
    ) -> Result<(Case, Case)> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let before = self
            .get_case(id)?
            .ok_or_else(|| PipelineError::CaseNotFound { id: id.to_string() })?;
        let mut after = before.clone();
        patch.apply_to(&mut after, stamp)?;

        for field in patch.touched_fields() {
            let (column, value): (&str, rusqlite::types::Value) = match field {
                CaseField::Status => ("status", after.status.as_str().to_string().into()),
                CaseField::Availability => {
                    ("availability", serde_json::to_string(&after.availability)?.into())
                }
                CaseField::ContributionAmount => (
                    "contribution_amount",
                    after
                        .contribution_amount
                        .map(rusqlite::types::Value::Real)
                        .unwrap_or(rusqlite::types::Value::Null),
                ),
                CaseField::ClinicalNotes => (
                    "clinical_notes",
                    serde_json::to_string(&after.clinical_notes)?.into(),
                ),
                CaseField::Assignments => {
                    ("assignments", serde_json::to_string(&after.assignments)?.into())
                }
                CaseField::Records => ("records", serde_json::to_string(&after.records)?.into()),
                CaseField::AttachedFiles => (
                    "attached_files",
                    serde_json::to_string(&after.attached_files)?.into(),
                ),
            };
            tx.execute(
                &format!("UPDATE cases SET {column} = ?1 WHERE id = ?2"),
                params![value, id],
            )
            .with_context(|| format!("Failed to update case {column}"))?;
        }

        tx.execute(
            "UPDATE cases SET last_updated_at = ?1, last_updated_by = ?2 WHERE id = ?3",
            params![
                fmt_instant(&stamp.last_updated_at),
                serde_json::to_string(&stamp.last_updated_by)?,
                id
            ],
        )
        .context("Failed to stamp case audit fields")?;

        tx.commit().context("Failed to commit case update")?;
        Ok((before, after))
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    session.id,
                    session.case_id,
                    session.assignment_id,
                    session.scheduled_at.as_ref().map(fmt_local),
                    session.legacy_date,
                    session.legacy_hour,
                    session.attendance.as_str(),
                    serde_json::to_string(&session.notes)?,
                    session.status_changed_at.as_ref().map(fmt_instant),
                    session
                        .status_changed_by
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    session.notes_updated_at.as_ref().map(fmt_instant),
                    session
                        .notes_updated_by
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    session.created_at.as_ref().map(fmt_instant),
                    session
                        .created_by
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// Insert several sessions atomically.
    pub fn insert_sessions(&self, sessions: &[Session]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for session in sessions {
            self.insert_session(session)?;
        }
        tx.commit().context("Failed to commit session batch")?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))
            .context("Failed to prepare get_session")?;
        let row = stmt
            .query_row(params![id], SessionRow::from_row)
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Sessions of a case, newest resolved start first.
    pub fn list_sessions(&self, case_id: &str) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE case_id = ?1"
            ))
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(params![case_id], SessionRow::from_row)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        sort_newest_first(&mut sessions);
        Ok(sessions)
    }

    /// Returns the session and whether anything was written. Setting the
    /// status it already has is a no-op and leaves the stamp alone.
    pub fn set_session_attendance(
        &self,
        id: &str,
        status: AttendanceStatus,
        stamp: &AuditStamp,
    ) -> Result<(Session, bool)> {
        let mut session = self
            .get_session(id)?
            .ok_or_else(|| PipelineError::SessionNotFound { id: id.to_string() })?;
        if session.attendance == status {
            return Ok((session, false));
        }
        self.conn
            .execute(
                "UPDATE sessions SET attendance = ?1, status_changed_at = ?2, status_changed_by = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    fmt_instant(&stamp.last_updated_at),
                    serde_json::to_string(&stamp.last_updated_by)?,
                    id
                ],
            )
            .context("Failed to update session attendance")?;
        session.attendance = status;
        session.status_changed_at = Some(stamp.last_updated_at);
        session.status_changed_by = Some(stamp.last_updated_by.clone());
        Ok((session, true))
    }

    pub fn set_session_notes(
        &self,
        id: &str,
        patch: &SessionNotesPatch,
        stamp: &AuditStamp,
    ) -> Result<Session> {
        let mut session = self
            .get_session(id)?
            .ok_or_else(|| PipelineError::SessionNotFound { id: id.to_string() })?;
        patch.apply(&mut session.notes);
        session.notes_updated_at = Some(stamp.last_updated_at);
        session.notes_updated_by = Some(stamp.last_updated_by.clone());
        self.conn
            .execute(
                "UPDATE sessions SET notes = ?1, notes_updated_at = ?2, notes_updated_by = ?3 WHERE id = ?4",
                params![
                    serde_json::to_string(&session.notes)?,
                    fmt_instant(&stamp.last_updated_at),
                    serde_json::to_string(&stamp.last_updated_by)?,
                    id
                ],
            )
            .context("Failed to update session notes")?;
        Ok(session)
    }

    /// Delete the assignment's sessions starting at or after `reference` and
    /// return their ids. Sessions whose start cannot be resolved are kept.
    pub fn delete_future_sessions(
        &self,
        case_id: &str,
        assignment_id: &str,
        reference: NaiveDateTime,
    ) -> Result<Vec<SessionId>> {
        let doomed: Vec<SessionId> = self
            .list_sessions(case_id)?
            .into_iter()
            .filter(|s| s.assignment_id.as_deref() == Some(assignment_id))
            .filter(|s| s.resolved_start().is_some_and(|start| start >= reference))
            .map(|s| s.id)
            .collect();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for id in &doomed {
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])
                .context("Failed to delete session")?;
        }
        tx.commit().context("Failed to commit session purge")?;
        Ok(doomed)
    }

    // ── History ──────────────────────────────────────────────────────────

    pub fn append_history(&self, entry: &NewHistoryEntry) -> Result<HistoryEntry> {
        self.conn
            .execute(
                "INSERT INTO case_history (case_id, kind, from_status, to_status, actor, detail, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.case_id,
                    entry.kind.as_str(),
                    entry.from_status.map(|s| s.as_str()),
                    entry.to_status.map(|s| s.as_str()),
                    serde_json::to_string(&entry.actor)?,
                    entry.detail,
                    fmt_instant(&entry.at),
                ],
            )
            .context("Failed to insert history entry")?;
        Ok(HistoryEntry {
            id: self.conn.last_insert_rowid(),
            case_id: entry.case_id.clone(),
            kind: entry.kind,
            from_status: entry.from_status,
            to_status: entry.to_status,
            actor: entry.actor.clone(),
            detail: entry.detail.clone(),
            at: entry.at,
        })
    }

    /// History of a case in insertion order.
    pub fn list_history(&self, case_id: &str) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, case_id, kind, from_status, to_status, actor, detail, at
                 FROM case_history WHERE case_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_history")?;
        let rows = stmt
            .query_map(params![case_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query history")?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, case_id, kind, from, to, actor, detail, at) =
                row.context("Failed to read history row")?;
            entries.push(HistoryEntry {
                id,
                case_id,
                kind: HistoryKind::from_str(&kind)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse history kind")?,
                from_status: from.as_deref().map(parse_status).transpose()?,
                to_status: to.as_deref().map(parse_status).transpose()?,
                actor: serde_json::from_str(&actor).context("Failed to parse history actor")?,
                detail,
                at: parse_instant(&at)?,
            });
        }
        Ok(entries)
    }
}

// ── Row mapping ──────────────────────────────────────────────────────────

struct CaseRow {
    id: String,
    status: String,
    patient: String,
    assignments: String,
    availability: String,
    contribution_amount: Option<f64>,
    clinical_notes: String,
    attached_files: String,
    records: String,
    last_updated_at: String,
    last_updated_by: String,
    created_at: String,
}

impl CaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            patient: row.get(2)?,
            assignments: row.get(3)?,
            availability: row.get(4)?,
            contribution_amount: row.get(5)?,
            clinical_notes: row.get(6)?,
            attached_files: row.get(7)?,
            records: row.get(8)?,
            last_updated_at: row.get(9)?,
            last_updated_by: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_case(self) -> Result<Case> {
        let status = StageKey::from_str(&self.status).map_err(|_| {
            tracing::error!(case_id = %self.id, status = %self.status, "Persisted case status is not a known stage");
            PipelineError::RegistryMismatch {
                status: self.status.clone(),
            }
        })?;
        Ok(Case {
            status,
            patient: serde_json::from_str(&self.patient).context("Failed to parse patient JSON")?,
            assignments: serde_json::from_str(&self.assignments)
                .context("Failed to parse assignments JSON")?,
            availability: serde_json::from_str(&self.availability)
                .context("Failed to parse availability JSON")?,
            contribution_amount: self.contribution_amount,
            clinical_notes: serde_json::from_str(&self.clinical_notes)
                .context("Failed to parse clinical notes JSON")?,
            attached_files: serde_json::from_str(&self.attached_files)
                .context("Failed to parse attached files JSON")?,
            records: serde_json::from_str(&self.records).context("Failed to parse records JSON")?,
            audit: AuditStamp {
                last_updated_at: parse_instant(&self.last_updated_at)?,
                last_updated_by: serde_json::from_str(&self.last_updated_by)
                    .context("Failed to parse last_updated_by JSON")?,
            },
            created_at: parse_instant(&self.created_at)?,
            id: self.id,
        })
    }
}

struct SessionRow {
    id: String,
    case_id: String,
    assignment_id: Option<String>,
    scheduled_at: Option<String>,
    legacy_date: Option<String>,
    legacy_hour: Option<String>,
    attendance: String,
    notes: String,
    status_changed_at: Option<String>,
    status_changed_by: Option<String>,
    notes_updated_at: Option<String>,
    notes_updated_by: Option<String>,
    created_at: Option<String>,
    created_by: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            case_id: row.get(1)?,
            assignment_id: row.get(2)?,
            scheduled_at: row.get(3)?,
            legacy_date: row.get(4)?,
            legacy_hour: row.get(5)?,
            attendance: row.get(6)?,
            notes: row.get(7)?,
            status_changed_at: row.get(8)?,
            status_changed_by: row.get(9)?,
            notes_updated_at: row.get(10)?,
            notes_updated_by: row.get(11)?,
            created_at: row.get(12)?,
            created_by: row.get(13)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let attendance = AttendanceStatus::from_str(&self.attendance)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session attendance")?;
        Ok(Session {
            id: self.id,
            case_id: self.case_id,
            assignment_id: self.assignment_id,
            scheduled_at: self.scheduled_at.as_deref().map(parse_local).transpose()?,
            legacy_date: self.legacy_date,
            legacy_hour: self.legacy_hour,
            attendance,
            notes: serde_json::from_str(&self.notes).context("Failed to parse session notes")?,
            status_changed_at: self
                .status_changed_at
                .as_deref()
                .map(parse_instant)
                .transpose()?,
            status_changed_by: self
                .status_changed_by
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse status_changed_by JSON")?,
            notes_updated_at: self
                .notes_updated_at
                .as_deref()
                .map(parse_instant)
                .transpose()?,
            notes_updated_by: self
                .notes_updated_by
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse notes_updated_by JSON")?,
            created_at: self.created_at.as_deref().map(parse_instant).transpose()?,
            created_by: self
                .created_by
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse created_by JSON")?,
        })
    }
}

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn fmt_instant(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Failed to parse timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn fmt_local(at: &NaiveDateTime) -> String {
    at.format(LOCAL_FORMAT).to_string()
}

fn parse_local(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, LOCAL_FORMAT)
        .with_context(|| format!("Failed to parse session start '{}'", s))
}

fn parse_status(s: &str) -> Result<StageKey> {
    StageKey::from_str(s).map_err(|_| {
        PipelineError::RegistryMismatch {
            status: s.to_string(),
        }
        .into()
    })
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use trilha_common::{Actor, NewCase, NewSession, PatientInfo};

    fn actor() -> Actor {
        Actor::new("u1", "Recepção")
    }

    fn stamp() -> AuditStamp {
        AuditStamp::new(Utc::now(), &actor())
    }

    fn new_case(db: &PipelineDb, name: &str) -> Result<Case> {
        let case = Case::open(
            NewCase {
                patient: PatientInfo {
                    name: name.into(),
                    ..Default::default()
                },
                ..Default::default()
            },
            stamp(),
        );
        db.insert_case(&case)?;
        Ok(case)
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('cases', 'sessions', 'case_history')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3);

        // Re-running is harmless.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_migrations_upgrade_old_sessions_table() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                assignment_id TEXT,
                scheduled_at TEXT,
                legacy_date TEXT,
                legacy_hour TEXT,
                attendance TEXT NOT NULL DEFAULT 'scheduled',
                notes TEXT NOT NULL DEFAULT '{}',
                status_changed_at TEXT,
                status_changed_by TEXT
            );
            INSERT INTO sessions (id, case_id, legacy_date) VALUES ('old', 'c1', '03/03/2025');
            ",
        )?;
        let db = PipelineDb { conn };
        db.run_migrations()?;
        db.run_migrations()?;

        for column in ["notes_updated_at", "notes_updated_by", "created_at", "created_by"] {
            assert!(db.has_column("sessions", column)?, "missing {}", column);
        }
        let old = db.get_session("old")?.expect("old session survives");
        assert_eq!(old.legacy_date.as_deref(), Some("03/03/2025"));
        assert!(old.created_by.is_none());
        Ok(())
    }

    #[test]
    fn test_session_creator_round_trips() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Ana")?;
        let session = Session::scheduled_by(
            NewSession {
                case_id: case.id.clone(),
                assignment_id: None,
                scheduled_at: at(2025, 3, 20, 10),
            },
            &stamp(),
        );
        db.insert_session(&session)?;
        let loaded = db.get_session(&session.id)?.expect("session exists");
        assert_eq!(loaded.created_by, session.created_by);
        assert!(loaded.created_at.is_some());
        Ok(())
    }

    #[test]
    fn test_case_round_trips() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Maria Souza")?;
        let loaded = db.get_case(&case.id)?.expect("case exists");
        assert_eq!(loaded.patient.name, "Maria Souza");
        assert_eq!(loaded.status, StageKey::IntakeDocuments);
        assert!(db.get_case("nope")?.is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_persisted_status_is_registry_mismatch() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Ana")?;
        db.conn.execute(
            "UPDATE cases SET status = 'limbo' WHERE id = ?1",
            params![case.id],
        )?;
        let err = db.get_case(&case.id).unwrap_err();
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::RegistryMismatch { ref status } if status == "limbo"
        ));
        Ok(())
    }

    #[test]
    fn test_update_writes_only_touched_columns() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Ana")?;
        // Another writer changed the contribution behind our back.
        db.conn.execute(
            "UPDATE cases SET contribution_amount = 40.0 WHERE id = ?1",
            params![case.id],
        )?;

        let (before, after) =
            db.update_case(&case.id, &CasePatch::status(StageKey::AwaitingTriage), &stamp())?;
        assert_eq!(before.status, StageKey::IntakeDocuments);
        assert_eq!(after.status, StageKey::AwaitingTriage);
        assert_eq!(after.contribution_amount, Some(40.0));

        let reloaded = db.get_case(&case.id)?.expect("case exists");
        assert_eq!(reloaded.contribution_amount, Some(40.0));
        assert_eq!(reloaded.status, StageKey::AwaitingTriage);
        Ok(())
    }

    #[test]
    fn test_update_missing_case_is_not_found() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let err = db
            .update_case("ghost", &CasePatch::status(StageKey::Discharged), &stamp())
            .unwrap_err();
        assert!(matches!(
            PipelineError::from_store(err),
            PipelineError::CaseNotFound { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_delete_future_sessions_keeps_past_and_other_assignments() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Ana")?;
        let mk = |assignment: &str, start| {
            Session::scheduled(NewSession {
                case_id: case.id.clone(),
                assignment_id: Some(assignment.into()),
                scheduled_at: start,
            })
        };
        let past = mk("a1", at(2025, 3, 1, 10));
        let future = mk("a1", at(2025, 3, 20, 10));
        let other = mk("a2", at(2025, 3, 20, 10));
        db.insert_sessions(&[past.clone(), future.clone(), other.clone()])?;

        let deleted = db.delete_future_sessions(&case.id, "a1", at(2025, 3, 10, 0))?;
        assert_eq!(deleted, vec![future.id.clone()]);
        let remaining: Vec<_> = db
            .list_sessions(&case.id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert!(remaining.contains(&past.id));
        assert!(remaining.contains(&other.id));
        assert!(!remaining.contains(&future.id));
        Ok(())
    }

    #[test]
    fn test_history_in_insertion_order() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let case = new_case(&db, "Ana")?;
        for (kind, detail) in [
            (HistoryKind::RuleTransition, "confirm-documents"),
            (HistoryKind::ManualMove, "correção"),
        ] {
            db.append_history(&NewHistoryEntry {
                case_id: case.id.clone(),
                kind,
                from_status: Some(StageKey::IntakeDocuments),
                to_status: Some(StageKey::AwaitingTriage),
                actor: actor(),
                detail: Some(detail.into()),
                at: Utc::now(),
            })?;
        }
        let entries = db.list_history(&case.id)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, HistoryKind::RuleTransition);
        assert_eq!(entries[1].kind, HistoryKind::ManualMove);
        assert!(entries[0].id < entries[1].id);
        Ok(())
    }
}
