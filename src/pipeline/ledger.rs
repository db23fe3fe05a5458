use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::broadcast;
use trilha_common::{
    Actor, AttendanceStatus, AuditStamp, CaseId, NewSession, Session, SessionId, SessionNotesPatch,
};

use super::clock::Clock;
use super::db::DbHandle;
use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Notification that sessions of `case_id` changed. Boards use it to
/// recompute pendency counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionChange {
    pub case_id: CaseId,
    pub kind: SessionChangeKind,
    pub session_ids: Vec<SessionId>,
}

#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// `actor` is recorded as the session's creator.
    async fn add(&self, new_session: NewSession, actor: &Actor) -> Result<Session, PipelineError>;

    /// Add several sessions for one case atomically.
    async fn add_many(
        &self,
        sessions: Vec<NewSession>,
        actor: &Actor,
    ) -> Result<Vec<Session>, PipelineError>;

    /// Store a session record as-is, e.g. a migrated legacy record.
    async fn import(&self, session: Session) -> Result<Session, PipelineError>;

    async fn get(&self, id: &str) -> Result<Session, PipelineError>;

    /// Newest resolved start first; see `trilha_common::sort_newest_first`.
    async fn list_by_case(&self, case_id: &str) -> Result<Vec<Session>, PipelineError>;

    /// Idempotent: setting the current status again changes nothing.
    async fn set_attendance(
        &self,
        id: &str,
        status: AttendanceStatus,
        actor: &Actor,
    ) -> Result<Session, PipelineError>;

    async fn set_notes(
        &self,
        id: &str,
        notes: SessionNotesPatch,
        actor: &Actor,
    ) -> Result<Session, PipelineError>;

    /// Delete the assignment's sessions starting at or after `reference`.
    async fn delete_future_from(
        &self,
        case_id: &str,
        assignment_id: &str,
        reference: NaiveDateTime,
    ) -> Result<usize, PipelineError>;

    fn subscribe_changes(&self) -> broadcast::Receiver<SessionChange>;
}

pub struct SqliteSessionLedger {
    db: DbHandle,
    clock: Arc<dyn Clock>,
    tx: broadcast::Sender<SessionChange>,
}

impl SqliteSessionLedger {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { db, clock, tx }
    }

    fn notify(&self, case_id: &str, kind: SessionChangeKind, session_ids: Vec<SessionId>) {
        let _ = self.tx.send(SessionChange {
            case_id: case_id.to_string(),
            kind,
            session_ids,
        });
    }
}

#[async_trait]
impl SessionLedger for SqliteSessionLedger {
    async fn add(&self, new_session: NewSession, actor: &Actor) -> Result<Session, PipelineError> {
        let mut added = self.add_many(vec![new_session], actor).await?;
        added
            .pop()
            .ok_or_else(|| PipelineError::StoreUnavailable(anyhow::anyhow!("Session insert returned nothing")))
    }

    async fn add_many(
        &self,
        sessions: Vec<NewSession>,
        actor: &Actor,
    ) -> Result<Vec<Session>, PipelineError> {
        let Some(case_id) = sessions.first().map(|s| s.case_id.clone()) else {
            return Ok(Vec::new());
        };
        let stamp = AuditStamp::new(self.clock.now(), actor);
        let sessions: Vec<Session> = sessions
            .into_iter()
            .map(|new_session| Session::scheduled_by(new_session, &stamp))
            .collect();
        let sessions = self
            .db
            .call(move |db| {
                db.insert_sessions(&sessions)?;
                Ok(sessions)
            })
            .await
            .map_err(PipelineError::from_store)?;
        self.notify(
            &case_id,
            SessionChangeKind::Added,
            sessions.iter().map(|s| s.id.clone()).collect(),
        );
        Ok(sessions)
    }

    async fn import(&self, session: Session) -> Result<Session, PipelineError> {
        let session = self
            .db
            .call(move |db| {
                db.insert_session(&session)?;
                Ok(session)
            })
            .await
            .map_err(PipelineError::from_store)?;
        self.notify(&session.case_id, SessionChangeKind::Added, vec![session.id.clone()]);
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Session, PipelineError> {
        let id = id.to_string();
        let lookup = id.clone();
        self.db
            .call(move |db| db.get_session(&lookup))
            .await
            .map_err(PipelineError::from_store)?
            .ok_or(PipelineError::SessionNotFound { id })
    }

    async fn list_by_case(&self, case_id: &str) -> Result<Vec<Session>, PipelineError> {
        let case_id = case_id.to_string();
        self.db
            .call(move |db| db.list_sessions(&case_id))
            .await
            .map_err(PipelineError::from_store)
    }

    async fn set_attendance(
        &self,
        id: &str,
        status: AttendanceStatus,
        actor: &Actor,
    ) -> Result<Session, PipelineError> {
        let id = id.to_string();
        let stamp = AuditStamp::new(self.clock.now(), actor);
        let (session, changed) = self
            .db
            .call(move |db| db.set_session_attendance(&id, status, &stamp))
            .await
            .map_err(PipelineError::from_store)?;
        if changed {
            tracing::debug!(session_id = %session.id, status = status.as_str(), "Attendance recorded");
            self.notify(&session.case_id, SessionChangeKind::Updated, vec![session.id.clone()]);
        }
        Ok(session)
    }

    async fn set_notes(
        &self,
        id: &str,
        notes: SessionNotesPatch,
        actor: &Actor,
    ) -> Result<Session, PipelineError> {
        if notes.is_empty() {
            return self.get(id).await;
        }
        let id = id.to_string();
        let stamp = AuditStamp::new(self.clock.now(), actor);
        let session = self
            .db
            .call(move |db| db.set_session_notes(&id, &notes, &stamp))
            .await
            .map_err(PipelineError::from_store)?;
        self.notify(&session.case_id, SessionChangeKind::Updated, vec![session.id.clone()]);
        Ok(session)
    }

    async fn delete_future_from(
        &self,
        case_id: &str,
        assignment_id: &str,
        reference: NaiveDateTime,
    ) -> Result<usize, PipelineError> {
        let (case, assignment) = (case_id.to_string(), assignment_id.to_string());
        let deleted = self
            .db
            .call(move |db| db.delete_future_sessions(&case, &assignment, reference))
            .await
            .map_err(PipelineError::from_store)?;
        let count = deleted.len();
        if count > 0 {
            self.notify(case_id, SessionChangeKind::Deleted, deleted);
        }
        Ok(count)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.tx.subscribe()
    }
}
