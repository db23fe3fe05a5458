//! Append-only audit log of case transitions and terminal actions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trilha_common::{Actor, CaseId, StageKey};

use super::db::DbHandle;
use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKind {
    /// Status change decided by a stage module's save.
    RuleTransition,
    /// Operator override that bypassed the stage module.
    ManualMove,
    FinalCommunication,
    FileAttached,
    CaseOpened,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleTransition => "rule-transition",
            Self::ManualMove => "manual-move",
            Self::FinalCommunication => "final-communication",
            Self::FileAttached => "file-attached",
            Self::CaseOpened => "case-opened",
        }
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule-transition" => Ok(Self::RuleTransition),
            "manual-move" => Ok(Self::ManualMove),
            "final-communication" => Ok(Self::FinalCommunication),
            "file-attached" => Ok(Self::FileAttached),
            "case-opened" => Ok(Self::CaseOpened),
            _ => Err(format!("Invalid history kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub case_id: CaseId,
    pub kind: HistoryKind,
    pub from_status: Option<StageKey>,
    pub to_status: Option<StageKey>,
    pub actor: Actor,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub case_id: CaseId,
    pub kind: HistoryKind,
    pub from_status: Option<StageKey>,
    pub to_status: Option<StageKey>,
    pub actor: Actor,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait CaseHistory: Send + Sync {
    async fn append(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, PipelineError>;
    async fn list(&self, case_id: &str) -> Result<Vec<HistoryEntry>, PipelineError>;
}

pub struct SqliteCaseHistory {
    db: DbHandle,
}

impl SqliteCaseHistory {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CaseHistory for SqliteCaseHistory {
    async fn append(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, PipelineError> {
        self.db
            .call(move |db| db.append_history(&entry))
            .await
            .map_err(PipelineError::from_store)
    }

    async fn list(&self, case_id: &str) -> Result<Vec<HistoryEntry>, PipelineError> {
        let case_id = case_id.to_string();
        self.db
            .call(move |db| db.list_history(&case_id))
            .await
            .map_err(PipelineError::from_store)
    }
}
