//! Case persistence and the live case feed.
//!
//! Every committed write publishes a [`CaseChange`] on a broadcast channel
//! while the database lock is still held, so subscribers observe changes to
//! one case in commit order. Each [`CaseSubscription`] filters the shared
//! feed against its own status set and classifies events as added, modified
//! or removed relative to that set.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use trilha_common::{AuditStamp, Case, CasePatch, NewCase, StageKey};

use super::db::DbHandle;
use crate::errors::PipelineError;

/// What the write did to one case: its status before the write (`None` for
/// a newly opened case) and its state after.
#[derive(Debug, Clone)]
pub struct CaseChange {
    pub previous_status: Option<StageKey>,
    pub case: Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseEvent {
    pub kind: ChangeKind,
    pub case: Case,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(CaseEvent),
    /// The subscriber fell behind and missed `n` changes; resynchronize
    /// from a fresh snapshot.
    Lagged(u64),
}

/// Decrements the store's live-subscription count when dropped.
struct SubscriptionGuard {
    counter: Arc<AtomicUsize>,
}

impl SubscriptionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live query over cases whose status is in a fixed set.
///
/// Yields the matching cases present at subscription time as `added`, then
/// live changes. Dropping it ends the subscription.
pub struct CaseSubscription {
    statuses: BTreeSet<StageKey>,
    backlog: VecDeque<Case>,
    rx: broadcast::Receiver<Arc<CaseChange>>,
    _guard: SubscriptionGuard,
}

impl CaseSubscription {
    /// Take the initial snapshot without waiting on the live feed.
    pub fn take_backlog(&mut self) -> Vec<Case> {
        self.backlog.drain(..).collect()
    }

    /// Next relevant item, or `None` once the store is gone.
    ///
    /// Cancel-safe: an item is only consumed when it is returned.
    pub async fn recv(&mut self) -> Option<FeedItem> {
        if let Some(case) = self.backlog.pop_front() {
            return Some(FeedItem::Event(CaseEvent {
                kind: ChangeKind::Added,
                case,
            }));
        }
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if let Some(event) = classify(&self.statuses, &change) {
                        return Some(FeedItem::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(missed = n, "Case feed lagged");
                    return Some(FeedItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Relative to `statuses`: entering is added, staying is modified, leaving
/// is removed. Changes entirely outside the set are not reported.
fn classify(statuses: &BTreeSet<StageKey>, change: &CaseChange) -> Option<CaseEvent> {
    let was_in = change
        .previous_status
        .is_some_and(|s| statuses.contains(&s));
    let is_in = statuses.contains(&change.case.status);
    let kind = match (was_in, is_in) {
        (false, true) => ChangeKind::Added,
        (true, true) => ChangeKind::Modified,
        (true, false) => ChangeKind::Removed,
        (false, false) => return None,
    };
    Some(CaseEvent {
        kind,
        case: change.case.clone(),
    })
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn create(&self, new_case: NewCase, stamp: AuditStamp) -> Result<Case, PipelineError>;

    async fn get(&self, id: &str) -> Result<Case, PipelineError>;

    async fn list_by_status(
        &self,
        statuses: &BTreeSet<StageKey>,
    ) -> Result<Vec<Case>, PipelineError>;

    /// One atomic write applying only the fields the patch names.
    async fn update(
        &self,
        id: &str,
        patch: CasePatch,
        stamp: AuditStamp,
    ) -> Result<Case, PipelineError>;

    async fn subscribe(
        &self,
        statuses: BTreeSet<StageKey>,
    ) -> Result<CaseSubscription, PipelineError>;

    /// Number of subscriptions not yet dropped.
    fn active_subscriptions(&self) -> usize;
}

pub struct SqliteCaseStore {
    db: DbHandle,
    tx: broadcast::Sender<Arc<CaseChange>>,
    subscriptions: Arc<AtomicUsize>,
}

impl SqliteCaseStore {
    pub fn new(db: DbHandle, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            db,
            tx,
            subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CaseStore for SqliteCaseStore {
    async fn create(&self, new_case: NewCase, stamp: AuditStamp) -> Result<Case, PipelineError> {
        let tx = self.tx.clone();
        self.db
            .call(move |db| {
                let case = Case::open(new_case, stamp);
                db.insert_case(&case)?;
                // No receivers is fine.
                let _ = tx.send(Arc::new(CaseChange {
                    previous_status: None,
                    case: case.clone(),
                }));
                Ok(case)
            })
            .await
            .map_err(PipelineError::from_store)
    }

    async fn get(&self, id: &str) -> Result<Case, PipelineError> {
        let id = id.to_string();
        let lookup = id.clone();
        self.db
            .call(move |db| db.get_case(&lookup))
            .await
            .map_err(PipelineError::from_store)?
            .ok_or(PipelineError::CaseNotFound { id })
    }

    async fn list_by_status(
        &self,
        statuses: &BTreeSet<StageKey>,
    ) -> Result<Vec<Case>, PipelineError> {
        let statuses = statuses.clone();
        self.db
            .call(move |db| db.list_cases_by_status(&statuses))
            .await
            .map_err(PipelineError::from_store)
    }

    async fn update(
        &self,
        id: &str,
        patch: CasePatch,
        stamp: AuditStamp,
    ) -> Result<Case, PipelineError> {
        let id = id.to_string();
        let tx = self.tx.clone();
        self.db
            .call(move |db| {
                let (before, after) = db.update_case(&id, &patch, &stamp)?;
                let _ = tx.send(Arc::new(CaseChange {
                    previous_status: Some(before.status),
                    case: after.clone(),
                }));
                Ok(after)
            })
            .await
            .map_err(PipelineError::from_store)
    }

    async fn subscribe(
        &self,
        statuses: BTreeSet<StageKey>,
    ) -> Result<CaseSubscription, PipelineError> {
        let tx = self.tx.clone();
        let query = statuses.clone();
        // Subscribe and snapshot under the same lock: no write can slip in
        // between the two.
        let (rx, backlog) = self
            .db
            .call(move |db| {
                let rx = tx.subscribe();
                let cases = db.list_cases_by_status(&query)?;
                Ok((rx, cases))
            })
            .await
            .map_err(PipelineError::from_store)?;
        tracing::debug!(statuses = statuses.len(), initial = backlog.len(), "Case subscription opened");
        Ok(CaseSubscription {
            statuses,
            backlog: backlog.into(),
            rx,
            _guard: SubscriptionGuard::new(self.subscriptions.clone()),
        })
    }

    fn active_subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}
