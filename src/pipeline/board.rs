//! Per-client Kanban board over one named view.
//!
//! A [`PipelineBoard`] holds at most one [`CaseSubscription`]. Opening a new
//! view drops the previous subscription before the next one is created, so a
//! client switching views never holds two. Updates are deltas: only the card
//! an event touches is rebuilt, and column counts are recomputed from the
//! card map.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use trilha_common::{Case, CaseId, StageKey};

use super::Services;
use super::ledger::SessionChange;
use super::pendency::{PendencyCounts, compute_pendencies};
use super::store::{CaseEvent, CaseSubscription, ChangeKind, FeedItem};
use crate::errors::PipelineError;

/// A named group of statuses shown as columns, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardView {
    pub name: String,
    pub label: String,
    pub statuses: Vec<StageKey>,
}

impl BoardView {
    fn preset(name: &str, label: &str, statuses: &[StageKey]) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            statuses: statuses.to_vec(),
        }
    }

    pub fn presets() -> Vec<BoardView> {
        use StageKey::*;
        vec![
            Self::preset(
                "entrada",
                "Entrada",
                &[IntakeDocuments, AwaitingTriage, TriageScheduled],
            ),
            Self::preset(
                "acolhimento",
                "Acolhimento",
                &[ReferredToCrisisCare, InCrisisCare],
            ),
            Self::preset(
                "psicoterapia-breve",
                "Psicoterapia breve",
                &[
                    ReferredToBriefTherapy,
                    AwaitingScheduleInfo,
                    ScheduleSubmitted,
                    InBriefTherapy,
                ],
            ),
            Self::preset(
                "encaminhamentos",
                "Encaminhamentos",
                &[
                    PartnerReferral,
                    AwaitingPartnerResponse,
                    GroupReferral,
                    AwaitingReassessment,
                ],
            ),
            Self::preset("encerramento", "Encerramento", &[Discharged, DroppedOut]),
        ]
    }

    pub fn status_set(&self) -> BTreeSet<StageKey> {
        self.statuses.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardSummary {
    pub case_id: CaseId,
    pub patient_name: String,
    pub status: StageKey,
    pub staff: Vec<String>,
    pub last_updated_at: DateTime<Utc>,
    pub pendencies: PendencyCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSnapshot {
    pub status: StageKey,
    pub label: &'static str,
    pub count: usize,
    pub cards: Vec<CardSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub view: BoardView,
    pub columns: Vec<ColumnSnapshot>,
}

pub type ColumnCounts = BTreeMap<StageKey, usize>;

/// A delta for clients already holding a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum BoardUpdate {
    CardUpserted {
        column: StageKey,
        card: CardSummary,
        counts: ColumnCounts,
    },
    CardMoved {
        from: StageKey,
        to: StageKey,
        card: CardSummary,
        counts: ColumnCounts,
    },
    CardRemoved {
        column: StageKey,
        case_id: CaseId,
        counts: ColumnCounts,
    },
    /// The live feed was lost; replace everything.
    Reset { snapshot: BoardSnapshot },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    Case(FeedItem),
    Sessions(SessionChange),
    SessionsLagged,
}

pub struct PipelineBoard {
    services: Services,
    view: Option<BoardView>,
    subscription: Option<CaseSubscription>,
    sessions: broadcast::Receiver<SessionChange>,
    cards: HashMap<CaseId, CardSummary>,
}

impl PipelineBoard {
    pub fn new(services: Services) -> Self {
        let sessions = services.ledger.subscribe_changes();
        Self {
            services,
            view: None,
            subscription: None,
            sessions,
            cards: HashMap::new(),
        }
    }

    /// Show `view`, replacing whatever was open.
    ///
    /// The previous subscription is dropped before the new one is created.
    /// If the new view cannot be loaded, the previous view is subscribed
    /// again and the error is returned.
    pub async fn open(&mut self, view: BoardView) -> Result<BoardSnapshot, PipelineError> {
        let previous = self.view.take();
        let previous_cards = std::mem::take(&mut self.cards);
        self.subscription = None;

        match self.load(&view).await {
            Ok((subscription, cards)) => {
                tracing::debug!(view = %view.name, cards = cards.len(), "Board view opened");
                self.install(view, subscription, cards);
                self.snapshot().ok_or_else(|| {
                    PipelineError::StoreUnavailable(anyhow::anyhow!("Board view vanished"))
                })
            }
            Err(err) => {
                tracing::warn!(view = %view.name, error = %err, "Failed to open board view");
                if let Some(previous) = previous {
                    self.restore(previous, previous_cards).await;
                }
                Err(err)
            }
        }
    }

    async fn load(
        &self,
        view: &BoardView,
    ) -> Result<(CaseSubscription, HashMap<CaseId, CardSummary>), PipelineError> {
        let mut subscription = self.services.store.subscribe(view.status_set()).await?;
        let mut cards = HashMap::new();
        for case in subscription.take_backlog() {
            let card = self.card_for(&case).await?;
            cards.insert(case.id.clone(), card);
        }
        Ok((subscription, cards))
    }

    fn install(
        &mut self,
        view: BoardView,
        subscription: CaseSubscription,
        cards: HashMap<CaseId, CardSummary>,
    ) {
        self.sessions = self.services.ledger.subscribe_changes();
        self.cards = cards;
        self.subscription = Some(subscription);
        self.view = Some(view);
    }

    /// Put `view` back after a failed switch. When it cannot be subscribed
    /// again either, the last known cards stay visible without a live feed.
    async fn restore(&mut self, view: BoardView, cards: HashMap<CaseId, CardSummary>) {
        match self.load(&view).await {
            Ok((subscription, fresh)) => self.install(view, subscription, fresh),
            Err(err) => {
                tracing::warn!(view = %view.name, error = %err, "Board view restored without live feed");
                self.cards = cards;
                self.view = Some(view);
            }
        }
    }

    /// Whether a feed is attached. [`Self::next_event`] resolves to `None`
    /// immediately when it is not.
    pub fn is_live(&self) -> bool {
        self.subscription.is_some()
    }

    /// Drop the subscription and forget all cards.
    pub fn close(&mut self) {
        self.subscription = None;
        self.view = None;
        self.cards.clear();
    }

    pub fn view(&self) -> Option<&BoardView> {
        self.view.as_ref()
    }

    pub fn snapshot(&self) -> Option<BoardSnapshot> {
        let view = self.view.as_ref()?;
        let columns = view
            .statuses
            .iter()
            .map(|status| {
                let mut cards: Vec<CardSummary> = self
                    .cards
                    .values()
                    .filter(|c| c.status == *status)
                    .cloned()
                    .collect();
                cards.sort_by(|a, b| {
                    a.last_updated_at
                        .cmp(&b.last_updated_at)
                        .then_with(|| a.case_id.cmp(&b.case_id))
                });
                ColumnSnapshot {
                    status: *status,
                    label: status.label(),
                    count: cards.len(),
                    cards,
                }
            })
            .collect();
        Some(BoardSnapshot {
            view: view.clone(),
            columns,
        })
    }

    pub fn counts(&self) -> ColumnCounts {
        let mut counts: ColumnCounts = self
            .view
            .iter()
            .flat_map(|v| v.statuses.iter().map(|s| (*s, 0)))
            .collect();
        for card in self.cards.values() {
            if let Some(n) = counts.get_mut(&card.status) {
                *n += 1;
            }
        }
        counts
    }

    /// Next raw event, or `None` when no view is open or the feeds closed.
    ///
    /// Cancel-safe, so it can sit in a `tokio::select!` next to socket reads.
    pub async fn next_event(&mut self) -> Option<BoardEvent> {
        let subscription = self.subscription.as_mut()?;
        tokio::select! {
            item = subscription.recv() => item.map(BoardEvent::Case),
            change = self.sessions.recv() => match change {
                Ok(change) => Some(BoardEvent::Sessions(change)),
                Err(broadcast::error::RecvError::Lagged(_)) => Some(BoardEvent::SessionsLagged),
                Err(broadcast::error::RecvError::Closed) => None,
            },
        }
    }

    /// Fold one event into the board. `None` when it didn't affect any card.
    pub async fn apply(&mut self, event: BoardEvent) -> Result<Option<BoardUpdate>, PipelineError> {
        match event {
            BoardEvent::Case(FeedItem::Event(CaseEvent { kind, case })) => {
                self.apply_case(kind, case).await
            }
            BoardEvent::Case(FeedItem::Lagged(_)) => self.reload().await.map(Some),
            BoardEvent::Sessions(change) => {
                if !self.cards.contains_key(&change.case_id) {
                    return Ok(None);
                }
                let case = self.services.store.get(&change.case_id).await?;
                self.apply_case(ChangeKind::Modified, case).await
            }
            BoardEvent::SessionsLagged => self.refresh_pendencies().await.map(Some),
        }
    }

    /// Wait for the next event that changes the board.
    pub async fn next_update(&mut self) -> Option<Result<BoardUpdate, PipelineError>> {
        loop {
            let event = self.next_event().await?;
            match self.apply(event).await {
                Ok(Some(update)) => return Some(Ok(update)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }

    async fn apply_case(
        &mut self,
        kind: ChangeKind,
        case: Case,
    ) -> Result<Option<BoardUpdate>, PipelineError> {
        if kind == ChangeKind::Removed {
            let Some(card) = self.cards.remove(&case.id) else {
                return Ok(None);
            };
            return Ok(Some(BoardUpdate::CardRemoved {
                column: card.status,
                case_id: card.case_id,
                counts: self.counts(),
            }));
        }
        // Build before touching the map so a failed lookup leaves it intact.
        let card = self.card_for(&case).await?;
        let previous = self.cards.insert(case.id.clone(), card.clone());
        let update = match previous {
            Some(prev) if prev.status != card.status => BoardUpdate::CardMoved {
                from: prev.status,
                to: card.status,
                card,
                counts: self.counts(),
            },
            _ => BoardUpdate::CardUpserted {
                column: card.status,
                card,
                counts: self.counts(),
            },
        };
        Ok(Some(update))
    }

    async fn reload(&mut self) -> Result<BoardUpdate, PipelineError> {
        let Some(view) = self.view.clone() else {
            return Err(PipelineError::StoreUnavailable(anyhow::anyhow!(
                "No board view open"
            )));
        };
        tracing::debug!(view = %view.name, "Board feed lagged, reloading");
        let cases = self.services.store.list_by_status(&view.status_set()).await?;
        let mut cards = HashMap::new();
        for case in cases {
            let card = self.card_for(&case).await?;
            cards.insert(case.id.clone(), card);
        }
        self.cards = cards;
        self.reset()
    }

    async fn refresh_pendencies(&mut self) -> Result<BoardUpdate, PipelineError> {
        let ids: Vec<CaseId> = self.cards.keys().cloned().collect();
        let mut refreshed = HashMap::new();
        for id in ids {
            let case = self.services.store.get(&id).await?;
            refreshed.insert(id, self.card_for(&case).await?);
        }
        self.cards = refreshed;
        self.reset()
    }

    fn reset(&self) -> Result<BoardUpdate, PipelineError> {
        self.snapshot()
            .map(|snapshot| BoardUpdate::Reset { snapshot })
            .ok_or_else(|| PipelineError::StoreUnavailable(anyhow::anyhow!("No board view open")))
    }

    async fn card_for(&self, case: &Case) -> Result<CardSummary, PipelineError> {
        let sessions = self.services.ledger.list_by_case(&case.id).await?;
        let pendencies = compute_pendencies(
            case,
            &sessions,
            self.services.clock.local_now(),
            &self.services.settings.pendency,
        );
        Ok(CardSummary {
            case_id: case.id.clone(),
            patient_name: case.patient.name.clone(),
            status: case.status,
            staff: case.open_staff_names(),
            last_updated_at: case.audit.last_updated_at,
            pendencies: PendencyCounts::of(&pendencies),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{local, services_at};
    use super::*;
    use crate::pipeline::stages::StageInput;
    use crate::pipeline::store::CaseStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use trilha_common::{
        Actor, AttendanceStatus, AuditStamp, CasePatch, NewCase, NewSession, PatientInfo,
    };

    /// Delegates to the real store but fails the next `n` subscribes.
    struct FlakyStore {
        inner: Arc<dyn CaseStore>,
        failing_subscribes: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_next(&self, n: usize) {
            self.failing_subscribes.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CaseStore for FlakyStore {
        async fn create(&self, new_case: NewCase, stamp: AuditStamp) -> Result<Case, PipelineError> {
            self.inner.create(new_case, stamp).await
        }

        async fn get(&self, id: &str) -> Result<Case, PipelineError> {
            self.inner.get(id).await
        }

        async fn list_by_status(
            &self,
            statuses: &BTreeSet<StageKey>,
        ) -> Result<Vec<Case>, PipelineError> {
            self.inner.list_by_status(statuses).await
        }

        async fn update(
            &self,
            id: &str,
            patch: CasePatch,
            stamp: AuditStamp,
        ) -> Result<Case, PipelineError> {
            self.inner.update(id, patch, stamp).await
        }

        async fn subscribe(
            &self,
            statuses: BTreeSet<StageKey>,
        ) -> Result<CaseSubscription, PipelineError> {
            let failing = self
                .failing_subscribes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(PipelineError::StoreUnavailable(anyhow::anyhow!("store offline")));
            }
            self.inner.subscribe(statuses).await
        }

        fn active_subscriptions(&self) -> usize {
            self.inner.active_subscriptions()
        }
    }

    fn flaky_services() -> (Services, Arc<FlakyStore>) {
        let (mut services, _clock) = services_at(local(2025, 3, 1, 9, 0));
        let flaky = Arc::new(FlakyStore {
            inner: services.store.clone(),
            failing_subscribes: AtomicUsize::new(0),
        });
        services.store = flaky.clone();
        (services, flaky)
    }

    fn reception() -> Actor {
        Actor::new("u1", "Recepção")
    }

    fn view(name: &str) -> BoardView {
        BoardView::presets()
            .into_iter()
            .find(|v| v.name == name)
            .unwrap()
    }

    fn patient(name: &str) -> NewCase {
        NewCase {
            patient: PatientInfo {
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn next(board: &mut PipelineBoard) -> BoardUpdate {
        tokio::time::timeout(Duration::from_secs(2), board.next_update())
            .await
            .expect("board update in time")
            .expect("feed open")
            .expect("update applied")
    }

    #[test]
    fn presets_cover_every_status_once() {
        let mut seen: Vec<StageKey> = BoardView::presets()
            .into_iter()
            .flat_map(|v| v.statuses)
            .collect();
        seen.sort();
        let mut all = StageKey::ALL.to_vec();
        all.sort();
        assert_eq!(seen, all);
    }

    #[tokio::test]
    async fn switching_views_keeps_one_subscription() {
        let (services, _clock) = services_at(local(2025, 3, 1, 9, 0));
        let mut board = services.board();
        board.open(view("entrada")).await.unwrap();
        board.open(view("acolhimento")).await.unwrap();
        board.open(view("encerramento")).await.unwrap();
        assert_eq!(services.store.active_subscriptions(), 1);
        assert_eq!(board.view().unwrap().name, "encerramento");

        board.close();
        assert_eq!(services.store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn snapshot_lists_columns_in_view_order() {
        let (services, _clock) = services_at(local(2025, 3, 1, 9, 0));
        services
            .coordinator()
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();

        let mut board = services.board();
        let snapshot = board.open(view("entrada")).await.unwrap();
        let statuses: Vec<StageKey> = snapshot.columns.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                StageKey::IntakeDocuments,
                StageKey::AwaitingTriage,
                StageKey::TriageScheduled
            ]
        );
        assert_eq!(snapshot.columns[0].count, 1);
        assert_eq!(snapshot.columns[0].cards[0].patient_name, "Maria Souza");
    }

    #[tokio::test]
    async fn moving_between_columns_yields_card_moved() {
        let (services, _clock) = services_at(local(2025, 3, 1, 9, 0));
        let mut board = services.board();
        board.open(view("entrada")).await.unwrap();

        let coordinator = services.coordinator();
        let case = coordinator
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();
        assert!(matches!(
            next(&mut board).await,
            BoardUpdate::CardUpserted { column: StageKey::IntakeDocuments, .. }
        ));

        coordinator
            .transition(
                &case.id,
                StageKey::AwaitingTriage,
                StageInput::ConfirmDocuments {
                    availability: [trilha_common::AvailabilityWindow {
                        period: trilha_common::DayPeriod::Evening,
                        weekday: trilha_common::DayOfWeek::Friday,
                    }]
                    .into_iter()
                    .collect(),
                    contribution_amount: None,
                },
                &reception(),
            )
            .await
            .unwrap();

        match next(&mut board).await {
            BoardUpdate::CardMoved {
                from, to, counts, ..
            } => {
                assert_eq!(from, StageKey::IntakeDocuments);
                assert_eq!(to, StageKey::AwaitingTriage);
                assert_eq!(counts[&StageKey::IntakeDocuments], 0);
                assert_eq!(counts[&StageKey::AwaitingTriage], 1);
            }
            other => panic!("expected card moved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn leaving_the_view_yields_card_removed() {
        let (services, _clock) = services_at(local(2025, 3, 1, 9, 0));
        let coordinator = services.coordinator();
        let case = coordinator
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();
        let mut board = services.board();
        board.open(view("entrada")).await.unwrap();

        coordinator
            .move_manually(&case.id, StageKey::DroppedOut, "Desistiu", &reception())
            .await
            .unwrap();

        match next(&mut board).await {
            BoardUpdate::CardRemoved {
                column,
                case_id,
                counts,
            } => {
                assert_eq!(column, StageKey::IntakeDocuments);
                assert_eq!(case_id, case.id);
                assert_eq!(counts.values().sum::<usize>(), 0);
            }
            other => panic!("expected card removed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_changes_recompute_pendency_counts() {
        let (services, _clock) = services_at(local(2025, 3, 11, 9, 0));
        let case = services
            .coordinator()
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();
        let session = services
            .ledger
            .add(
                NewSession {
                    case_id: case.id.clone(),
                    assignment_id: None,
                    scheduled_at: local(2025, 3, 1, 14, 0),
                },
                &reception(),
            )
            .await
            .unwrap();

        let mut board = services.board();
        let snapshot = board.open(view("entrada")).await.unwrap();
        assert_eq!(snapshot.columns[0].cards[0].pendencies.error, 1);

        services
            .ledger
            .set_attendance(&session.id, AttendanceStatus::Attended, &reception())
            .await
            .unwrap();

        match next(&mut board).await {
            BoardUpdate::CardUpserted { card, .. } => {
                assert_eq!(card.pendencies.error, 0);
                assert_eq!(card.pendencies.warning, 1);
            }
            other => panic!("expected card upserted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_switch_keeps_previous_view_live() {
        let (services, flaky) = flaky_services();
        let coordinator = services.coordinator();
        let case = coordinator
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();
        let mut board = services.board();
        board.open(view("entrada")).await.unwrap();

        flaky.fail_next(1);
        let err = board.open(view("encerramento")).await.unwrap_err();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
        assert!(!err.changed_state());

        assert_eq!(board.view().unwrap().name, "entrada");
        assert!(board.is_live());
        assert_eq!(services.store.active_subscriptions(), 1);
        let snapshot = board.snapshot().unwrap();
        assert_eq!(snapshot.columns[0].cards[0].case_id, case.id);

        coordinator
            .move_manually(&case.id, StageKey::AwaitingTriage, "Documentos ok", &reception())
            .await
            .unwrap();
        assert!(matches!(
            next(&mut board).await,
            BoardUpdate::CardMoved { to: StageKey::AwaitingTriage, .. }
        ));
    }

    #[tokio::test]
    async fn failed_switch_and_failed_restore_keep_last_cards() {
        let (services, flaky) = flaky_services();
        services
            .coordinator()
            .open_case(patient("Maria Souza"), &reception())
            .await
            .unwrap();
        let mut board = services.board();
        board.open(view("entrada")).await.unwrap();

        flaky.fail_next(2);
        assert!(board.open(view("acolhimento")).await.is_err());

        assert_eq!(board.view().unwrap().name, "entrada");
        assert!(!board.is_live());
        assert_eq!(services.store.active_subscriptions(), 0);
        assert_eq!(board.snapshot().unwrap().columns[0].count, 1);
        assert!(board.next_event().await.is_none());

        // A later switch recovers the feed.
        board.open(view("entrada")).await.unwrap();
        assert!(board.is_live());
    }
}
