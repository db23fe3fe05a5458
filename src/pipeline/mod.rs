//! The case pipeline engine.
//!
//! | Module          | Role                                                  |
//! |-----------------|-------------------------------------------------------|
//! | `db`            | SQLite schema, migrations, row mapping                |
//! | `store`         | `CaseStore` and its live, status-filtered feed        |
//! | `ledger`        | `SessionLedger`, the per-case session sub-records     |
//! | `history`       | append-only transition log                            |
//! | `stages`        | one `StageModule` per status, behind a registry       |
//! | `transition`    | `TransitionCoordinator`, the only writer of status    |
//! | `board`         | `PipelineBoard`, a per-client column view             |
//! | `pendency`      | derived outstanding actions                           |
//! | `collaborators` | room occupancy, message composition, export           |
//! | `clock`         | wall-clock source, fixed in tests                     |

pub mod board;
pub mod clock;
pub mod collaborators;
pub mod db;
pub mod history;
pub mod ledger;
pub mod pendency;
pub mod stages;
pub mod store;
pub mod transition;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use board::{BoardView, PipelineBoard};
use clock::Clock;
use collaborators::{CaseExporter, JsonExporter, MessageComposer, RoomOccupancy};
use db::DbHandle;
use history::{CaseHistory, SqliteCaseHistory};
use ledger::{SessionLedger, SqliteSessionLedger};
use pendency::PendencySettings;
use stages::StageRegistry;
use store::{CaseStore, SqliteCaseStore};
use transition::TransitionCoordinator;

/// Engine tunables, read by stage modules and the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// How many sessions a submitted schedule generates up front.
    pub sessions_per_schedule: usize,
    /// Clinic wall-time offset from UTC. `None` means UTC.
    pub utc_offset_minutes: Option<i32>,
    pub pendency: PendencySettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sessions_per_schedule: 1,
            utc_offset_minutes: None,
            pendency: PendencySettings::default(),
        }
    }
}

/// Shared handles to every engine component. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn CaseStore>,
    pub ledger: Arc<dyn SessionLedger>,
    pub history: Arc<dyn CaseHistory>,
    pub registry: Arc<StageRegistry>,
    pub occupancy: Arc<dyn RoomOccupancy>,
    pub composer: Arc<dyn MessageComposer>,
    pub exporter: Arc<dyn CaseExporter>,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<PipelineSettings>,
}

impl Services {
    /// SQLite-backed components sharing one database handle.
    pub fn sqlite(
        db: DbHandle,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
        occupancy: Arc<dyn RoomOccupancy>,
        composer: Arc<dyn MessageComposer>,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            store: Arc::new(SqliteCaseStore::new(db.clone(), broadcast_capacity)),
            ledger: Arc::new(SqliteSessionLedger::new(
                db.clone(),
                clock.clone(),
                broadcast_capacity,
            )),
            history: Arc::new(SqliteCaseHistory::new(db)),
            registry: Arc::new(StageRegistry::standard()),
            occupancy,
            composer,
            exporter: Arc::new(JsonExporter),
            clock,
            settings: Arc::new(settings),
        }
    }

    pub fn coordinator(&self) -> TransitionCoordinator {
        TransitionCoordinator::new(self.clone())
    }

    /// A fresh board with no view open.
    pub fn board(&self) -> PipelineBoard {
        PipelineBoard::new(self.clone())
    }

    /// Resolve a configured or preset view by name.
    pub fn find_view<'v>(views: &'v [BoardView], name: &str) -> Option<&'v BoardView> {
        views.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use clock::FixedClock;
    use collaborators::{OccupancyMap, TemplateComposer};
    use std::collections::HashMap;

    pub fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    /// In-memory services with a clock fixed at `now`.
    pub fn services_at(now: NaiveDateTime) -> (Services, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::at_local(now));
        let mut templates = HashMap::new();
        templates.insert(
            "alta".to_string(),
            "Olá {first_name}, seu acompanhamento foi encerrado.".to_string(),
        );
        let services = Services::sqlite(
            DbHandle::in_memory().unwrap(),
            PipelineSettings::default(),
            clock.clone(),
            Arc::new(OccupancyMap::new()),
            Arc::new(TemplateComposer::new(templates)),
            64,
        );
        (services, clock)
    }
}
