//! External collaborators the engine consults but does not own.
//!
//! Each is a trait with a simple in-process implementation loaded from
//! configuration. Deployments backed by other systems provide their own impls.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use trilha_common::{Case, DayOfWeek, Modality, ScheduleInfo, Session};

/// Where a recurring slot takes place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomTrack {
    Room(String),
    Online,
}

impl RoomTrack {
    pub fn for_schedule(schedule: &ScheduleInfo) -> Self {
        match (schedule.modality, &schedule.room) {
            (Modality::InPerson, Some(room)) => Self::Room(room.clone()),
            _ => Self::Online,
        }
    }
}

/// Advisory lookup of already-taken recurring slots.
pub trait RoomOccupancy: Send + Sync {
    fn is_occupied(&self, weekday: DayOfWeek, time: NaiveTime, track: &RoomTrack) -> bool;
}

#[derive(Debug, Default)]
pub struct OccupancyMap {
    slots: HashSet<(DayOfWeek, NaiveTime, RoomTrack)>,
}

impl OccupancyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_occupied(&mut self, weekday: DayOfWeek, time: NaiveTime, track: RoomTrack) {
        self.slots.insert((weekday, time, track));
    }
}

impl RoomOccupancy for OccupancyMap {
    fn is_occupied(&self, weekday: DayOfWeek, time: NaiveTime, track: &RoomTrack) -> bool {
        self.slots.contains(&(weekday, time, track.clone()))
    }
}

/// Builds outbound patient messages from a template id.
pub trait MessageComposer: Send + Sync {
    /// `None` when the template is unknown.
    fn compose(&self, template_id: &str, case: &Case) -> Option<String>;
}

/// Substitutes `{patient}` and `{first_name}` in configured templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateComposer {
    templates: HashMap<String, String>,
}

impl TemplateComposer {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }
}

impl MessageComposer for TemplateComposer {
    fn compose(&self, template_id: &str, case: &Case) -> Option<String> {
        let template = self.templates.get(template_id)?;
        Some(
            template
                .replace("{patient}", &case.patient.name)
                .replace("{first_name}", case.patient.first_name()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportSection {
    Summary,
    Assignments,
    ClinicalNotes,
    Sessions,
    Files,
}

impl ExportSection {
    pub const ALL: [ExportSection; 5] = [
        Self::Summary,
        Self::Assignments,
        Self::ClinicalNotes,
        Self::Sessions,
        Self::Files,
    ];
}

impl std::str::FromStr for ExportSection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "assignments" => Ok(Self::Assignments),
            "clinical-notes" => Ok(Self::ClinicalNotes),
            "sessions" => Ok(Self::Sessions),
            "files" => Ok(Self::Files),
            _ => Err(format!("Invalid export section: {}", s)),
        }
    }
}

/// Renders a case record for download.
pub trait CaseExporter: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn export(&self, case: &Case, sessions: &[Session], sections: &[ExportSection])
    -> Result<Vec<u8>>;
}

pub struct JsonExporter;

impl CaseExporter for JsonExporter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn export(
        &self,
        case: &Case,
        sessions: &[Session],
        sections: &[ExportSection],
    ) -> Result<Vec<u8>> {
        let mut doc = serde_json::Map::new();
        for section in sections {
            let (key, value) = match section {
                ExportSection::Summary => (
                    "summary",
                    serde_json::json!({
                        "id": case.id,
                        "patient": case.patient,
                        "status": case.status,
                        "created_at": case.created_at,
                        "audit": case.audit,
                    }),
                ),
                ExportSection::Assignments => {
                    ("assignments", serde_json::to_value(&case.assignments)?)
                }
                ExportSection::ClinicalNotes => {
                    ("clinical_notes", serde_json::to_value(&case.clinical_notes)?)
                }
                ExportSection::Sessions => ("sessions", serde_json::to_value(sessions)?),
                ExportSection::Files => ("files", serde_json::to_value(&case.attached_files)?),
            };
            doc.insert(key.to_string(), value);
        }
        serde_json::to_vec_pretty(&doc).context("Failed to serialize case export")
    }
}
