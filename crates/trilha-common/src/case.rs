use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageKey;

pub type CaseId = String;

/// Opaque reference to whoever performed a mutation. The engine never
/// authenticates it, only stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub display_name: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Audit metadata written with every case mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub last_updated_at: DateTime<Utc>,
    pub last_updated_by: Actor,
}

impl AuditStamp {
    pub fn new(at: DateTime<Utc>, by: &Actor) -> Self {
        Self {
            last_updated_at: at,
            last_updated_by: by.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl PatientInfo {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn to_chrono(self) -> chrono::Weekday {
        match self {
            Self::Monday => chrono::Weekday::Mon,
            Self::Tuesday => chrono::Weekday::Tue,
            Self::Wednesday => chrono::Weekday::Wed,
            Self::Thursday => chrono::Weekday::Thu,
            Self::Friday => chrono::Weekday::Fri,
            Self::Saturday => chrono::Weekday::Sat,
            Self::Sunday => chrono::Weekday::Sun,
        }
    }

    pub fn from_chrono(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Self::Monday,
            chrono::Weekday::Tue => Self::Tuesday,
            chrono::Weekday::Wed => Self::Wednesday,
            chrono::Weekday::Thu => Self::Thursday,
            chrono::Weekday::Fri => Self::Friday,
            chrono::Weekday::Sat => Self::Saturday,
            chrono::Weekday::Sun => Self::Sunday,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DayPeriod {
    Morning,
    Afternoon,
    Evening,
}

/// One (period, weekday) token of patient availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub period: DayPeriod,
    pub weekday: DayOfWeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    Online,
    InPerson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    /// Gap between consecutive occurrences. Monthly keeps the weekday by
    /// stepping four weeks.
    pub fn step(self) -> Duration {
        match self {
            Self::Weekly => Duration::weeks(1),
            Self::Biweekly => Duration::weeks(2),
            Self::Monthly => Duration::weeks(4),
        }
    }
}

/// A complete recurring schedule for one treatment assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub weekday: DayOfWeek,
    pub time: NaiveTime,
    pub modality: Modality,
    #[serde(default)]
    pub room: Option<String>,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
}

impl ScheduleInfo {
    /// The first `count` occurrences starting at `start_date`.
    pub fn occurrences(&self, count: usize) -> Vec<NaiveDateTime> {
        let first = self.start_date.and_time(self.time);
        (0..count)
            .map(|i| first + self.frequency.step() * i as i32)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CareTrack {
    CrisisCare,
    BriefTherapy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStatus {
    AwaitingSchedule,
    ScheduleSubmitted,
    Active,
    ConcludedDischarged,
    ConcludedReferred,
    ConcludedAbandoned,
    DroppedBeforeStart,
}

impl AssignmentStatus {
    /// Still part of the patient's ongoing care.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::AwaitingSchedule | Self::ScheduleSubmitted | Self::Active
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAgreement {
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: Actor,
}

/// A proposed new recurring time parked for admin approval because the
/// occupancy lookup flagged the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingScheduleChange {
    pub schedule: ScheduleInfo,
    pub proposed_at: DateTime<Utc>,
    pub proposed_by: Actor,
    pub slot_flagged_occupied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentAssignment {
    pub id: String,
    pub staff: Actor,
    pub track: CareTrack,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub schedule: Option<ScheduleInfo>,
    #[serde(default)]
    pub service_agreement: Option<ServiceAgreement>,
    #[serde(default)]
    pub pending_schedule_change: Option<PendingScheduleChange>,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub concluded_at: Option<DateTime<Utc>>,
}

impl TreatmentAssignment {
    pub fn new(staff: Actor, track: CareTrack, status: AssignmentStatus, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            staff,
            track,
            status,
            schedule: None,
            service_agreement: None,
            pending_schedule_change: None,
            assigned_at: at,
            concluded_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalNotes {
    #[serde(default)]
    pub demand_assessment: Option<String>,
    #[serde(default)]
    pub goals: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub closing_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub name: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

// ── Stage outcome records ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub confirmed_at: DateTime<Utc>,
    pub confirmed_by: Actor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriageOutcome {
    CrisisCare,
    BriefTherapy,
    Partner,
    Group,
    NotEligible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageRecord {
    pub scheduled_for: NaiveDateTime,
    pub triager: Actor,
    #[serde(default)]
    pub outcome: Option<TriageOutcome>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrisisOutcome {
    BriefTherapy,
    Reassessment,
    Discharge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisRecord {
    pub staff: Actor,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome: Option<CrisisOutcome>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerRecord {
    pub partner_name: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_name: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReassessmentOutcome {
    BriefTherapy,
    CrisisCare,
    Discharge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReassessmentRecord {
    pub outcome: ReassessmentOutcome,
    #[serde(default)]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClosingKind {
    Discharged,
    DroppedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingRecord {
    pub kind: ClosingKind,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
    pub closed_by: Actor,
}

/// Outcomes written by earlier stages, shown read-only by later ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecords {
    #[serde(default)]
    pub intake: Option<IntakeRecord>,
    #[serde(default)]
    pub triage: Option<TriageRecord>,
    #[serde(default)]
    pub crisis: Option<CrisisRecord>,
    #[serde(default)]
    pub partner: Option<PartnerRecord>,
    #[serde(default)]
    pub group: Option<GroupRecord>,
    #[serde(default)]
    pub reassessment: Option<ReassessmentRecord>,
    #[serde(default)]
    pub closing: Option<ClosingRecord>,
}

// ── Aggregate root ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub status: StageKey,
    pub patient: PatientInfo,
    #[serde(default)]
    pub assignments: Vec<TreatmentAssignment>,
    #[serde(default)]
    pub availability: BTreeSet<AvailabilityWindow>,
    #[serde(default)]
    pub contribution_amount: Option<f64>,
    #[serde(default)]
    pub clinical_notes: ClinicalNotes,
    #[serde(default)]
    pub attached_files: Vec<AttachedFile>,
    #[serde(default)]
    pub records: StageRecords,
    pub audit: AuditStamp,
    pub created_at: DateTime<Utc>,
}

/// Input for opening a new case at intake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewCase {
    pub patient: PatientInfo,
    #[serde(default)]
    pub availability: BTreeSet<AvailabilityWindow>,
    #[serde(default)]
    pub contribution_amount: Option<f64>,
}

impl Case {
    pub fn open(new_case: NewCase, stamp: AuditStamp) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: StageKey::IntakeDocuments,
            patient: new_case.patient,
            assignments: Vec::new(),
            availability: new_case.availability,
            contribution_amount: new_case.contribution_amount,
            clinical_notes: ClinicalNotes::default(),
            attached_files: Vec::new(),
            records: StageRecords::default(),
            created_at: stamp.last_updated_at,
            audit: stamp,
        }
    }

    pub fn assignment(&self, id: &str) -> Option<&TreatmentAssignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    /// The open assignment held by `staff_id`, if any.
    pub fn open_assignment_for(&self, staff_id: &str) -> Option<&TreatmentAssignment> {
        self.assignments
            .iter()
            .find(|a| a.staff.id == staff_id && a.status.is_open())
    }

    pub fn active_assignments(&self) -> impl Iterator<Item = &TreatmentAssignment> {
        self.assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Active)
    }

    /// Display names of every staff member with an open assignment.
    pub fn open_staff_names(&self) -> Vec<String> {
        self.assignments
            .iter()
            .filter(|a| a.status.is_open())
            .map(|a| a.staff.display_name.clone())
            .collect()
    }
}
