//! Per-status stage behavior.
//!
//! Each status has exactly one [`StageModule`] registered in a
//! [`StageRegistry`]. A module renders the stage's view of a case, validates
//! inputs, and (unless the stage is read-only) computes the field-scoped
//! [`StageOutcome`] of a save. Modules are pure: everything they need arrives
//! through [`StageContext`], and all writes are left to the transition
//! coordinator.
//!
//! | Module          | Statuses                                                   |
//! |-----------------|------------------------------------------------------------|
//! | `intake`        | intake-documents, awaiting-triage, triage-scheduled        |
//! | `crisis`        | referred-to-crisis-care, in-crisis-care                    |
//! | `brief_therapy` | referred-to-brief-therapy through in-brief-therapy         |
//! | `referral`      | partner and group referral, reassessment                   |
//! | `closed`        | discharged, dropped-out                                    |

pub mod brief_therapy;
pub mod closed;
pub mod crisis;
pub mod intake;
pub mod referral;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use trilha_common::{
    Actor, AssignmentChange, AssignmentPatch, AvailabilityWindow, Case, CasePatch,
    ClinicalNotesPatch, ClosingKind, ClosingRecord, CrisisOutcome, DayOfWeek, Frequency, Modality,
    ReassessmentOutcome, ScheduleInfo, ServiceAgreement, StageKey, StageRecords, TreatmentAssignment,
    TriageOutcome,
};

use super::PipelineSettings;
use super::collaborators::RoomOccupancy;
use crate::errors::{PipelineError, ValidationError};

/// Everything a stage module may consult. Passed explicitly; modules hold
/// no state of their own.
pub struct StageContext<'a> {
    pub actor: &'a Actor,
    pub now: DateTime<Utc>,
    /// Clinic wall time, the frame sessions and triage slots are kept in.
    pub local_now: NaiveDateTime,
    pub occupancy: &'a dyn RoomOccupancy,
    pub settings: &'a PipelineSettings,
}

/// A recurring schedule as submitted, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    #[serde(default)]
    pub weekday: Option<DayOfWeek>,
    #[serde(default)]
    pub time: Option<NaiveTime>,
    #[serde(default)]
    pub modality: Option<Modality>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
}

impl ScheduleDraft {
    pub fn validate(&self) -> Result<ScheduleInfo, ValidationError> {
        let weekday = self
            .weekday
            .ok_or_else(|| ValidationError::field("weekday", "Weekday is required"))?;
        let time = self
            .time
            .ok_or_else(|| ValidationError::field("time", "Time is required"))?;
        let modality = self
            .modality
            .ok_or_else(|| ValidationError::field("modality", "Modality is required"))?;
        let room = self
            .room
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from);
        if modality == Modality::InPerson && room.is_none() {
            return Err(ValidationError::field(
                "room",
                "In-person sessions need a room",
            ));
        }
        let start_date = self
            .start_date
            .ok_or_else(|| ValidationError::field("start_date", "Start date is required"))?;
        if DayOfWeek::from_chrono(start_date.weekday()) != weekday {
            return Err(ValidationError::field(
                "start_date",
                format!("Start date {} does not fall on the scheduled weekday", start_date),
            ));
        }
        Ok(ScheduleInfo {
            weekday,
            time,
            modality,
            room: if modality == Modality::InPerson { room } else { None },
            frequency: self.frequency.unwrap_or(Frequency::Weekly),
            start_date,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TreatmentOutcome {
    Discharged,
    ReferredToPartner,
    ReferredToGroup,
    Reassessment,
    Abandoned,
}

/// Typed input of a stage save, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StageInput {
    ConfirmDocuments {
        availability: BTreeSet<AvailabilityWindow>,
        #[serde(default)]
        contribution_amount: Option<f64>,
    },
    RejectIntake {
        reason: String,
    },
    ScheduleTriage {
        at: NaiveDateTime,
        triager: Actor,
    },
    RecordTriageOutcome {
        outcome: TriageOutcome,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    StartCrisisCare {
        staff: Actor,
    },
    ConcludeCrisisCare {
        staff_id: String,
        next: CrisisOutcome,
        #[serde(default)]
        note: Option<String>,
    },
    AssignStaff {
        staff: Actor,
    },
    SubmitSchedule {
        staff_id: String,
        schedule: ScheduleDraft,
    },
    MarkNeverStarted {
        staff_id: String,
        reason: String,
    },
    ConfirmStart {
        staff_id: String,
    },
    RecordServiceAgreement {
        staff_id: String,
    },
    UpdateClinicalNotes {
        notes: ClinicalNotesPatch,
    },
    ProposeScheduleChange {
        staff_id: String,
        schedule: ScheduleDraft,
    },
    ResolveScheduleChange {
        staff_id: String,
        approve: bool,
    },
    ConcludeTreatment {
        staff_id: String,
        outcome: TreatmentOutcome,
        #[serde(default)]
        closing_note: Option<String>,
    },
    SendToPartner {
        partner_name: String,
    },
    EnrollInGroup {
        group_name: String,
    },
    Reassess {
        outcome: ReassessmentOutcome,
        #[serde(default)]
        note: Option<String>,
    },
}

impl StageInput {
    pub fn action(&self) -> &'static str {
        match self {
            Self::ConfirmDocuments { .. } => "confirm-documents",
            Self::RejectIntake { .. } => "reject-intake",
            Self::ScheduleTriage { .. } => "schedule-triage",
            Self::RecordTriageOutcome { .. } => "record-triage-outcome",
            Self::StartCrisisCare { .. } => "start-crisis-care",
            Self::ConcludeCrisisCare { .. } => "conclude-crisis-care",
            Self::AssignStaff { .. } => "assign-staff",
            Self::SubmitSchedule { .. } => "submit-schedule",
            Self::MarkNeverStarted { .. } => "mark-never-started",
            Self::ConfirmStart { .. } => "confirm-start",
            Self::RecordServiceAgreement { .. } => "record-service-agreement",
            Self::UpdateClinicalNotes { .. } => "update-clinical-notes",
            Self::ProposeScheduleChange { .. } => "propose-schedule-change",
            Self::ResolveScheduleChange { .. } => "resolve-schedule-change",
            Self::ConcludeTreatment { .. } => "conclude-treatment",
            Self::SendToPartner { .. } => "send-to-partner",
            Self::EnrollInGroup { .. } => "enroll-in-group",
            Self::Reassess { .. } => "reassess",
        }
    }
}

/// Work the coordinator performs after the case write commits.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEffect {
    GenerateSessions {
        assignment_id: String,
        schedule: ScheduleInfo,
    },
    /// Delete the assignment's sessions at or after the current local time.
    PurgeFutureSessions { assignment_id: String },
}

/// Result of a stage save: the fields to write, the status the stage decided
/// on (`None` keeps the current one), and follow-up effects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub patch: CasePatch,
    pub next_status: Option<StageKey>,
    pub effects: Vec<StageEffect>,
}

impl StageOutcome {
    pub fn to(next: StageKey, patch: CasePatch) -> Self {
        Self {
            patch,
            next_status: Some(next),
            effects: Vec::new(),
        }
    }

    pub fn stay(patch: CasePatch) -> Self {
        Self {
            patch,
            next_status: None,
            effects: Vec::new(),
        }
    }

    pub fn with_effect(mut self, effect: StageEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewField {
    pub label: String,
    pub value: String,
}

impl ViewField {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// What a stage shows when a card is opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageView {
    pub status: StageKey,
    pub title: &'static str,
    pub fields: Vec<ViewField>,
    /// Read-only summaries written by earlier stages.
    pub prior_outcomes: Vec<ViewField>,
    pub actions: Vec<&'static str>,
    pub commit_available: bool,
}

pub trait StageModule: Send + Sync {
    fn key(&self) -> StageKey;

    /// Actions this stage accepts. Empty for read-only stages.
    fn actions(&self) -> &'static [&'static str] {
        &[]
    }

    fn fields(&self, _case: &Case) -> Vec<ViewField> {
        Vec::new()
    }

    fn render(&self, case: &Case) -> StageView {
        let mut fields = common_fields(case);
        fields.extend(self.fields(case));
        StageView {
            status: self.key(),
            title: self.key().label(),
            fields,
            prior_outcomes: prior_outcomes(&case.records),
            actions: self.actions().to_vec(),
            commit_available: self.saver().is_some(),
        }
    }

    fn validate(
        &self,
        _case: &Case,
        _input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        Ok(())
    }

    /// `None` for read-only stages.
    fn saver(&self) -> Option<&dyn StageSave> {
        None
    }
}

pub trait StageSave: Send + Sync {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError>;
}

/// Status → module lookup.
pub struct StageRegistry {
    modules: HashMap<StageKey, Arc<dyn StageModule>>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// One module for every stage key.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(intake::IntakeDocuments));
        registry.register(Arc::new(intake::AwaitingTriage));
        registry.register(Arc::new(intake::TriageScheduled));
        registry.register(Arc::new(crisis::ReferredToCrisisCare));
        registry.register(Arc::new(crisis::InCrisisCare));
        registry.register(Arc::new(brief_therapy::ReferredToBriefTherapy));
        registry.register(Arc::new(brief_therapy::AwaitingScheduleInfo));
        registry.register(Arc::new(brief_therapy::ScheduleSubmitted));
        registry.register(Arc::new(brief_therapy::InBriefTherapy));
        registry.register(Arc::new(referral::PartnerReferral));
        registry.register(Arc::new(referral::AwaitingPartnerResponse));
        registry.register(Arc::new(referral::GroupReferral));
        registry.register(Arc::new(referral::AwaitingReassessment));
        registry.register(Arc::new(closed::Discharged));
        registry.register(Arc::new(closed::DroppedOut));
        registry
    }

    /// Replaces any module already registered for the same key.
    pub fn register(&mut self, module: Arc<dyn StageModule>) {
        self.modules.insert(module.key(), module);
    }

    pub fn resolve(&self, status: StageKey) -> Result<&dyn StageModule, PipelineError> {
        match self.modules.get(&status) {
            Some(module) => Ok(module.as_ref()),
            None => {
                tracing::error!(status = %status, "No stage module registered");
                Err(PipelineError::RegistryMismatch {
                    status: status.to_string(),
                })
            }
        }
    }

    pub fn render(&self, case: &Case) -> Result<StageView, PipelineError> {
        Ok(self.resolve(case.status)?.render(case))
    }

    /// Stage keys without a registered module.
    pub fn missing(&self) -> Vec<StageKey> {
        StageKey::ALL
            .into_iter()
            .filter(|key| !self.modules.contains_key(key))
            .collect()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

pub(crate) fn unsupported(key: StageKey, input: &StageInput) -> ValidationError {
    ValidationError::field(
        "action",
        format!("Stage '{}' does not accept '{}'", key, input.action()),
    )
}

/// Trimmed, non-blank text.
pub(crate) fn require_text(field: &str, value: Option<&str>) -> Result<String, ValidationError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ValidationError::field(field, format!("{} must not be blank", field)))
}

pub(crate) fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

pub(crate) fn require_open_assignment<'c>(
    case: &'c Case,
    staff_id: &str,
) -> Result<&'c TreatmentAssignment, ValidationError> {
    case.open_assignment_for(staff_id).ok_or_else(|| {
        ValidationError::field(
            "staff_id",
            format!("Staff member {} has no open assignment on this case", staff_id),
        )
    })
}

pub(crate) fn require_unassigned(case: &Case, staff: &Actor) -> Result<(), ValidationError> {
    if case.open_assignment_for(&staff.id).is_some() {
        return Err(ValidationError::field(
            "staff",
            format!("{} already holds an open assignment on this case", staff.display_name),
        ));
    }
    Ok(())
}

/// Clinical notes belong to whoever is treating the patient.
pub(crate) fn require_notes_author(case: &Case, actor: &Actor) -> Result<(), ValidationError> {
    if case.open_assignment_for(&actor.id).is_none() {
        return Err(ValidationError::field(
            "notes",
            "Only a staff member with an open assignment may change clinical notes",
        ));
    }
    Ok(())
}

pub(crate) fn closing_record(
    kind: ClosingKind,
    reason: String,
    ctx: &StageContext<'_>,
) -> ClosingRecord {
    ClosingRecord {
        kind,
        reason,
        closed_at: ctx.now,
        closed_by: ctx.actor.clone(),
    }
}

pub(crate) fn update_assignment(id: &str, fields: AssignmentPatch) -> AssignmentChange {
    AssignmentChange::Update {
        id: id.to_string(),
        fields,
    }
}

/// The kebab-case token serde uses for a unit enum value.
pub(crate) fn token<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

pub(crate) fn describe_schedule(schedule: &ScheduleInfo) -> String {
    let place = match (&schedule.modality, &schedule.room) {
        (Modality::InPerson, Some(room)) => room.clone(),
        _ => "online".to_string(),
    };
    format!(
        "{} {} ({}, {}) from {}",
        token(&schedule.weekday),
        schedule.time.format("%H:%M"),
        place,
        token(&schedule.frequency),
        schedule.start_date.format("%d/%m/%Y")
    )
}

pub(crate) fn validate_notes_update(
    case: &Case,
    notes: &ClinicalNotesPatch,
    ctx: &StageContext<'_>,
) -> Result<(), ValidationError> {
    require_notes_author(case, ctx.actor)?;
    if notes.is_empty() {
        return Err(ValidationError::field("notes", "No clinical note fields given"));
    }
    Ok(())
}

pub(crate) fn notes_update(notes: &ClinicalNotesPatch) -> StageOutcome {
    StageOutcome::stay(CasePatch {
        clinical_notes: notes.clone(),
        ..Default::default()
    })
}

pub(crate) fn validate_service_agreement(case: &Case, staff_id: &str) -> Result<(), ValidationError> {
    let assignment = require_open_assignment(case, staff_id)?;
    if assignment.service_agreement.is_some() {
        return Err(ValidationError::field(
            "staff_id",
            "Service agreement already recorded for this assignment",
        ));
    }
    Ok(())
}

pub(crate) fn service_agreement_update(
    case: &Case,
    staff_id: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutcome, ValidationError> {
    let assignment = require_open_assignment(case, staff_id)?;
    Ok(StageOutcome::stay(CasePatch {
        assignments: vec![update_assignment(
            &assignment.id,
            AssignmentPatch {
                service_agreement: Some(ServiceAgreement {
                    recorded_at: ctx.now,
                    recorded_by: ctx.actor.clone(),
                }),
                ..Default::default()
            },
        )],
        ..Default::default()
    }))
}

fn common_fields(case: &Case) -> Vec<ViewField> {
    let mut fields = vec![ViewField::new("Paciente", case.patient.name.clone())];
    if let Some(phone) = &case.patient.phone {
        fields.push(ViewField::new("Telefone", phone.clone()));
    }
    if !case.availability.is_empty() {
        let windows: Vec<String> = case
            .availability
            .iter()
            .map(|w| format!("{} {}", token(&w.weekday), token(&w.period)))
            .collect();
        fields.push(ViewField::new("Disponibilidade", windows.join(", ")));
    }
    if let Some(amount) = case.contribution_amount {
        fields.push(ViewField::new("Contribuição", format!("{:.2}", amount)));
    }
    let staff = case.open_staff_names();
    if !staff.is_empty() {
        fields.push(ViewField::new("Profissionais", staff.join(", ")));
    }
    fields
}

fn prior_outcomes(records: &StageRecords) -> Vec<ViewField> {
    let mut out = Vec::new();
    if let Some(intake) = &records.intake {
        out.push(ViewField::new(
            "Documentos",
            format!(
                "confirmed by {} on {}",
                intake.confirmed_by.display_name,
                intake.confirmed_at.format("%d/%m/%Y")
            ),
        ));
    }
    if let Some(triage) = &records.triage {
        let outcome = triage
            .outcome
            .map(|o| token(&o))
            .unwrap_or_else(|| "pending".to_string());
        out.push(ViewField::new(
            "Triagem",
            format!(
                "{} with {}: {}",
                triage.scheduled_for.format("%d/%m/%Y %H:%M"),
                triage.triager.display_name,
                outcome
            ),
        ));
    }
    if let Some(crisis) = &records.crisis {
        let outcome = crisis
            .outcome
            .map(|o| token(&o))
            .unwrap_or_else(|| "ongoing".to_string());
        out.push(ViewField::new(
            "Plantão",
            format!("{} ({})", crisis.staff.display_name, outcome),
        ));
    }
    if let Some(partner) = &records.partner {
        out.push(ViewField::new("Parceiro", partner.partner_name.clone()));
    }
    if let Some(group) = &records.group {
        out.push(ViewField::new("Grupo", group.group_name.clone()));
    }
    if let Some(reassessment) = &records.reassessment {
        out.push(ViewField::new("Reavaliação", token(&reassessment.outcome)));
    }
    if let Some(closing) = &records.closing {
        out.push(ViewField::new(
            "Encerramento",
            format!("{}: {}", token(&closing.kind), closing.reason),
        ));
    }
    out
}
