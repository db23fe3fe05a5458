//! Field-scoped partial updates for [`Case`].
//!
//! A `CasePatch` names only the fields a write intends to change. Stores
//! apply it against the freshest persisted copy, so concurrent writers that
//! touch different fields never overwrite each other.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DomainError;
use crate::case::*;
use crate::stage::StageKey;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalNotesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demand_assessment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_note: Option<String>,
}

impl ClinicalNotesPatch {
    pub fn is_empty(&self) -> bool {
        self.demand_assessment.is_none()
            && self.goals.is_none()
            && self.diagnosis.is_none()
            && self.closing_note.is_none()
    }

    fn apply(&self, notes: &mut ClinicalNotes) {
        if let Some(v) = &self.demand_assessment {
            notes.demand_assessment = Some(v.clone());
        }
        if let Some(v) = &self.goals {
            notes.goals = Some(v.clone());
        }
        if let Some(v) = &self.diagnosis {
            notes.diagnosis = Some(v.clone());
        }
        if let Some(v) = &self.closing_note {
            notes.closing_note = Some(v.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "kebab-case")]
pub enum PendingChangeUpdate {
    Set(PendingScheduleChange),
    Clear,
}

/// Per-field changes to one existing assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AssignmentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_agreement: Option<ServiceAgreement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_schedule_change: Option<PendingChangeUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concluded_at: Option<DateTime<Utc>>,
}

impl AssignmentPatch {
    fn apply(&self, assignment: &mut TreatmentAssignment) {
        if let Some(status) = self.status {
            assignment.status = status;
        }
        if let Some(schedule) = &self.schedule {
            assignment.schedule = Some(schedule.clone());
        }
        if let Some(agreement) = &self.service_agreement {
            assignment.service_agreement = Some(agreement.clone());
        }
        match &self.pending_schedule_change {
            Some(PendingChangeUpdate::Set(change)) => {
                assignment.pending_schedule_change = Some(change.clone())
            }
            Some(PendingChangeUpdate::Clear) => assignment.pending_schedule_change = None,
            None => {}
        }
        if let Some(at) = self.concluded_at {
            assignment.concluded_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AssignmentChange {
    Add { assignment: TreatmentAssignment },
    Update { id: String, fields: AssignmentPatch },
}

/// Whole-record replacement per stage; records are written by one stage each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecordsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake: Option<IntakeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<TriageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crisis: Option<CrisisRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<PartnerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reassessment: Option<ReassessmentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing: Option<ClosingRecord>,
}

impl StageRecordsPatch {
    pub fn is_empty(&self) -> bool {
        self.intake.is_none()
            && self.triage.is_none()
            && self.crisis.is_none()
            && self.partner.is_none()
            && self.group.is_none()
            && self.reassessment.is_none()
            && self.closing.is_none()
    }

    fn apply(&self, records: &mut StageRecords) {
        if let Some(r) = &self.intake {
            records.intake = Some(r.clone());
        }
        if let Some(r) = &self.triage {
            records.triage = Some(r.clone());
        }
        if let Some(r) = &self.crisis {
            records.crisis = Some(r.clone());
        }
        if let Some(r) = &self.partner {
            records.partner = Some(r.clone());
        }
        if let Some(r) = &self.group {
            records.group = Some(r.clone());
        }
        if let Some(r) = &self.reassessment {
            records.reassessment = Some(r.clone());
        }
        if let Some(r) = &self.closing {
            records.closing = Some(r.clone());
        }
    }
}

/// Top-level case fields a patch may touch. Stores write exactly these
/// columns and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseField {
    Status,
    Availability,
    ContributionAmount,
    ClinicalNotes,
    Assignments,
    Records,
    AttachedFiles,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CasePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<BTreeSet<AvailabilityWindow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_amount: Option<f64>,
    #[serde(default)]
    pub clinical_notes: ClinicalNotesPatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<AssignmentChange>,
    #[serde(default)]
    pub records: StageRecordsPatch,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_files: Vec<AttachedFile>,
}

impl CasePatch {
    pub fn status(status: StageKey) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn touched_fields(&self) -> BTreeSet<CaseField> {
        let mut fields = BTreeSet::new();
        if self.status.is_some() {
            fields.insert(CaseField::Status);
        }
        if self.availability.is_some() {
            fields.insert(CaseField::Availability);
        }
        if self.contribution_amount.is_some() {
            fields.insert(CaseField::ContributionAmount);
        }
        if !self.clinical_notes.is_empty() {
            fields.insert(CaseField::ClinicalNotes);
        }
        if !self.assignments.is_empty() {
            fields.insert(CaseField::Assignments);
        }
        if !self.records.is_empty() {
            fields.insert(CaseField::Records);
        }
        if !self.append_files.is_empty() {
            fields.insert(CaseField::AttachedFiles);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }

    /// Apply the patch in place. On error the case is left unchanged.
    pub fn apply_to(&self, case: &mut Case, stamp: &AuditStamp) -> Result<(), DomainError> {
        let mut assignments = case.assignments.clone();
        for change in &self.assignments {
            match change {
                AssignmentChange::Add { assignment } => {
                    if assignments.iter().any(|a| a.id == assignment.id) {
                        return Err(DomainError::DuplicateAssignment(assignment.id.clone()));
                    }
                    assignments.push(assignment.clone());
                }
                AssignmentChange::Update { id, fields } => {
                    let target = assignments
                        .iter_mut()
                        .find(|a| &a.id == id)
                        .ok_or_else(|| DomainError::UnknownAssignment(id.clone()))?;
                    fields.apply(target);
                }
            }
        }
        check_single_active_per_staff(&assignments)?;

        if let Some(status) = self.status {
            case.status = status;
        }
        if let Some(availability) = &self.availability {
            case.availability = availability.clone();
        }
        if let Some(amount) = self.contribution_amount {
            case.contribution_amount = Some(amount);
        }
        self.clinical_notes.apply(&mut case.clinical_notes);
        case.assignments = assignments;
        self.records.apply(&mut case.records);
        case.attached_files.extend(self.append_files.iter().cloned());
        case.audit = stamp.clone();
        Ok(())
    }
}

fn check_single_active_per_staff(assignments: &[TreatmentAssignment]) -> Result<(), DomainError> {
    let mut seen = BTreeSet::new();
    for a in assignments
        .iter()
        .filter(|a| a.status == AssignmentStatus::Active)
    {
        if !seen.insert(a.staff.id.as_str()) {
            return Err(DomainError::SecondActiveAssignment {
                staff_id: a.staff.id.clone(),
            });
        }
    }
    Ok(())
}
