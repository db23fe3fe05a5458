use trilha_common::{
    AssignmentStatus, CareTrack, Case, CasePatch, ClosingKind, CrisisOutcome, CrisisRecord,
    StageKey, StageRecordsPatch,
};

use super::*;

/// Triage sent the patient to the crisis-care (plantão) track.
pub struct ReferredToCrisisCare;

impl StageModule for ReferredToCrisisCare {
    fn key(&self) -> StageKey {
        StageKey::ReferredToCrisisCare
    }

    fn actions(&self) -> &'static [&'static str] {
        &["start-crisis-care"]
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::StartCrisisCare { staff } => require_unassigned(case, staff),
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for ReferredToCrisisCare {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        let StageInput::StartCrisisCare { staff } = input else {
            return Err(unsupported(self.key(), input));
        };
        let assignment = TreatmentAssignment::new(
            staff.clone(),
            CareTrack::CrisisCare,
            AssignmentStatus::Active,
            ctx.now,
        );
        Ok(StageOutcome::to(
            StageKey::InCrisisCare,
            CasePatch {
                assignments: vec![AssignmentChange::Add { assignment }],
                records: StageRecordsPatch {
                    crisis: Some(CrisisRecord {
                        staff: staff.clone(),
                        started_at: ctx.now,
                        outcome: None,
                        note: None,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        ))
    }
}

pub struct InCrisisCare;

impl InCrisisCare {
    fn crisis_assignment<'c>(
        case: &'c Case,
        staff_id: &str,
    ) -> Result<&'c TreatmentAssignment, ValidationError> {
        let assignment = require_open_assignment(case, staff_id)?;
        if assignment.track != CareTrack::CrisisCare {
            return Err(ValidationError::field(
                "staff_id",
                "The staff member's open assignment is not on the crisis-care track",
            ));
        }
        Ok(assignment)
    }
}

impl StageModule for InCrisisCare {
    fn key(&self) -> StageKey {
        StageKey::InCrisisCare
    }

    fn actions(&self) -> &'static [&'static str] {
        &[
            "conclude-crisis-care",
            "update-clinical-notes",
            "record-service-agreement",
        ]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        case.active_assignments()
            .filter(|a| a.track == CareTrack::CrisisCare)
            .map(|a| {
                let agreement = if a.service_agreement.is_some() {
                    "recorded"
                } else {
                    "missing"
                };
                ViewField::new(
                    format!("Plantonista {}", a.staff.display_name),
                    format!("service agreement {}", agreement),
                )
            })
            .collect()
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::ConcludeCrisisCare { staff_id, .. } => {
                Self::crisis_assignment(case, staff_id).map(|_| ())
            }
            StageInput::UpdateClinicalNotes { notes } => validate_notes_update(case, notes, ctx),
            StageInput::RecordServiceAgreement { staff_id } => {
                validate_service_agreement(case, staff_id)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for InCrisisCare {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::ConcludeCrisisCare {
                staff_id,
                next,
                note,
            } => {
                let assignment = Self::crisis_assignment(case, staff_id)?;
                let note = optional_text(note.as_deref());
                let mut record = case.records.crisis.clone().unwrap_or_else(|| CrisisRecord {
                    staff: assignment.staff.clone(),
                    started_at: assignment.assigned_at,
                    outcome: None,
                    note: None,
                });
                record.outcome = Some(*next);
                record.note = note.clone();

                let (status, destination) = match next {
                    CrisisOutcome::BriefTherapy => (
                        AssignmentStatus::ConcludedReferred,
                        StageKey::ReferredToBriefTherapy,
                    ),
                    CrisisOutcome::Reassessment => (
                        AssignmentStatus::ConcludedReferred,
                        StageKey::AwaitingReassessment,
                    ),
                    CrisisOutcome::Discharge => {
                        (AssignmentStatus::ConcludedDischarged, StageKey::Discharged)
                    }
                };

                let mut patch = CasePatch {
                    assignments: vec![update_assignment(
                        &assignment.id,
                        AssignmentPatch {
                            status: Some(status),
                            concluded_at: Some(ctx.now),
                            ..Default::default()
                        },
                    )],
                    records: StageRecordsPatch {
                        crisis: Some(record),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                if *next == CrisisOutcome::Discharge {
                    patch.records.closing = Some(closing_record(
                        ClosingKind::Discharged,
                        note.unwrap_or_else(|| "Alta após plantão".to_string()),
                        ctx,
                    ));
                }
                Ok(StageOutcome::to(destination, patch).with_effect(
                    StageEffect::PurgeFutureSessions {
                        assignment_id: assignment.id.clone(),
                    },
                ))
            }
            StageInput::UpdateClinicalNotes { notes } => Ok(notes_update(notes)),
            StageInput::RecordServiceAgreement { staff_id } => {
                service_agreement_update(case, staff_id, ctx)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }
}
