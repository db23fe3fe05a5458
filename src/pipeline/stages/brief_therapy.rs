use trilha_common::{
    AssignmentStatus, CareTrack, Case, CasePatch, ClosingKind, PendingChangeUpdate,
    PendingScheduleChange, StageKey, StageRecordsPatch,
};

use super::*;
use crate::pipeline::collaborators::RoomTrack;

/// The open brief-therapy assignment of `staff_id`, optionally required to
/// be in `status`.
fn therapy_assignment<'c>(
    case: &'c Case,
    staff_id: &str,
    status: Option<AssignmentStatus>,
) -> Result<&'c TreatmentAssignment, ValidationError> {
    let assignment = require_open_assignment(case, staff_id)?;
    if assignment.track != CareTrack::BriefTherapy {
        return Err(ValidationError::field(
            "staff_id",
            "The staff member's open assignment is not on the brief-therapy track",
        ));
    }
    if let Some(expected) = status {
        if assignment.status != expected {
            return Err(ValidationError::field(
                "staff_id",
                format!(
                    "Assignment is {}, expected {}",
                    token(&assignment.status),
                    token(&expected)
                ),
            ));
        }
    }
    Ok(assignment)
}

fn assignment_fields(case: &Case) -> Vec<ViewField> {
    case.assignments
        .iter()
        .filter(|a| a.track == CareTrack::BriefTherapy && a.status.is_open())
        .flat_map(|a| {
            let mut fields = vec![ViewField::new(
                format!("Terapeuta {}", a.staff.display_name),
                token(&a.status),
            )];
            if let Some(schedule) = &a.schedule {
                fields.push(ViewField::new("Horário", describe_schedule(schedule)));
            }
            if let Some(pending) = &a.pending_schedule_change {
                fields.push(ViewField::new(
                    "Alteração pendente",
                    describe_schedule(&pending.schedule),
                ));
            }
            fields
        })
        .collect()
}

fn validate_never_started(case: &Case, staff_id: &str, reason: &str) -> Result<(), ValidationError> {
    therapy_assignment(case, staff_id, None)?;
    require_text("reason", Some(reason)).map(|_| ())
}

/// The patient never came: drop the assignment and its future sessions.
fn never_started(
    case: &Case,
    staff_id: &str,
    reason: &str,
    ctx: &StageContext<'_>,
) -> Result<StageOutcome, ValidationError> {
    let assignment = therapy_assignment(case, staff_id, None)?;
    let patch = CasePatch {
        assignments: vec![update_assignment(
            &assignment.id,
            AssignmentPatch {
                status: Some(AssignmentStatus::DroppedBeforeStart),
                concluded_at: Some(ctx.now),
                ..Default::default()
            },
        )],
        records: StageRecordsPatch {
            closing: Some(closing_record(
                ClosingKind::DroppedOut,
                require_text("reason", Some(reason))?,
                ctx,
            )),
            ..Default::default()
        },
        ..Default::default()
    };
    Ok(
        StageOutcome::to(StageKey::DroppedOut, patch).with_effect(
            StageEffect::PurgeFutureSessions {
                assignment_id: assignment.id.clone(),
            },
        ),
    )
}

/// Replace the recurring schedule and regenerate sessions from it.
fn reschedule(assignment_id: &str, schedule: ScheduleInfo) -> StageOutcome {
    StageOutcome::stay(CasePatch {
        assignments: vec![update_assignment(
            assignment_id,
            AssignmentPatch {
                schedule: Some(schedule.clone()),
                pending_schedule_change: Some(PendingChangeUpdate::Clear),
                ..Default::default()
            },
        )],
        ..Default::default()
    })
    .with_effect(StageEffect::PurgeFutureSessions {
        assignment_id: assignment_id.to_string(),
    })
    .with_effect(StageEffect::GenerateSessions {
        assignment_id: assignment_id.to_string(),
        schedule,
    })
}

pub struct ReferredToBriefTherapy;

impl StageModule for ReferredToBriefTherapy {
    fn key(&self) -> StageKey {
        StageKey::ReferredToBriefTherapy
    }

    fn actions(&self) -> &'static [&'static str] {
        &["assign-staff"]
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::AssignStaff { staff } => require_unassigned(case, staff),
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for ReferredToBriefTherapy {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        let StageInput::AssignStaff { staff } = input else {
            return Err(unsupported(self.key(), input));
        };
        let assignment = TreatmentAssignment::new(
            staff.clone(),
            CareTrack::BriefTherapy,
            AssignmentStatus::AwaitingSchedule,
            ctx.now,
        );
        Ok(StageOutcome::to(
            StageKey::AwaitingScheduleInfo,
            CasePatch {
                assignments: vec![AssignmentChange::Add { assignment }],
                ..Default::default()
            },
        ))
    }
}

/// A therapist was assigned and owes the recurring schedule.
pub struct AwaitingScheduleInfo;

impl StageModule for AwaitingScheduleInfo {
    fn key(&self) -> StageKey {
        StageKey::AwaitingScheduleInfo
    }

    fn actions(&self) -> &'static [&'static str] {
        &["submit-schedule", "mark-never-started"]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        assignment_fields(case)
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::SubmitSchedule { staff_id, schedule } => {
                therapy_assignment(case, staff_id, Some(AssignmentStatus::AwaitingSchedule))?;
                schedule.validate().map(|_| ())
            }
            StageInput::MarkNeverStarted { staff_id, reason } => {
                validate_never_started(case, staff_id, reason)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for AwaitingScheduleInfo {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::SubmitSchedule { staff_id, schedule } => {
                let assignment =
                    therapy_assignment(case, staff_id, Some(AssignmentStatus::AwaitingSchedule))?;
                let schedule = schedule.validate()?;
                let patch = CasePatch {
                    assignments: vec![update_assignment(
                        &assignment.id,
                        AssignmentPatch {
                            status: Some(AssignmentStatus::ScheduleSubmitted),
                            schedule: Some(schedule.clone()),
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                };
                Ok(StageOutcome::to(StageKey::ScheduleSubmitted, patch).with_effect(
                    StageEffect::GenerateSessions {
                        assignment_id: assignment.id.clone(),
                        schedule,
                    },
                ))
            }
            StageInput::MarkNeverStarted { staff_id, reason } => {
                never_started(case, staff_id, reason, ctx)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }
}

/// Schedule sent; waiting for the first session to confirm the start.
pub struct ScheduleSubmitted;

impl StageModule for ScheduleSubmitted {
    fn key(&self) -> StageKey {
        StageKey::ScheduleSubmitted
    }

    fn actions(&self) -> &'static [&'static str] {
        &["confirm-start", "mark-never-started"]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        assignment_fields(case)
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::ConfirmStart { staff_id } => {
                therapy_assignment(case, staff_id, Some(AssignmentStatus::ScheduleSubmitted))
                    .map(|_| ())
            }
            StageInput::MarkNeverStarted { staff_id, reason } => {
                validate_never_started(case, staff_id, reason)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for ScheduleSubmitted {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::ConfirmStart { staff_id } => {
                let assignment =
                    therapy_assignment(case, staff_id, Some(AssignmentStatus::ScheduleSubmitted))?;
                Ok(StageOutcome::to(
                    StageKey::InBriefTherapy,
                    CasePatch {
                        assignments: vec![update_assignment(
                            &assignment.id,
                            AssignmentPatch {
                                status: Some(AssignmentStatus::Active),
                                ..Default::default()
                            },
                        )],
                        ..Default::default()
                    },
                ))
            }
            StageInput::MarkNeverStarted { staff_id, reason } => {
                never_started(case, staff_id, reason, ctx)
            }
            other => Err(unsupported(self.key(), other)),
        }
    }
}

pub struct InBriefTherapy;

impl InBriefTherapy {
    fn active(case: &Case, staff_id: &str) -> Result<String, ValidationError> {
        therapy_assignment(case, staff_id, Some(AssignmentStatus::Active)).map(|a| a.id.clone())
    }
}

impl StageModule for InBriefTherapy {
    fn key(&self) -> StageKey {
        StageKey::InBriefTherapy
    }

    fn actions(&self) -> &'static [&'static str] {
        &[
            "record-service-agreement",
            "update-clinical-notes",
            "propose-schedule-change",
            "resolve-schedule-change",
            "conclude-treatment",
        ]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        assignment_fields(case)
    }

    fn validate(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::RecordServiceAgreement { staff_id } => {
                validate_service_agreement(case, staff_id)
            }
            StageInput::UpdateClinicalNotes { notes } => validate_notes_update(case, notes, ctx),
            StageInput::ProposeScheduleChange { staff_id, schedule } => {
                Self::active(case, staff_id)?;
                let schedule = schedule.validate()?;
                if schedule.start_date < ctx.local_now.date() {
                    return Err(ValidationError::field(
                        "start_date",
                        "A new schedule cannot start in the past",
                    ));
                }
                Ok(())
            }
            StageInput::ResolveScheduleChange { staff_id, .. } => {
                let assignment = require_open_assignment(case, staff_id)?;
                if assignment.pending_schedule_change.is_none() {
                    return Err(ValidationError::field(
                        "staff_id",
                        "No schedule change is waiting for approval",
                    ));
                }
                Ok(())
            }
            StageInput::ConcludeTreatment {
                staff_id,
                closing_note,
                ..
            } => {
                Self::active(case, staff_id)?;
                if optional_text(closing_note.as_deref()).is_some() {
                    require_notes_author(case, ctx.actor)?;
                }
                Ok(())
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for InBriefTherapy {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::RecordServiceAgreement { staff_id } => {
                service_agreement_update(case, staff_id, ctx)
            }
            StageInput::UpdateClinicalNotes { notes } => Ok(notes_update(notes)),
            StageInput::ProposeScheduleChange { staff_id, schedule } => {
                let assignment_id = Self::active(case, staff_id)?;
                let schedule = schedule.validate()?;
                let occupied = ctx.occupancy.is_occupied(
                    schedule.weekday,
                    schedule.time,
                    &RoomTrack::for_schedule(&schedule),
                );
                if !occupied {
                    return Ok(reschedule(&assignment_id, schedule));
                }
                // Occupied slots are parked for an admin, never rejected.
                Ok(StageOutcome::stay(CasePatch {
                    assignments: vec![update_assignment(
                        &assignment_id,
                        AssignmentPatch {
                            pending_schedule_change: Some(PendingChangeUpdate::Set(
                                PendingScheduleChange {
                                    schedule,
                                    proposed_at: ctx.now,
                                    proposed_by: ctx.actor.clone(),
                                    slot_flagged_occupied: true,
                                },
                            )),
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                }))
            }
            StageInput::ResolveScheduleChange { staff_id, approve } => {
                let assignment = require_open_assignment(case, staff_id)?;
                let pending = assignment.pending_schedule_change.clone().ok_or_else(|| {
                    ValidationError::field("staff_id", "No schedule change is waiting for approval")
                })?;
                if *approve {
                    return Ok(reschedule(&assignment.id, pending.schedule));
                }
                Ok(StageOutcome::stay(CasePatch {
                    assignments: vec![update_assignment(
                        &assignment.id,
                        AssignmentPatch {
                            pending_schedule_change: Some(PendingChangeUpdate::Clear),
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                }))
            }
            StageInput::ConcludeTreatment {
                staff_id,
                outcome,
                closing_note,
            } => {
                let assignment_id = Self::active(case, staff_id)?;
                let closing_note = optional_text(closing_note.as_deref());
                let (status, destination, closing) = match outcome {
                    TreatmentOutcome::Discharged => (
                        AssignmentStatus::ConcludedDischarged,
                        StageKey::Discharged,
                        Some(ClosingKind::Discharged),
                    ),
                    TreatmentOutcome::ReferredToPartner => (
                        AssignmentStatus::ConcludedReferred,
                        StageKey::PartnerReferral,
                        None,
                    ),
                    TreatmentOutcome::ReferredToGroup => (
                        AssignmentStatus::ConcludedReferred,
                        StageKey::GroupReferral,
                        None,
                    ),
                    TreatmentOutcome::Reassessment => (
                        AssignmentStatus::ConcludedReferred,
                        StageKey::AwaitingReassessment,
                        None,
                    ),
                    TreatmentOutcome::Abandoned => (
                        AssignmentStatus::ConcludedAbandoned,
                        StageKey::DroppedOut,
                        Some(ClosingKind::DroppedOut),
                    ),
                };
                let mut patch = CasePatch {
                    assignments: vec![update_assignment(
                        &assignment_id,
                        AssignmentPatch {
                            status: Some(status),
                            concluded_at: Some(ctx.now),
                            ..Default::default()
                        },
                    )],
                    ..Default::default()
                };
                patch.clinical_notes.closing_note = closing_note.clone();
                if let Some(kind) = closing {
                    let reason = closing_note.unwrap_or_else(|| match kind {
                        ClosingKind::Discharged => "Alta da psicoterapia breve".to_string(),
                        ClosingKind::DroppedOut => "Abandono do tratamento".to_string(),
                    });
                    patch.records.closing = Some(closing_record(kind, reason, ctx));
                }
                Ok(StageOutcome::to(destination, patch)
                    .with_effect(StageEffect::PurgeFutureSessions { assignment_id }))
            }
            other => Err(unsupported(self.key(), other)),
        }
    }
}
