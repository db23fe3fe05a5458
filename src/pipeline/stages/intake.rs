use trilha_common::{
    Case, CasePatch, ClosingKind, IntakeRecord, StageKey, StageRecordsPatch, TriageOutcome,
    TriageRecord,
};

use super::*;

/// Registration documents are being checked.
pub struct IntakeDocuments;

impl StageModule for IntakeDocuments {
    fn key(&self) -> StageKey {
        StageKey::IntakeDocuments
    }

    fn actions(&self) -> &'static [&'static str] {
        &["confirm-documents", "reject-intake"]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        vec![ViewField::new(
            "Anexos",
            case.attached_files.len().to_string(),
        )]
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::ConfirmDocuments {
                availability,
                contribution_amount,
            } => {
                if availability.is_empty() {
                    return Err(ValidationError::field(
                        "availability",
                        "At least one availability window is required",
                    ));
                }
                if contribution_amount.is_some_and(|a| !a.is_finite() || a < 0.0) {
                    return Err(ValidationError::field(
                        "contribution_amount",
                        "Contribution must be a non-negative amount",
                    ));
                }
                Ok(())
            }
            StageInput::RejectIntake { reason } => {
                require_text("reason", Some(reason.as_str())).map(|_| ())
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for IntakeDocuments {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::ConfirmDocuments {
                availability,
                contribution_amount,
            } => Ok(StageOutcome::to(
                StageKey::AwaitingTriage,
                CasePatch {
                    availability: Some(availability.clone()),
                    contribution_amount: *contribution_amount,
                    records: StageRecordsPatch {
                        intake: Some(IntakeRecord {
                            confirmed_at: ctx.now,
                            confirmed_by: ctx.actor.clone(),
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )),
            StageInput::RejectIntake { reason } => Ok(StageOutcome::to(
                StageKey::DroppedOut,
                CasePatch {
                    records: StageRecordsPatch {
                        closing: Some(closing_record(
                            ClosingKind::DroppedOut,
                            require_text("reason", Some(reason.as_str()))?,
                            ctx,
                        )),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )),
            other => Err(unsupported(self.key(), other)),
        }
    }
}

/// Documents confirmed; a triage slot has to be booked.
pub struct AwaitingTriage;

impl StageModule for AwaitingTriage {
    fn key(&self) -> StageKey {
        StageKey::AwaitingTriage
    }

    fn actions(&self) -> &'static [&'static str] {
        &["schedule-triage"]
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        validate_triage_slot(self.key(), input, ctx)
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for AwaitingTriage {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::ScheduleTriage { at, triager } => Ok(StageOutcome::to(
                StageKey::TriageScheduled,
                triage_patch(TriageRecord {
                    scheduled_for: *at,
                    triager: triager.clone(),
                    outcome: None,
                    notes: None,
                    decided_at: None,
                }),
            )),
            other => Err(unsupported(self.key(), other)),
        }
    }
}

fn validate_triage_slot(
    key: StageKey,
    input: &StageInput,
    ctx: &StageContext<'_>,
) -> Result<(), ValidationError> {
    match input {
        StageInput::ScheduleTriage { at, triager } => {
            if *at < ctx.local_now {
                return Err(ValidationError::field(
                    "at",
                    "Triage cannot be scheduled in the past",
                ));
            }
            require_text("triager", Some(triager.id.as_str())).map(|_| ())
        }
        other => Err(unsupported(key, other)),
    }
}

fn triage_patch(record: TriageRecord) -> CasePatch {
    CasePatch {
        records: StageRecordsPatch {
            triage: Some(record),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Triage booked; its outcome routes the case.
pub struct TriageScheduled;

impl TriageScheduled {
    fn destination(outcome: TriageOutcome) -> StageKey {
        match outcome {
            TriageOutcome::CrisisCare => StageKey::ReferredToCrisisCare,
            TriageOutcome::BriefTherapy => StageKey::ReferredToBriefTherapy,
            TriageOutcome::Partner => StageKey::PartnerReferral,
            TriageOutcome::Group => StageKey::GroupReferral,
            TriageOutcome::NotEligible => StageKey::DroppedOut,
        }
    }
}

impl StageModule for TriageScheduled {
    fn key(&self) -> StageKey {
        StageKey::TriageScheduled
    }

    fn actions(&self) -> &'static [&'static str] {
        &["record-triage-outcome", "schedule-triage"]
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        match &case.records.triage {
            Some(triage) => vec![
                ViewField::new(
                    "Triagem agendada para",
                    triage.scheduled_for.format("%d/%m/%Y %H:%M").to_string(),
                ),
                ViewField::new("Triador", triage.triager.display_name.clone()),
            ],
            None => Vec::new(),
        }
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::RecordTriageOutcome {
                outcome: TriageOutcome::NotEligible,
                reason,
                ..
            } => require_text("reason", reason.as_deref()).map(|_| ()),
            StageInput::RecordTriageOutcome { .. } => Ok(()),
            other => validate_triage_slot(self.key(), other, ctx),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for TriageScheduled {
    fn save(
        &self,
        case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        match input {
            StageInput::RecordTriageOutcome {
                outcome,
                notes,
                reason,
            } => {
                // A case moved here by hand may lack the booking record.
                let mut record = case.records.triage.clone().unwrap_or_else(|| TriageRecord {
                    scheduled_for: ctx.local_now,
                    triager: ctx.actor.clone(),
                    outcome: None,
                    notes: None,
                    decided_at: None,
                });
                record.outcome = Some(*outcome);
                record.notes = optional_text(notes.as_deref());
                record.decided_at = Some(ctx.now);

                let mut patch = triage_patch(record);
                if *outcome == TriageOutcome::NotEligible {
                    patch.records.closing = Some(closing_record(
                        ClosingKind::DroppedOut,
                        require_text("reason", reason.as_deref())?,
                        ctx,
                    ));
                }
                Ok(StageOutcome::to(Self::destination(*outcome), patch))
            }
            StageInput::ScheduleTriage { at, triager } => {
                let mut record = case.records.triage.clone().unwrap_or_else(|| TriageRecord {
                    scheduled_for: *at,
                    triager: triager.clone(),
                    outcome: None,
                    notes: None,
                    decided_at: None,
                });
                record.scheduled_for = *at;
                record.triager = triager.clone();
                Ok(StageOutcome::stay(triage_patch(record)))
            }
            other => Err(unsupported(self.key(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use chrono::{Duration, NaiveDate};
    use trilha_common::{AvailabilityWindow, DayOfWeek, DayPeriod};

    #[test]
    fn confirm_documents_moves_to_awaiting_triage() {
        let h = Harness::new();
        let case = case_at(StageKey::IntakeDocuments);
        let outcome = h
            .run(
                &IntakeDocuments,
                &case,
                StageInput::ConfirmDocuments {
                    availability: [AvailabilityWindow {
                        period: DayPeriod::Morning,
                        weekday: DayOfWeek::Tuesday,
                    }]
                    .into(),
                    contribution_amount: Some(20.0),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, Some(StageKey::AwaitingTriage));
        assert_eq!(outcome.patch.contribution_amount, Some(20.0));
        assert!(outcome.patch.records.intake.is_some());
    }

    #[test]
    fn confirm_without_availability_is_rejected() {
        let h = Harness::new();
        let err = h
            .run(
                &IntakeDocuments,
                &case_at(StageKey::IntakeDocuments),
                StageInput::ConfirmDocuments {
                    availability: Default::default(),
                    contribution_amount: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("availability"));
    }

    #[test]
    fn rejection_requires_a_reason() {
        let h = Harness::new();
        let case = case_at(StageKey::IntakeDocuments);
        let err = h
            .run(
                &IntakeDocuments,
                &case,
                StageInput::RejectIntake { reason: "  ".into() },
            )
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("reason"));

        let outcome = h
            .run(
                &IntakeDocuments,
                &case,
                StageInput::RejectIntake {
                    reason: "Documentação incompleta".into(),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, Some(StageKey::DroppedOut));
        assert_eq!(
            outcome.patch.records.closing.unwrap().reason,
            "Documentação incompleta"
        );
    }

    #[test]
    fn triage_cannot_be_booked_in_the_past() {
        let h = Harness::new();
        let err = h
            .run(
                &AwaitingTriage,
                &case_at(StageKey::AwaitingTriage),
                StageInput::ScheduleTriage {
                    at: h.local_now - Duration::hours(1),
                    triager: staff(),
                },
            )
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("at"));
    }

    #[test]
    fn triage_outcome_routes_the_case() {
        let h = Harness::new();
        let mut case = case_at(StageKey::TriageScheduled);
        case.records.triage = Some(TriageRecord {
            scheduled_for: NaiveDate::from_ymd_opt(2025, 3, 2)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            triager: staff(),
            outcome: None,
            notes: None,
            decided_at: None,
        });
        for (outcome, next) in [
            (TriageOutcome::CrisisCare, StageKey::ReferredToCrisisCare),
            (TriageOutcome::BriefTherapy, StageKey::ReferredToBriefTherapy),
            (TriageOutcome::Partner, StageKey::PartnerReferral),
            (TriageOutcome::Group, StageKey::GroupReferral),
        ] {
            let result = h
                .run(
                    &TriageScheduled,
                    &case,
                    StageInput::RecordTriageOutcome {
                        outcome,
                        notes: Some("ok".into()),
                        reason: None,
                    },
                )
                .unwrap();
            assert_eq!(result.next_status, Some(next));
            let triage = result.patch.records.triage.unwrap();
            assert_eq!(triage.outcome, Some(outcome));
            assert_eq!(triage.triager, staff());
        }
    }

    #[test]
    fn not_eligible_needs_reason_and_closes() {
        let h = Harness::new();
        let case = case_at(StageKey::TriageScheduled);
        let missing = h.run(
            &TriageScheduled,
            &case,
            StageInput::RecordTriageOutcome {
                outcome: TriageOutcome::NotEligible,
                notes: None,
                reason: None,
            },
        );
        assert!(missing.is_err());

        let outcome = h
            .run(
                &TriageScheduled,
                &case,
                StageInput::RecordTriageOutcome {
                    outcome: TriageOutcome::NotEligible,
                    notes: None,
                    reason: Some("Fora do perfil".into()),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, Some(StageKey::DroppedOut));
        assert_eq!(outcome.patch.records.closing.unwrap().kind, ClosingKind::DroppedOut);
    }

    #[test]
    fn rebooking_triage_keeps_the_stage() {
        let h = Harness::new();
        let outcome = h
            .run(
                &TriageScheduled,
                &case_at(StageKey::TriageScheduled),
                StageInput::ScheduleTriage {
                    at: h.local_now + Duration::days(2),
                    triager: staff(),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, None);
        assert!(outcome.patch.status.is_none());
    }
}
