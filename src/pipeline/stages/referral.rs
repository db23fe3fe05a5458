use trilha_common::{
    Case, CasePatch, ClosingKind, GroupRecord, PartnerRecord, ReassessmentOutcome,
    ReassessmentRecord, StageKey, StageRecordsPatch,
};

use super::*;

/// Treatment ended with a referral to an outside partner service.
pub struct PartnerReferral;

impl StageModule for PartnerReferral {
    fn key(&self) -> StageKey {
        StageKey::PartnerReferral
    }

    fn actions(&self) -> &'static [&'static str] {
        &["send-to-partner"]
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::SendToPartner { partner_name } => {
                require_text("partner_name", Some(partner_name.as_str())).map(|_| ())
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for PartnerReferral {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        let StageInput::SendToPartner { partner_name } = input else {
            return Err(unsupported(self.key(), input));
        };
        let partner_name = require_text("partner_name", Some(partner_name.as_str()))?;
        Ok(StageOutcome::to(
            StageKey::AwaitingPartnerResponse,
            CasePatch {
                records: StageRecordsPatch {
                    partner: Some(PartnerRecord {
                        partner_name,
                        sent_at: ctx.now,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        ))
    }
}

/// Waiting on the partner service. Nothing to save here.
pub struct AwaitingPartnerResponse;

impl StageModule for AwaitingPartnerResponse {
    fn key(&self) -> StageKey {
        StageKey::AwaitingPartnerResponse
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        case.records
            .partner
            .iter()
            .map(|p| ViewField::new("Enviado em", p.sent_at.format("%d/%m/%Y").to_string()))
            .collect()
    }
}

pub struct GroupReferral;

impl StageModule for GroupReferral {
    fn key(&self) -> StageKey {
        StageKey::GroupReferral
    }

    fn actions(&self) -> &'static [&'static str] {
        &["enroll-in-group"]
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::EnrollInGroup { group_name } => {
                require_text("group_name", Some(group_name.as_str())).map(|_| ())
            }
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for GroupReferral {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        let StageInput::EnrollInGroup { group_name } = input else {
            return Err(unsupported(self.key(), input));
        };
        let group_name = require_text("group_name", Some(group_name.as_str()))?;
        let reason = format!("Encaminhado ao grupo {}", group_name);
        Ok(StageOutcome::to(
            StageKey::Discharged,
            CasePatch {
                records: StageRecordsPatch {
                    group: Some(GroupRecord {
                        group_name,
                        enrolled_at: ctx.now,
                    }),
                    closing: Some(closing_record(ClosingKind::Discharged, reason, ctx)),
                    ..Default::default()
                },
                ..Default::default()
            },
        ))
    }
}

/// A treatment ended with a reassessment request; decide the next track.
pub struct AwaitingReassessment;

impl StageModule for AwaitingReassessment {
    fn key(&self) -> StageKey {
        StageKey::AwaitingReassessment
    }

    fn actions(&self) -> &'static [&'static str] {
        &["reassess"]
    }

    fn validate(
        &self,
        _case: &Case,
        input: &StageInput,
        _ctx: &StageContext<'_>,
    ) -> Result<(), ValidationError> {
        match input {
            StageInput::Reassess { .. } => Ok(()),
            other => Err(unsupported(self.key(), other)),
        }
    }

    fn saver(&self) -> Option<&dyn StageSave> {
        Some(self)
    }
}

impl StageSave for AwaitingReassessment {
    fn save(
        &self,
        _case: &Case,
        input: &StageInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutcome, ValidationError> {
        let StageInput::Reassess { outcome, note } = input else {
            return Err(unsupported(self.key(), input));
        };
        let note = optional_text(note.as_deref());
        let mut records = StageRecordsPatch {
            reassessment: Some(ReassessmentRecord {
                outcome: *outcome,
                note: note.clone(),
                decided_at: ctx.now,
            }),
            ..Default::default()
        };
        let destination = match outcome {
            ReassessmentOutcome::BriefTherapy => StageKey::ReferredToBriefTherapy,
            ReassessmentOutcome::CrisisCare => StageKey::ReferredToCrisisCare,
            ReassessmentOutcome::Discharge => {
                records.closing = Some(closing_record(
                    ClosingKind::Discharged,
                    note.unwrap_or_else(|| "Alta após reavaliação".to_string()),
                    ctx,
                ));
                StageKey::Discharged
            }
        };
        Ok(StageOutcome::to(
            destination,
            CasePatch {
                records,
                ..Default::default()
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn partner_referral_waits_for_response() {
        let h = Harness::new();
        let outcome = h
            .run(
                &PartnerReferral,
                &case_at(StageKey::PartnerReferral),
                StageInput::SendToPartner {
                    partner_name: " CAPS Centro ".into(),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, Some(StageKey::AwaitingPartnerResponse));
        assert_eq!(
            outcome.patch.records.partner.unwrap().partner_name,
            "CAPS Centro"
        );
    }

    #[test]
    fn blank_partner_is_rejected() {
        let h = Harness::new();
        let err = h
            .run(
                &PartnerReferral,
                &case_at(StageKey::PartnerReferral),
                StageInput::SendToPartner {
                    partner_name: "   ".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("partner_name"));
    }

    #[test]
    fn group_enrollment_closes_the_case() {
        let h = Harness::new();
        let outcome = h
            .run(
                &GroupReferral,
                &case_at(StageKey::GroupReferral),
                StageInput::EnrollInGroup {
                    group_name: "Ansiedade".into(),
                },
            )
            .unwrap();
        assert_eq!(outcome.next_status, Some(StageKey::Discharged));
        let closing = outcome.patch.records.closing.unwrap();
        assert_eq!(closing.kind, ClosingKind::Discharged);
        assert!(closing.reason.contains("Ansiedade"));
    }

    #[test]
    fn reassessment_picks_the_next_track() {
        let h = Harness::new();
        let case = case_at(StageKey::AwaitingReassessment);
        for (outcome, next) in [
            (ReassessmentOutcome::BriefTherapy, StageKey::ReferredToBriefTherapy),
            (ReassessmentOutcome::CrisisCare, StageKey::ReferredToCrisisCare),
            (ReassessmentOutcome::Discharge, StageKey::Discharged),
        ] {
            let result = h
                .run(
                    &AwaitingReassessment,
                    &case,
                    StageInput::Reassess {
                        outcome,
                        note: None,
                    },
                )
                .unwrap();
            assert_eq!(result.next_status, Some(next));
            assert_eq!(
                result.patch.records.closing.is_some(),
                next == StageKey::Discharged
            );
        }
    }

    #[test]
    fn partner_response_stage_is_read_only() {
        assert!(AwaitingPartnerResponse.saver().is_none());
    }
}
