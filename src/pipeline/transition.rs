//! Status changes and the other audited case writes.
//!
//! [`TransitionCoordinator::transition`] is the rule-driven path: the current
//! stage module validates the input and computes a field-scoped patch, the
//! patch is written in one store update, then follow-up effects run (session
//! generation, future-session purge, history). Everything after the case
//! write reports `changed_state() == true` on failure.

use std::collections::BTreeSet;

use serde::Serialize;
use trilha_common::{
    Actor, AttachedFile, AuditStamp, Case, CaseField, CasePatch, NewCase, NewSession, Session,
    StageKey,
};

use super::Services;
use super::history::{HistoryKind, NewHistoryEntry};
use super::stages::{StageContext, StageEffect, StageInput};
use crate::errors::{PipelineError, ValidationError};

/// What a rule-driven transition did.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub case: Case,
    pub from_status: StageKey,
    /// Top-level case fields the write touched.
    pub fields: BTreeSet<CaseField>,
    pub sessions_created: Vec<Session>,
    pub sessions_purged: usize,
}

#[derive(Debug, Default)]
struct EffectReport {
    created: Vec<Session>,
    purged: usize,
}

pub struct TransitionCoordinator {
    services: Services,
}

impl TransitionCoordinator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn transition(
        &self,
        case_id: &str,
        target: StageKey,
        input: StageInput,
        actor: &Actor,
    ) -> Result<TransitionOutcome, PipelineError> {
        let s = &self.services;
        let case = s.store.get(case_id).await?;
        let module = s.registry.resolve(case.status)?;
        let Some(saver) = module.saver() else {
            tracing::error!(
                case_id = %case.id,
                status = %case.status,
                action = input.action(),
                "Transition requested on a read-only stage"
            );
            return Err(PipelineError::SaveUnavailable {
                status: case.status,
            });
        };
        if !module.actions().contains(&input.action()) {
            return Err(ValidationError::field(
                "action",
                format!(
                    "Stage '{}' offers {:?}, not '{}'",
                    case.status,
                    module.actions(),
                    input.action()
                ),
            )
            .into());
        }

        let ctx = StageContext {
            actor,
            now: s.clock.now(),
            local_now: s.clock.local_now(),
            occupancy: s.occupancy.as_ref(),
            settings: &s.settings,
        };
        module.validate(&case, &input, &ctx)?;
        let outcome = saver.save(&case, &input, &ctx)?;

        let decided = outcome.next_status.unwrap_or(case.status);
        if decided != target {
            return Err(ValidationError::field(
                "target",
                format!(
                    "'{}' from '{}' leads to '{}', not '{}'",
                    input.action(),
                    case.status,
                    decided,
                    target
                ),
            )
            .into());
        }

        let mut patch = outcome.patch;
        patch.status = (decided != case.status).then_some(decided);
        let fields = patch.touched_fields();
        let stamp = AuditStamp::new(ctx.now, actor);
        let updated = s.store.update(&case.id, patch, stamp).await?;
        tracing::info!(
            case_id = %case.id,
            from = %case.status,
            to = %updated.status,
            action = input.action(),
            actor = %actor.id,
            "Case transitioned"
        );

        let effects = self.run_effects(&updated, &outcome.effects, actor).await;
        let history = s
            .history
            .append(NewHistoryEntry {
                case_id: updated.id.clone(),
                kind: HistoryKind::RuleTransition,
                from_status: Some(case.status),
                to_status: Some(updated.status),
                actor: actor.clone(),
                detail: Some(input.action().to_string()),
                at: ctx.now,
            })
            .await;

        let report = effects.map_err(|e| self.side_effect_failed(&updated.id, e))?;
        history.map_err(|e| self.side_effect_failed(&updated.id, e))?;

        Ok(TransitionOutcome {
            case: updated,
            from_status: case.status,
            fields,
            sessions_created: report.created,
            sessions_purged: report.purged,
        })
    }

    async fn run_effects(
        &self,
        case: &Case,
        effects: &[StageEffect],
        actor: &Actor,
    ) -> Result<EffectReport, PipelineError> {
        let s = &self.services;
        let mut report = EffectReport::default();
        for effect in effects {
            match effect {
                StageEffect::PurgeFutureSessions { assignment_id } => {
                    let purged = s
                        .ledger
                        .delete_future_from(&case.id, assignment_id, s.clock.local_now())
                        .await?;
                    tracing::debug!(case_id = %case.id, assignment_id = %assignment_id, purged, "Purged future sessions");
                    report.purged += purged;
                }
                StageEffect::GenerateSessions {
                    assignment_id,
                    schedule,
                } => {
                    let sessions = schedule
                        .occurrences(s.settings.sessions_per_schedule)
                        .into_iter()
                        .map(|scheduled_at| NewSession {
                            case_id: case.id.clone(),
                            assignment_id: Some(assignment_id.clone()),
                            scheduled_at,
                        })
                        .collect();
                    let created = s.ledger.add_many(sessions, actor).await?;
                    tracing::debug!(case_id = %case.id, assignment_id = %assignment_id, created = created.len(), "Generated sessions");
                    report.created.extend(created);
                }
            }
        }
        Ok(report)
    }

    fn side_effect_failed(&self, case_id: &str, err: PipelineError) -> PipelineError {
        tracing::error!(case_id, error = %err, "Follow-up step failed after case write");
        PipelineError::SideEffectFailed {
            case_id: case_id.to_string(),
            source: anyhow::Error::new(err),
        }
    }

    /// Operator override: writes only the status, bypassing stage rules.
    pub async fn move_manually(
        &self,
        case_id: &str,
        target: StageKey,
        reason: &str,
        actor: &Actor,
    ) -> Result<Case, PipelineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::field("reason", "A manual move needs a reason").into());
        }
        let s = &self.services;
        let case = s.store.get(case_id).await?;
        if case.status == target {
            return Err(ValidationError::field(
                "target",
                format!("Case is already in '{}'", target),
            )
            .into());
        }
        let now = s.clock.now();
        let updated = s
            .store
            .update(&case.id, CasePatch::status(target), AuditStamp::new(now, actor))
            .await?;
        tracing::warn!(
            target: "trilha::manual_move",
            case_id = %case.id,
            from = %case.status,
            to = %target,
            actor = %actor.id,
            reason,
            "Case moved manually"
        );
        s.history
            .append(NewHistoryEntry {
                case_id: case.id.clone(),
                kind: HistoryKind::ManualMove,
                from_status: Some(case.status),
                to_status: Some(target),
                actor: actor.clone(),
                detail: Some(reason.to_string()),
                at: now,
            })
            .await
            .map_err(|e| self.side_effect_failed(&case.id, e))?;
        Ok(updated)
    }

    /// Compose the closing message for a finished case and log that it went out.
    pub async fn record_final_communication(
        &self,
        case_id: &str,
        template_id: &str,
        actor: &Actor,
    ) -> Result<String, PipelineError> {
        let s = &self.services;
        let case = s.store.get(case_id).await?;
        if !case.status.is_terminal() {
            return Err(ValidationError::field(
                "status",
                format!("Final communication requires a closed case, not '{}'", case.status),
            )
            .into());
        }
        let message = s.composer.compose(template_id, &case).ok_or_else(|| {
            ValidationError::field("template_id", format!("Unknown template '{}'", template_id))
        })?;
        s.history
            .append(NewHistoryEntry {
                case_id: case.id.clone(),
                kind: HistoryKind::FinalCommunication,
                from_status: Some(case.status),
                to_status: Some(case.status),
                actor: actor.clone(),
                detail: Some(template_id.to_string()),
                at: s.clock.now(),
            })
            .await?;
        tracing::info!(case_id = %case.id, template_id, "Final communication recorded");
        Ok(message)
    }

    pub async fn attach_file(
        &self,
        case_id: &str,
        name: &str,
        url: &str,
        actor: &Actor,
    ) -> Result<Case, PipelineError> {
        let name = name.trim();
        let url = url.trim();
        if name.is_empty() || url.is_empty() {
            return Err(ValidationError::field("file", "File name and url are required").into());
        }
        let s = &self.services;
        let now = s.clock.now();
        let patch = CasePatch {
            append_files: vec![AttachedFile {
                name: name.to_string(),
                url: url.to_string(),
                uploaded_at: now,
            }],
            ..Default::default()
        };
        let updated = s
            .store
            .update(case_id, patch, AuditStamp::new(now, actor))
            .await?;
        s.history
            .append(NewHistoryEntry {
                case_id: updated.id.clone(),
                kind: HistoryKind::FileAttached,
                from_status: None,
                to_status: None,
                actor: actor.clone(),
                detail: Some(name.to_string()),
                at: now,
            })
            .await
            .map_err(|e| self.side_effect_failed(&updated.id, e))?;
        Ok(updated)
    }

    /// New cases always start in intake-documents.
    pub async fn open_case(&self, new_case: NewCase, actor: &Actor) -> Result<Case, PipelineError> {
        if new_case.patient.name.trim().is_empty() {
            return Err(ValidationError::field("patient.name", "Patient name is required").into());
        }
        let s = &self.services;
        let now = s.clock.now();
        let case = s.store.create(new_case, AuditStamp::new(now, actor)).await?;
        tracing::info!(case_id = %case.id, actor = %actor.id, "Case opened");
        s.history
            .append(NewHistoryEntry {
                case_id: case.id.clone(),
                kind: HistoryKind::CaseOpened,
                from_status: None,
                to_status: Some(case.status),
                actor: actor.clone(),
                detail: None,
                at: now,
            })
            .await
            .map_err(|e| self.side_effect_failed(&case.id, e))?;
        Ok(case)
    }
}
