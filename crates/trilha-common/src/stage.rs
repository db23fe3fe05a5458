use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DomainError;

/// Position of a case in the care pipeline.
///
/// The set is closed: a persisted value outside it is a data-integrity
/// problem and is never treated as a new stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKey {
    IntakeDocuments,
    AwaitingTriage,
    TriageScheduled,
    ReferredToCrisisCare,
    InCrisisCare,
    ReferredToBriefTherapy,
    AwaitingScheduleInfo,
    ScheduleSubmitted,
    InBriefTherapy,
    PartnerReferral,
    AwaitingPartnerResponse,
    GroupReferral,
    AwaitingReassessment,
    Discharged,
    DroppedOut,
}

impl StageKey {
    pub const ALL: [StageKey; 15] = [
        Self::IntakeDocuments,
        Self::AwaitingTriage,
        Self::TriageScheduled,
        Self::ReferredToCrisisCare,
        Self::InCrisisCare,
        Self::ReferredToBriefTherapy,
        Self::AwaitingScheduleInfo,
        Self::ScheduleSubmitted,
        Self::InBriefTherapy,
        Self::PartnerReferral,
        Self::AwaitingPartnerResponse,
        Self::GroupReferral,
        Self::AwaitingReassessment,
        Self::Discharged,
        Self::DroppedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntakeDocuments => "intake-documents",
            Self::AwaitingTriage => "awaiting-triage",
            Self::TriageScheduled => "triage-scheduled",
            Self::ReferredToCrisisCare => "referred-to-crisis-care",
            Self::InCrisisCare => "in-crisis-care",
            Self::ReferredToBriefTherapy => "referred-to-brief-therapy",
            Self::AwaitingScheduleInfo => "awaiting-schedule-info",
            Self::ScheduleSubmitted => "schedule-submitted",
            Self::InBriefTherapy => "in-brief-therapy",
            Self::PartnerReferral => "partner-referral",
            Self::AwaitingPartnerResponse => "awaiting-partner-response",
            Self::GroupReferral => "group-referral",
            Self::AwaitingReassessment => "awaiting-reassessment",
            Self::Discharged => "discharged",
            Self::DroppedOut => "dropped-out",
        }
    }

    /// Column heading shown on the board.
    pub fn label(&self) -> &'static str {
        match self {
            Self::IntakeDocuments => "Documentos de inscrição",
            Self::AwaitingTriage => "Aguardando triagem",
            Self::TriageScheduled => "Triagem agendada",
            Self::ReferredToCrisisCare => "Encaminhado ao plantão",
            Self::InCrisisCare => "Em plantão",
            Self::ReferredToBriefTherapy => "Encaminhado à psicoterapia breve",
            Self::AwaitingScheduleInfo => "Aguardando horário",
            Self::ScheduleSubmitted => "Horário enviado",
            Self::InBriefTherapy => "Em psicoterapia breve",
            Self::PartnerReferral => "Encaminhamento a parceiro",
            Self::AwaitingPartnerResponse => "Aguardando parceiro",
            Self::GroupReferral => "Encaminhamento a grupo",
            Self::AwaitingReassessment => "Aguardando reavaliação",
            Self::Discharged => "Alta",
            Self::DroppedOut => "Desistência",
        }
    }

    /// Discharge and drop-out end a case; it is never deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Discharged | Self::DroppedOut)
    }
}

impl std::fmt::Display for StageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_round_trips_through_its_string_form() {
        for key in StageKey::ALL {
            assert_eq!(StageKey::from_str(key.as_str()).unwrap(), key);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = StageKey::from_str("waiting-for-godot").unwrap_err();
        assert!(matches!(err, DomainError::UnknownStatus(ref s) if s == "waiting-for-godot"));
    }

    #[test]
    fn serde_uses_kebab_case_keys() {
        let json = serde_json::to_string(&StageKey::AwaitingScheduleInfo).unwrap();
        assert_eq!(json, "\"awaiting-schedule-info\"");
        let parsed: Result<StageKey, _> = serde_json::from_str("\"in-limbo\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn only_discharge_and_drop_out_are_terminal() {
        let terminal: Vec<_> = StageKey::ALL.iter().filter(|k| k.is_terminal()).collect();
        assert_eq!(terminal, vec![&StageKey::Discharged, &StageKey::DroppedOut]);
    }
}
