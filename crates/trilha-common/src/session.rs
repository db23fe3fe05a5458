use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::case::{Actor, AuditStamp, CaseId};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Scheduled,
    Attended,
    Absent,
    CancelledByPatient,
    CancelledByProfessional,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Attended => "attended",
            Self::Absent => "absent",
            Self::CancelledByPatient => "cancelled-by-patient",
            Self::CancelledByProfessional => "cancelled-by-professional",
        }
    }
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "attended" => Ok(Self::Attended),
            "absent" => Ok(Self::Absent),
            "cancelled-by-patient" => Ok(Self::CancelledByPatient),
            "cancelled-by-professional" => Ok(Self::CancelledByProfessional),
            _ => Err(format!("Invalid attendance status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionNotes {
    #[serde(default)]
    pub clinical_evolution: Option<String>,
    #[serde(default)]
    pub shared_with_staff: Option<String>,
    #[serde(default)]
    pub shared_with_admin: Option<String>,
}

impl SessionNotes {
    pub fn has_clinical_evolution(&self) -> bool {
        self.clinical_evolution
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionNotesPatch {
    #[serde(default)]
    pub clinical_evolution: Option<String>,
    #[serde(default)]
    pub shared_with_staff: Option<String>,
    #[serde(default)]
    pub shared_with_admin: Option<String>,
}

impl SessionNotesPatch {
    pub fn is_empty(&self) -> bool {
        self.clinical_evolution.is_none()
            && self.shared_with_staff.is_none()
            && self.shared_with_admin.is_none()
    }

    pub fn apply(&self, notes: &mut SessionNotes) {
        if let Some(v) = &self.clinical_evolution {
            notes.clinical_evolution = Some(v.clone());
        }
        if let Some(v) = &self.shared_with_staff {
            notes.shared_with_staff = Some(v.clone());
        }
        if let Some(v) = &self.shared_with_admin {
            notes.shared_with_admin = Some(v.clone());
        }
    }
}

/// One scheduled or occurred appointment of a case.
///
/// Older records carry the start as separate `legacy_date` / `legacy_hour`
/// strings instead of `scheduled_at`; see [`Session::resolved_start`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub case_id: CaseId,
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub legacy_date: Option<String>,
    #[serde(default)]
    pub legacy_hour: Option<String>,
    pub attendance: AttendanceStatus,
    #[serde(default)]
    pub notes: SessionNotes,
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_changed_by: Option<Actor>,
    #[serde(default)]
    pub notes_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes_updated_by: Option<Actor>,
    /// Who put the session on the books; absent on imported records.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Actor>,
}

/// Input for adding a session, either generated from a schedule or ad hoc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub case_id: CaseId,
    #[serde(default)]
    pub assignment_id: Option<String>,
    pub scheduled_at: NaiveDateTime,
}

impl Session {
    /// A scheduled session stamped with its creator.
    pub fn scheduled_by(new_session: NewSession, stamp: &AuditStamp) -> Self {
        Self {
            created_at: Some(stamp.last_updated_at),
            created_by: Some(stamp.last_updated_by.clone()),
            ..Self::scheduled(new_session)
        }
    }

    pub fn scheduled(new_session: NewSession) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            case_id: new_session.case_id,
            assignment_id: new_session.assignment_id,
            scheduled_at: Some(new_session.scheduled_at),
            legacy_date: None,
            legacy_hour: None,
            attendance: AttendanceStatus::Scheduled,
            notes: SessionNotes::default(),
            status_changed_at: None,
            status_changed_by: None,
            notes_updated_at: None,
            notes_updated_by: None,
            created_at: None,
            created_by: None,
        }
    }

    /// Start of the session: the structured timestamp when present, otherwise
    /// the legacy date combined with the legacy hour. `None` when neither
    /// can be parsed.
    pub fn resolved_start(&self) -> Option<NaiveDateTime> {
        self.scheduled_at.or_else(|| {
            parse_legacy_start(self.legacy_date.as_deref()?, self.legacy_hour.as_deref())
        })
    }
}

const LEGACY_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];
const LEGACY_HOUR_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];

/// Combine a legacy date string with an optional hour string.
///
/// Hours also accept the `14h` / `14h30` spelling. A missing hour means
/// midnight; a present but unparseable hour makes the whole start unknown.
pub fn parse_legacy_start(date: &str, hour: Option<&str>) -> Option<NaiveDateTime> {
    let date = date.trim();
    let date = LEGACY_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())?;
    let time = match hour.map(str::trim).filter(|h| !h.is_empty()) {
        None => NaiveTime::from_hms_opt(0, 0, 0)?,
        Some(h) => parse_legacy_hour(h)?,
    };
    Some(date.and_time(time))
}

fn parse_legacy_hour(hour: &str) -> Option<NaiveTime> {
    if let Some(t) = LEGACY_HOUR_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(hour, fmt).ok())
    {
        return Some(t);
    }
    let (h, m) = hour.split_once(['h', 'H'])?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = if m.is_empty() { 0 } else { m.parse().ok()? };
    NaiveTime::from_hms_opt(h, m, 0)
}

/// Newest first; sessions without a resolvable start sort as the oldest.
/// Equal starts fall back to id order so the result is deterministic.
pub fn sort_newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        match (a.resolved_start(), b.resolved_start()) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn legacy(id: &str, date: Option<&str>, hour: Option<&str>) -> Session {
        Session {
            id: id.into(),
            case_id: "c1".into(),
            assignment_id: None,
            scheduled_at: None,
            legacy_date: date.map(String::from),
            legacy_hour: hour.map(String::from),
            attendance: AttendanceStatus::Scheduled,
            notes: SessionNotes::default(),
            status_changed_at: None,
            status_changed_by: None,
            notes_updated_at: None,
            notes_updated_by: None,
            created_at: None,
            created_by: None,
        }
    }

    #[test]
    fn legacy_formats_parse() {
        assert_eq!(
            parse_legacy_start("2024-05-10", Some("09:30")),
            Some(at(2024, 5, 10, 9, 30))
        );
        assert_eq!(
            parse_legacy_start("10/05/2024", Some("14h")),
            Some(at(2024, 5, 10, 14, 0))
        );
        assert_eq!(
            parse_legacy_start("10/05/2024", Some("14h15")),
            Some(at(2024, 5, 10, 14, 15))
        );
        assert_eq!(
            parse_legacy_start("2024-05-10", None),
            Some(at(2024, 5, 10, 0, 0))
        );
        assert_eq!(parse_legacy_start("ontem", Some("10:00")), None);
        assert_eq!(parse_legacy_start("2024-05-10", Some("meio-dia")), None);
    }

    #[test]
    fn structured_then_legacy_then_unparseable() {
        let mut a = legacy("a", None, None);
        a.scheduled_at = Some(at(2025, 3, 10, 14, 0));
        let b = legacy("b", Some("03/03/2025"), Some("14:00"));
        let c = legacy("c", Some("??"), Some("xx"));

        let mut sessions = vec![c.clone(), b.clone(), a.clone()];
        sort_newest_first(&mut sessions);
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_break_by_id() {
        let mut x = legacy("x", Some("2025-01-01"), Some("10:00"));
        let mut w = legacy("w", None, None);
        w.scheduled_at = Some(at(2025, 1, 1, 10, 0));
        x.attendance = AttendanceStatus::Attended;
        let mut sessions = vec![x, w];
        sort_newest_first(&mut sessions);
        assert_eq!(sessions[0].id, "w");
    }

    #[test]
    fn clinical_evolution_must_be_non_blank() {
        let mut notes = SessionNotes::default();
        assert!(!notes.has_clinical_evolution());
        notes.clinical_evolution = Some("   ".into());
        assert!(!notes.has_clinical_evolution());
        notes.clinical_evolution = Some("Paciente relatou melhora.".into());
        assert!(notes.has_clinical_evolution());
    }
}
