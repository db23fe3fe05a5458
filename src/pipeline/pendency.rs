//! Derived outstanding actions per case.
//!
//! Pure: the same case, sessions, clock reading and settings always yield
//! the same list in the same order.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use trilha_common::{AttendanceStatus, Case, Session, SessionId, sort_newest_first};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PendencyKind {
    AttendanceNotRecorded {
        session_id: SessionId,
        scheduled_at: NaiveDateTime,
    },
    EvolutionNoteMissing {
        session_id: SessionId,
        scheduled_at: NaiveDateTime,
        attendance: AttendanceStatus,
    },
    MissingServiceAgreement {
        assignment_id: String,
        staff_name: String,
    },
    UpcomingBirthday {
        date: NaiveDate,
        days_until: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pendency {
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: PendencyKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendencySettings {
    pub lookback_days: i64,
    pub birthday_window_days: i64,
}

impl Default for PendencySettings {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            birthday_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendencyCounts {
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl PendencyCounts {
    pub fn of(pendencies: &[Pendency]) -> Self {
        let mut counts = Self::default();
        for p in pendencies {
            match p.severity {
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.error + self.warning + self.info
    }
}

/// Outstanding actions for `case`, ordered by severity. Within a severity,
/// session entries come first (newest session first), then assignment
/// entries in assignment order, then the birthday reminder.
pub fn compute_pendencies(
    case: &Case,
    sessions: &[Session],
    now: NaiveDateTime,
    settings: &PendencySettings,
) -> Vec<Pendency> {
    let mut out = Vec::new();

    let mut recent: Vec<Session> = sessions
        .iter()
        .filter(|s| s.case_id == case.id)
        .cloned()
        .collect();
    sort_newest_first(&mut recent);
    // `None` when the lookback reaches past the representable range.
    let window_start =
        Duration::try_days(settings.lookback_days).and_then(|back| now.checked_sub_signed(back));
    for session in &recent {
        let Some(start) = session.resolved_start() else {
            continue;
        };
        if start >= now || window_start.is_some_and(|floor| start < floor) {
            continue;
        }
        if session.attendance == AttendanceStatus::Scheduled {
            out.push(Pendency {
                severity: Severity::Error,
                message: format!(
                    "Attendance not recorded for the session on {}",
                    start.format("%d/%m/%Y %H:%M")
                ),
                kind: PendencyKind::AttendanceNotRecorded {
                    session_id: session.id.clone(),
                    scheduled_at: start,
                },
            });
        } else if !session.notes.has_clinical_evolution() {
            out.push(Pendency {
                severity: Severity::Warning,
                message: format!(
                    "Clinical evolution note missing for the session on {}",
                    start.format("%d/%m/%Y %H:%M")
                ),
                kind: PendencyKind::EvolutionNoteMissing {
                    session_id: session.id.clone(),
                    scheduled_at: start,
                    attendance: session.attendance,
                },
            });
        }
    }

    for assignment in case.active_assignments() {
        if assignment.service_agreement.is_none() {
            out.push(Pendency {
                severity: Severity::Error,
                message: format!(
                    "Service agreement not recorded for {}",
                    assignment.staff.display_name
                ),
                kind: PendencyKind::MissingServiceAgreement {
                    assignment_id: assignment.id.clone(),
                    staff_name: assignment.staff.display_name.clone(),
                },
            });
        }
    }

    if let Some(birth_date) = case.patient.birth_date {
        if let Some((date, days_until)) =
            next_birthday(birth_date, now.date(), settings.birthday_window_days)
        {
            out.push(Pendency {
                severity: Severity::Info,
                message: if days_until == 0 {
                    format!("{} has a birthday today", case.patient.first_name())
                } else {
                    format!(
                        "{} has a birthday in {} day(s)",
                        case.patient.first_name(),
                        days_until
                    )
                },
                kind: PendencyKind::UpcomingBirthday { date, days_until },
            });
        }
    }

    // Stable: keeps the generation order inside each severity.
    out.sort_by_key(|p| p.severity);
    out
}

/// Next occurrence of the birthday within `window_days` of `today`
/// (inclusive), checked in this calendar year and the next.
fn next_birthday(birth: NaiveDate, today: NaiveDate, window_days: i64) -> Option<(NaiveDate, i64)> {
    [today.year(), today.year() + 1]
        .into_iter()
        .filter_map(|year| birthday_in(birth, year))
        .map(|date| (date, (date - today).num_days()))
        .find(|(_, days)| (0..=window_days).contains(days))
}

/// The birthday in `year`; Feb 29 falls back to Feb 28 outside leap years.
fn birthday_in(birth: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, birth.month(), birth.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, birth.month(), birth.day() - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trilha_common::{
        Actor, AssignmentStatus, AuditStamp, CareTrack, NewCase, NewSession, PatientInfo,
        ServiceAgreement, TreatmentAssignment,
    };

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn now() -> NaiveDateTime {
        ymd(2025, 3, 20).and_hms_opt(10, 0, 0).unwrap()
    }

    fn case_born(birth: Option<NaiveDate>) -> Case {
        Case::open(
            NewCase {
                patient: PatientInfo {
                    name: "Maria Souza".into(),
                    birth_date: birth,
                    phone: None,
                },
                ..Default::default()
            },
            AuditStamp::new(Utc::now(), &Actor::new("u1", "Recepção")),
        )
    }

    fn session(case: &Case, id: &str, start: NaiveDateTime) -> Session {
        let mut s = Session::scheduled(NewSession {
            case_id: case.id.clone(),
            assignment_id: None,
            scheduled_at: start,
        });
        s.id = id.into();
        s
    }

    #[test]
    fn past_session_still_scheduled_is_one_error() {
        let case = case_born(None);
        let sessions = vec![session(&case, "s1", now() - Duration::days(10))];
        let pendencies = compute_pendencies(&case, &sessions, now(), &PendencySettings::default());
        assert_eq!(pendencies.len(), 1);
        assert_eq!(pendencies[0].severity, Severity::Error);
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::AttendanceNotRecorded { ref session_id, .. } if session_id == "s1"
        ));
    }

    #[test]
    fn recorded_session_without_evolution_is_a_warning() {
        let case = case_born(None);
        let mut s = session(&case, "s1", now() - Duration::days(2));
        s.attendance = AttendanceStatus::Attended;
        let pendencies = compute_pendencies(&case, &[s.clone()], now(), &PendencySettings::default());
        assert_eq!(pendencies.len(), 1);
        assert_eq!(pendencies[0].severity, Severity::Warning);

        s.notes.clinical_evolution = Some("Evolução registrada.".into());
        assert!(compute_pendencies(&case, &[s], now(), &PendencySettings::default()).is_empty());
    }

    #[test]
    fn sessions_outside_the_window_or_unresolvable_raise_nothing() {
        let case = case_born(None);
        let old = session(&case, "old", now() - Duration::days(31));
        let future = session(&case, "future", now() + Duration::hours(1));
        let mut broken = session(&case, "broken", now());
        broken.scheduled_at = None;
        broken.legacy_date = Some("??".into());
        let pendencies = compute_pendencies(
            &case,
            &[old, future, broken],
            now(),
            &PendencySettings::default(),
        );
        assert!(pendencies.is_empty());
    }

    #[test]
    fn recorded_sessions_outside_the_window_need_no_note() {
        let case = case_born(None);
        let mut attended = session(&case, "attended", now() - Duration::days(31));
        attended.attendance = AttendanceStatus::Attended;
        let mut absent = session(&case, "absent", now() - Duration::days(45));
        absent.attendance = AttendanceStatus::Absent;
        assert!(!attended.notes.has_clinical_evolution());
        let pendencies = compute_pendencies(
            &case,
            &[attended.clone(), absent],
            now(),
            &PendencySettings::default(),
        );
        assert!(pendencies.is_empty());

        attended.scheduled_at = Some(now() - Duration::days(29));
        let pendencies =
            compute_pendencies(&case, &[attended], now(), &PendencySettings::default());
        assert_eq!(pendencies.len(), 1);
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::EvolutionNoteMissing { .. }
        ));
    }

    #[test]
    fn huge_lookback_covers_all_past_sessions() {
        let case = case_born(Some(ymd(1990, 3, 21)));
        let ancient = session(&case, "ancient", now() - Duration::days(3650));
        let settings = PendencySettings {
            lookback_days: i64::MAX,
            birthday_window_days: i64::MAX,
        };
        let pendencies = compute_pendencies(&case, &[ancient], now(), &settings);
        assert_eq!(pendencies.len(), 2);
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::AttendanceNotRecorded { .. }
        ));
    }

    #[test]
    fn birthday_window_boundary() {
        let seven = case_born(Some(ymd(1990, 3, 27)));
        let pendencies = compute_pendencies(&seven, &[], now(), &PendencySettings::default());
        assert_eq!(pendencies.len(), 1);
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::UpcomingBirthday { days_until: 7, .. }
        ));

        let eight = case_born(Some(ymd(1990, 3, 28)));
        assert!(compute_pendencies(&eight, &[], now(), &PendencySettings::default()).is_empty());

        let today = case_born(Some(ymd(1990, 3, 20)));
        assert_eq!(
            compute_pendencies(&today, &[], now(), &PendencySettings::default())[0].severity,
            Severity::Info
        );
    }

    #[test]
    fn birthday_wraps_into_next_year() {
        let case = case_born(Some(ymd(1985, 1, 2)));
        let dec_28 = ymd(2025, 12, 28).and_hms_opt(9, 0, 0).unwrap();
        let pendencies = compute_pendencies(&case, &[], dec_28, &PendencySettings::default());
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::UpcomingBirthday { date, days_until: 5 } if date == ymd(2026, 1, 2)
        ));
    }

    #[test]
    fn leap_day_birthday_falls_back_to_feb_28() {
        let case = case_born(Some(ymd(2000, 2, 29)));
        let feb_25 = ymd(2025, 2, 25).and_hms_opt(9, 0, 0).unwrap();
        let pendencies = compute_pendencies(&case, &[], feb_25, &PendencySettings::default());
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::UpcomingBirthday { date, days_until: 3 } if date == ymd(2025, 2, 28)
        ));
    }

    #[test]
    fn active_assignment_without_agreement_is_an_error() {
        let mut case = case_born(None);
        let staff = Actor::new("s1", "Ana");
        case.assignments.push(TreatmentAssignment::new(
            staff.clone(),
            CareTrack::BriefTherapy,
            AssignmentStatus::Active,
            Utc::now(),
        ));
        let mut signed = TreatmentAssignment::new(
            Actor::new("s2", "Bruno"),
            CareTrack::CrisisCare,
            AssignmentStatus::Active,
            Utc::now(),
        );
        signed.service_agreement = Some(ServiceAgreement {
            recorded_at: Utc::now(),
            recorded_by: staff,
        });
        case.assignments.push(signed);

        let pendencies = compute_pendencies(&case, &[], now(), &PendencySettings::default());
        assert_eq!(pendencies.len(), 1);
        assert!(matches!(
            pendencies[0].kind,
            PendencyKind::MissingServiceAgreement { ref staff_name, .. } if staff_name == "Ana"
        ));
    }

    #[test]
    fn ordering_is_severity_then_newest_session() {
        let case = case_born(Some(ymd(1990, 3, 22)));
        let older = session(&case, "older", now() - Duration::days(9));
        let newer = session(&case, "newer", now() - Duration::days(2));
        let mut noted = session(&case, "noted", now() - Duration::days(1));
        noted.attendance = AttendanceStatus::Absent;

        let pendencies = compute_pendencies(
            &case,
            &[older, noted, newer],
            now(),
            &PendencySettings::default(),
        );
        let severities: Vec<_> = pendencies.iter().map(|p| p.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Error, Severity::Error, Severity::Warning, Severity::Info]
        );
        let first_ids: Vec<_> = pendencies[..2]
            .iter()
            .map(|p| match &p.kind {
                PendencyKind::AttendanceNotRecorded { session_id, .. } => session_id.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(first_ids, vec!["newer", "older"]);

        let counts = PendencyCounts::of(&pendencies);
        assert_eq!((counts.error, counts.warning, counts.info), (2, 1, 1));
        assert_eq!(counts.total(), 4);
    }
}
