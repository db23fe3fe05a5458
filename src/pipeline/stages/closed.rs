use trilha_common::{Case, ClosingKind, StageKey};

use super::*;

fn closing_fields(case: &Case, expected: ClosingKind) -> Vec<ViewField> {
    let Some(closing) = case.records.closing.as_ref().filter(|c| c.kind == expected) else {
        return Vec::new();
    };
    vec![
        ViewField::new("Motivo", closing.reason.clone()),
        ViewField::new("Encerrado em", closing.closed_at.format("%d/%m/%Y").to_string()),
        ViewField::new("Encerrado por", closing.closed_by.display_name.clone()),
    ]
}

pub struct Discharged;

impl StageModule for Discharged {
    fn key(&self) -> StageKey {
        StageKey::Discharged
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        closing_fields(case, ClosingKind::Discharged)
    }
}

pub struct DroppedOut;

impl StageModule for DroppedOut {
    fn key(&self) -> StageKey {
        StageKey::DroppedOut
    }

    fn fields(&self, case: &Case) -> Vec<ViewField> {
        closing_fields(case, ClosingKind::DroppedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use chrono::Utc;
    use trilha_common::ClosingRecord;

    #[test]
    fn closed_view_shows_the_closing_record() {
        let mut case = case_at(StageKey::DroppedOut);
        case.records.closing = Some(ClosingRecord {
            kind: ClosingKind::DroppedOut,
            reason: "Mudou de cidade".into(),
            closed_at: Utc::now(),
            closed_by: staff(),
        });
        let view = DroppedOut.render(&case);
        assert!(!view.commit_available);
        assert!(view
            .fields
            .iter()
            .any(|f| f.label == "Motivo" && f.value == "Mudou de cidade"));
    }
}
