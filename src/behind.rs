use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::milestones::{MilestoneCatalog, MilestoneResolver};
use crate::models::{
    AttemptOutcome, ExamAttempt, ExamKind, MilestoneKey, Registration, StudentId, StudentRecords,
};
use crate::scan::SkippedStudent;
use crate::selector::order_by_pace;

/// Bucket for students who have not opened any course.
pub const NOT_STARTED: i64 = -2;
/// Bucket for students held at the licensing gate.
pub const GATE_NOT_MET: i64 = -1;

/// Calendar days past the earliest configured deadline the student has not met.
///
/// Walks the pace in order: reviews 1 to 4, then the final, of each course.
/// Only configured dates count; nothing here is interpolated.
pub fn days_behind(
    ordered: &[&Registration],
    exams: &[ExamAttempt],
    resolver: &MilestoneResolver<'_>,
    today: NaiveDate,
) -> i64 {
    let pace = ordered.len() as u8;
    let passed = |course: &str, kind: ExamKind, unit: u8| {
        exams.iter().any(|e| {
            e.course == course
                && e.kind == kind
                && e.unit == Some(unit)
                && e.outcome == AttemptOutcome::Passed
        })
    };

    let pending = (1u8..).zip(ordered.iter()).find_map(|(slot, registration)| {
        let course = registration.course.as_str();
        (1..=4u8)
            .find(|unit| !passed(course, ExamKind::Review, *unit))
            .map(|unit| MilestoneKey::review(pace, slot, unit))
            .or_else(|| {
                (!passed(course, ExamKind::Final, 5)).then(|| MilestoneKey::final_exam(pace, slot))
            })
    });

    pending
        .and_then(|key| resolver.resolve_date(key))
        .map_or(0, |due| (today - due).num_days().max(0))
}

/// Days-behind bucket for one student: a sentinel or a day count.
pub fn student_days_behind(
    student: &StudentRecords,
    catalog: &MilestoneCatalog,
    today: NaiveDate,
) -> Result<i64, EngineError> {
    let ordered = order_by_pace(&student.student_id, &student.registrations)?;
    if !ordered.iter().any(|r| r.open_status.is_started()) {
        return Ok(NOT_STARTED);
    }
    if !student.licensed {
        return Ok(GATE_NOT_MET);
    }

    let track = student
        .track
        .as_deref()
        .ok_or_else(|| EngineError::MissingTrack(student.student_id.clone()))?;
    let milestones = catalog.for_pace(ordered.len() as u8, track)?;
    let resolver =
        MilestoneResolver::new(milestones, &student.overrides, track, &student.student_id);
    Ok(days_behind(&ordered, &student.exams, &resolver, today))
}

#[derive(Debug, Clone, Serialize)]
pub struct DaysBehindReport {
    pub today: NaiveDate,
    pub buckets: BTreeMap<i64, Vec<StudentId>>,
    pub skipped: Vec<SkippedStudent>,
}

impl DaysBehindReport {
    pub fn build(
        students: &[StudentRecords],
        catalog: &MilestoneCatalog,
        today: NaiveDate,
    ) -> Self {
        let mut buckets: BTreeMap<i64, Vec<StudentId>> = BTreeMap::new();
        let mut skipped = Vec::new();

        for student in students {
            match student_days_behind(student, catalog, today) {
                Ok(days) => buckets.entry(days).or_default().push(student.student_id.clone()),
                Err(err) => {
                    warn!(student_id = %student.student_id, "skipping days-behind: {err}");
                    skipped.push(SkippedStudent::new(&student.student_id, &err));
                }
            }
        }

        for (days, ids) in &buckets {
            info!(days_behind = days, students = ids.len(), "days-behind bucket");
        }
        Self {
            today,
            buckets,
            skipped,
        }
    }

    /// Students in a sentinel bucket or at least `days` late.
    pub fn students_n_days_late(&self, days: i64) -> Vec<&str> {
        self.buckets
            .iter()
            .filter(|(key, _)| **key < 0 || **key >= days)
            .flat_map(|(_, ids)| ids.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Milestone, OpenStatus};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn registration(course: &str, order: u8, open: OpenStatus) -> Registration {
        Registration {
            course: course.to_string(),
            section: "001".to_string(),
            pace_order: Some(order),
            open_status: open,
            completed: false,
        }
    }

    fn passed(course: &str, kind: ExamKind, unit: u8) -> ExamAttempt {
        ExamAttempt {
            course: course.to_string(),
            unit: Some(unit),
            kind,
            outcome: AttemptOutcome::Passed,
            score: Some(10),
            date: date(2026, 2, 1),
        }
    }

    fn catalog() -> MilestoneCatalog {
        let mut milestones = Vec::new();
        for slot in 1..=2u8 {
            let offset = u32::from(slot - 1) * 28;
            for unit in 1..=4u8 {
                milestones.push(Milestone {
                    key: MilestoneKey::review(2, slot, unit),
                    track: "A".to_string(),
                    date: date(2026, 2, 2)
                        + chrono::Duration::days(i64::from(offset + u32::from(unit) * 5)),
                    attempt_limit: None,
                });
            }
            milestones.push(Milestone {
                key: MilestoneKey::final_exam(2, slot),
                track: "A".to_string(),
                date: date(2026, 2, 2) + chrono::Duration::days(i64::from(offset + 25)),
                attempt_limit: None,
            });
        }
        MilestoneCatalog::new(milestones)
    }

    fn student(id: &str) -> StudentRecords {
        StudentRecords {
            student_id: id.to_string(),
            licensed: true,
            track: Some("A".to_string()),
            registrations: vec![
                registration("M 117", 1, OpenStatus::Open),
                registration("M 118", 2, OpenStatus::Unset),
            ],
            ..StudentRecords::default()
        }
    }

    #[test]
    fn sentinels_come_before_any_deadline_lookup() {
        let mut unstarted = student("s-1");
        unstarted.registrations[0].open_status = OpenStatus::Unset;
        unstarted.track = None;
        let mut unlicensed = student("s-2");
        unlicensed.licensed = false;

        let today = date(2026, 3, 1);
        assert_eq!(student_days_behind(&unstarted, &catalog(), today).unwrap(), NOT_STARTED);
        assert_eq!(student_days_behind(&unlicensed, &catalog(), today).unwrap(), GATE_NOT_MET);
    }

    #[test]
    fn earliest_unpassed_review_sets_the_lateness() {
        let mut records = student("s-1");
        records.exams = vec![passed("M 117", ExamKind::Review, 1)];

        // review 2 of the first course was due 2026-02-12
        assert_eq!(student_days_behind(&records, &catalog(), date(2026, 2, 20)).unwrap(), 8);
        assert_eq!(student_days_behind(&records, &catalog(), date(2026, 2, 10)).unwrap(), 0);
    }

    #[test]
    fn finished_course_moves_the_walk_to_the_next_slot() {
        let mut records = student("s-1");
        records.exams = (1..=4)
            .map(|unit| passed("M 117", ExamKind::Review, unit))
            .chain([passed("M 117", ExamKind::Final, 5), passed("M 118", ExamKind::Review, 1)])
            .collect();

        // second course review 2 due 2026-03-12
        assert_eq!(student_days_behind(&records, &catalog(), date(2026, 3, 15)).unwrap(), 3);
    }

    #[test]
    fn report_lists_sentinels_and_long_overdue_students() {
        let mut on_time = student("s-1");
        on_time.exams = vec![passed("M 117", ExamKind::Review, 1)];
        let late = student("s-2");
        let mut unstarted = student("s-3");
        unstarted.registrations[0].open_status = OpenStatus::Unset;
        let mut broken = student("s-4");
        broken.track = None;

        let students = [on_time, late, unstarted, broken];
        let report = DaysBehindReport::build(&students, &catalog(), date(2026, 2, 14));
        assert_eq!(report.buckets.get(&NOT_STARTED), Some(&vec!["s-3".to_string()]));
        assert_eq!(report.buckets.get(&2), Some(&vec!["s-1".to_string()]));
        assert_eq!(report.buckets.get(&7), Some(&vec!["s-2".to_string()]));
        assert_eq!(report.skipped.len(), 1);

        assert_eq!(report.students_n_days_late(5), vec!["s-3", "s-2"]);
    }
}
