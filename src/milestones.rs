use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::calendar::BusinessCalendar;
use crate::error::EngineError;
use crate::models::{Milestone, MilestoneKey, MilestoneOverride};

/// Configured milestones of a term, grouped by pace and track.
#[derive(Debug, Clone, Default)]
pub struct MilestoneCatalog {
    by_pace_track: BTreeMap<(u8, String), Vec<Milestone>>,
}

impl MilestoneCatalog {
    pub fn new(milestones: Vec<Milestone>) -> Self {
        let mut by_pace_track: BTreeMap<(u8, String), Vec<Milestone>> = BTreeMap::new();
        for milestone in milestones {
            by_pace_track
                .entry((milestone.key.pace, milestone.track.clone()))
                .or_default()
                .push(milestone);
        }
        Self { by_pace_track }
    }

    pub fn for_pace(&self, pace: u8, track: &str) -> Result<&[Milestone], EngineError> {
        self.by_pace_track
            .get(&(pace, track.to_string()))
            .map(Vec::as_slice)
            .ok_or_else(|| EngineError::NoMilestones {
                pace,
                track: track.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.by_pace_track.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub date: NaiveDate,
    pub attempt_limit: Option<u32>,
}

/// Looks up configured deadlines for one student on one track.
///
/// The student's overrides are ordered by `(date, attempt_limit)` up front, so
/// the latest-dated override always wins regardless of storage order. On equal
/// dates `None` sorts before any limit and smaller limits before larger ones,
/// leaving the most generous limit last.
#[derive(Debug)]
pub struct MilestoneResolver<'a> {
    milestones: &'a [Milestone],
    overrides: Vec<&'a MilestoneOverride>,
    track: &'a str,
    student_id: &'a str,
}

impl<'a> MilestoneResolver<'a> {
    pub fn new(
        milestones: &'a [Milestone],
        overrides: &'a [MilestoneOverride],
        track: &'a str,
        student_id: &'a str,
    ) -> Self {
        let mut overrides: Vec<&MilestoneOverride> = overrides
            .iter()
            .filter(|o| o.student_id == student_id && o.track == track)
            .collect();
        overrides.sort_by_key(|o| (o.date, o.attempt_limit));

        Self {
            milestones,
            overrides,
            track,
            student_id,
        }
    }

    pub fn student_id(&self) -> &str {
        self.student_id
    }

    /// `None` when no milestone is configured for the key on this track.
    pub fn resolve(&self, key: MilestoneKey) -> Option<Resolution> {
        let base = self
            .milestones
            .iter()
            .find(|m| m.key == key && m.track == self.track)?;

        let mut resolution = Resolution {
            date: base.date,
            attempt_limit: base.attempt_limit,
        };
        for adjustment in self.overrides.iter().filter(|o| o.key == key) {
            resolution.date = adjustment.date;
            if adjustment.attempt_limit.is_some() {
                resolution.attempt_limit = adjustment.attempt_limit;
            }
        }
        Some(resolution)
    }

    pub fn resolve_date(&self, key: MilestoneKey) -> Option<NaiveDate> {
        self.resolve(key).map(|r| r.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitDeadlines {
    /// Objectives 1 to 5.
    pub homework: [NaiveDate; 5],
    pub review: NaiveDate,
    pub unit_exam: NaiveDate,
}

/// Complete deadline schedule for one course slot of a pace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveMilestones {
    pub pace: u8,
    pub slot: u8,
    /// Only the first course of a pace carries the Users exam.
    pub users: Option<NaiveDate>,
    pub skills_review: NaiveDate,
    pub units: [UnitDeadlines; 4],
    pub final_exam: NaiveDate,
    pub last_try: NaiveDate,
    pub last_try_attempts: u32,
    /// Set when an anchor was missing and a fixed calendar position stood in.
    pub degraded: bool,
}

impl EffectiveMilestones {
    pub fn compute(
        pace: u8,
        slot: u8,
        resolver: &MilestoneResolver<'_>,
        calendar: &BusinessCalendar,
    ) -> Self {
        let anchor_keys = [
            MilestoneKey::review(pace, slot, 1),
            MilestoneKey::review(pace, slot, 2),
            MilestoneKey::review(pace, slot, 3),
            MilestoneKey::review(pace, slot, 4),
            MilestoneKey::final_exam(pace, slot),
        ];

        let mut degraded = false;
        let mut anchor_dates = [calendar.day(0); 5];
        let mut anchors = [0usize; 5];
        for (position, key) in anchor_keys.iter().enumerate() {
            match resolver.resolve_date(*key) {
                Some(date) => {
                    anchor_dates[position] = date;
                    anchors[position] = calendar.index_on_or_after(date);
                }
                None => {
                    let fallback = position.min(calendar.last_index());
                    warn!(
                        student_id = resolver.student_id(),
                        milestone = %key,
                        fallback_index = fallback,
                        "anchor milestone not configured; using fixed calendar position"
                    );
                    degraded = true;
                    anchors[position] = fallback;
                    anchor_dates[position] = calendar.day(fallback as i64);
                }
            }
        }

        let last = calendar.last_index();
        let lookup = |key: MilestoneKey, index: usize| {
            resolver
                .resolve_date(key)
                .unwrap_or_else(|| calendar.day(index as i64))
        };

        let users = (slot == 1).then(|| lookup(MilestoneKey::users(pace), anchors[0] / 2));
        let skills_review = lookup(MilestoneKey::skills_review(pace, slot), anchors[0] * 3 / 4);

        let mut units = [UnitDeadlines {
            homework: [anchor_dates[0]; 5],
            review: anchor_dates[0],
            unit_exam: anchor_dates[0],
        }; 4];
        for (position, unit) in units.iter_mut().enumerate() {
            let number = position as u8 + 1;
            let (lower, upper) = (anchors[position], anchors[position + 1]);

            for (objective, due) in (1..=5u8).zip(unit.homework.iter_mut()) {
                *due = lookup(
                    MilestoneKey::homework(pace, slot, number, objective),
                    interpolate_index(lower, upper, objective, last),
                );
            }
            unit.review = anchor_dates[position];
            unit.unit_exam = lookup(
                MilestoneKey::unit_exam(pace, slot, number),
                (lower + 1).min(last),
            );
        }

        // nothing in unit u may fall due before that unit's review
        for unit in units.iter_mut() {
            let floor = unit.review;
            for due in unit.homework.iter_mut() {
                *due = (*due).max(floor);
            }
            unit.unit_exam = unit.unit_exam.max(floor);
        }

        let final_exam = anchor_dates[4];
        let last_try_key = MilestoneKey::last_try(pace, slot);
        let last_try_resolution = resolver.resolve(last_try_key);
        let last_try = match last_try_resolution {
            Some(resolution) if resolution.date > final_exam => resolution.date,
            _ => final_exam,
        };
        let last_try_attempts = last_try_resolution
            .and_then(|resolution| resolution.attempt_limit)
            .unwrap_or(0);

        Self {
            pace,
            slot,
            users,
            skills_review,
            units,
            final_exam,
            last_try,
            last_try_attempts,
            degraded,
        }
    }

    /// Deadlines of unit 1 to 4.
    pub fn unit(&self, number: u8) -> &UnitDeadlines {
        &self.units[usize::from(number.clamp(1, 4)) - 1]
    }
}

/// Business-day index of homework `objective` between two anchor indices.
pub(crate) fn interpolate_index(lower: usize, upper: usize, objective: u8, last: usize) -> usize {
    let lower = lower as i64;
    let span = upper as i64 - lower;
    let index = lower + i64::from(objective) * span / 6;
    index.clamp(0, last as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Term, TermWeek};
    use chrono::Duration;
    use proptest::prelude::*;

    fn calendar() -> BusinessCalendar {
        let week_zero = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let term = Term {
            key: "SP26".to_string(),
            start_date: week_zero,
            weeks: (0..=14)
                .map(|week_nbr| TermWeek {
                    week_nbr,
                    monday: week_zero + Duration::weeks(i64::from(week_nbr)),
                })
                .collect(),
            last_class_day: week_zero + Duration::weeks(14),
        };
        BusinessCalendar::build(&term, &[]).unwrap()
    }

    fn milestone(key: MilestoneKey, date: NaiveDate) -> Milestone {
        Milestone {
            key,
            track: "A".to_string(),
            date,
            attempt_limit: None,
        }
    }

    fn anchored(calendar: &BusinessCalendar, indices: [i64; 5]) -> Vec<Milestone> {
        let mut milestones: Vec<Milestone> = (1..=4u8)
            .map(|unit| {
                milestone(
                    MilestoneKey::review(1, 1, unit),
                    calendar.day(indices[usize::from(unit) - 1]),
                )
            })
            .collect();
        milestones.push(milestone(MilestoneKey::final_exam(1, 1), calendar.day(indices[4])));
        milestones
    }

    fn adjustment(key: MilestoneKey, date: NaiveDate, limit: Option<u32>) -> MilestoneOverride {
        MilestoneOverride {
            student_id: "s-1".to_string(),
            key,
            track: "A".to_string(),
            date,
            attempt_limit: limit,
        }
    }

    #[test]
    fn catalog_groups_by_pace_and_track() {
        let calendar = calendar();
        let mut other = milestone(MilestoneKey::review(2, 1, 1), calendar.day(4));
        other.track = "B".to_string();
        let mut milestones = anchored(&calendar, [10, 20, 30, 40, 50]);
        milestones.push(other);

        let catalog = MilestoneCatalog::new(milestones);
        assert_eq!(catalog.len(), 6);
        assert_eq!(catalog.for_pace(1, "A").unwrap().len(), 5);
        assert_eq!(catalog.for_pace(2, "B").unwrap().len(), 1);
        assert!(matches!(
            catalog.for_pace(2, "A"),
            Err(EngineError::NoMilestones { pace: 2, .. })
        ));
    }

    #[test]
    fn latest_override_wins_regardless_of_storage_order() {
        let calendar = calendar();
        let key = MilestoneKey::review(1, 1, 2);
        let milestones = vec![milestone(key, calendar.day(10))];
        let overrides = vec![
            adjustment(key, calendar.day(20), None),
            adjustment(key, calendar.day(15), None),
        ];

        let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");
        assert_eq!(resolver.resolve_date(key), Some(calendar.day(20)));
    }

    #[test]
    fn overrides_for_other_students_or_tracks_are_ignored() {
        let calendar = calendar();
        let key = MilestoneKey::review(1, 1, 2);
        let milestones = vec![milestone(key, calendar.day(10))];
        let mut other_track = adjustment(key, calendar.day(30), None);
        other_track.track = "B".to_string();
        let mut other_student = adjustment(key, calendar.day(31), None);
        other_student.student_id = "s-2".to_string();
        let overrides = vec![other_track, other_student];

        let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");
        assert_eq!(resolver.resolve_date(key), Some(calendar.day(10)));
    }

    #[test]
    fn equal_dates_keep_the_most_generous_attempt_limit() {
        let calendar = calendar();
        let key = MilestoneKey::last_try(1, 1);
        let mut base = milestone(key, calendar.day(50));
        base.attempt_limit = Some(1);
        let milestones = vec![base];

        let forwards = vec![
            adjustment(key, calendar.day(55), Some(3)),
            adjustment(key, calendar.day(55), None),
            adjustment(key, calendar.day(55), Some(2)),
        ];
        let backwards: Vec<MilestoneOverride> = forwards.iter().rev().cloned().collect();

        for overrides in [forwards, backwards] {
            let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");
            assert_eq!(
                resolver.resolve(key),
                Some(Resolution {
                    date: calendar.day(55),
                    attempt_limit: Some(3),
                })
            );
        }
    }

    #[test]
    fn later_override_without_limit_keeps_earlier_limit() {
        let calendar = calendar();
        let key = MilestoneKey::last_try(1, 1);
        let milestones = vec![milestone(key, calendar.day(50))];
        let overrides = vec![
            adjustment(key, calendar.day(52), Some(2)),
            adjustment(key, calendar.day(58), None),
        ];

        let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");
        let resolution = resolver.resolve(key).unwrap();
        assert_eq!(resolution.date, calendar.day(58));
        assert_eq!(resolution.attempt_limit, Some(2));
    }

    #[test]
    fn unconfigured_key_resolves_to_none_even_with_overrides() {
        let calendar = calendar();
        let key = MilestoneKey::skills_review(1, 1);
        let overrides = vec![adjustment(key, calendar.day(3), None)];

        let resolver = MilestoneResolver::new(&[], &overrides, "A", "s-1");
        assert_eq!(resolver.resolve(key), None);
    }

    #[test]
    fn first_homework_lands_a_sixth_of_the_way_between_anchors() {
        let calendar = calendar();

        let milestones = anchored(&calendar, [10, 40, 45, 50, 60]);
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");
        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(schedule.unit(1).homework[0], calendar.day(15));
        assert!(!schedule.degraded);

        let milestones = anchored(&calendar, [2, 4, 6, 10, 40]);
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");
        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(schedule.unit(4).homework[0], calendar.day(15));
    }

    #[test]
    fn course_level_milestones_interpolate_before_the_first_review() {
        let calendar = calendar();
        let milestones = anchored(&calendar, [12, 24, 36, 48, 60]);
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");

        let first = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(first.skills_review, calendar.day(9));
        assert_eq!(first.users, Some(calendar.day(6)));
        assert_eq!(first.unit(1).unit_exam, calendar.day(13));
        assert_eq!(first.unit(3).homework[4], calendar.day(46));

        let milestones: Vec<Milestone> = anchored(&calendar, [12, 24, 36, 48, 60])
            .into_iter()
            .map(|mut m| {
                m.key.pace = 2;
                m.key.slot = 2;
                m
            })
            .collect();
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");
        let second = EffectiveMilestones::compute(2, 2, &resolver, &calendar);
        assert_eq!(second.users, None);
        assert!(!second.degraded);
    }

    #[test]
    fn configured_dates_take_precedence_over_interpolation() {
        let calendar = calendar();
        let mut milestones = anchored(&calendar, [10, 20, 30, 40, 50]);
        milestones.push(milestone(MilestoneKey::skills_review(1, 1), calendar.day(2)));
        milestones.push(milestone(MilestoneKey::homework(1, 1, 2, 3), calendar.day(27)));
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");

        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(schedule.skills_review, calendar.day(2));
        assert_eq!(schedule.unit(2).homework[2], calendar.day(27));
    }

    #[test]
    fn unit_work_never_falls_due_before_its_review() {
        let calendar = calendar();
        let mut milestones = anchored(&calendar, [10, 20, 30, 40, 50]);
        milestones.push(milestone(MilestoneKey::homework(1, 1, 3, 1), calendar.day(5)));
        milestones.push(milestone(MilestoneKey::unit_exam(1, 1, 3), calendar.day(6)));
        // review 2 moved past review 3 for this student
        let overrides = vec![adjustment(
            MilestoneKey::review(1, 1, 2),
            calendar.day(33),
            None,
        )];
        let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");

        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        for unit in schedule.units.iter() {
            assert!(unit.homework.iter().all(|due| *due >= unit.review));
            assert!(unit.unit_exam >= unit.review);
        }
        assert_eq!(schedule.unit(3).homework[0], calendar.day(30));
        assert_eq!(schedule.unit(2).review, calendar.day(33));
        assert_eq!(schedule.unit(2).homework[4], calendar.day(33));
    }

    #[test]
    fn missing_anchors_fall_back_to_fixed_positions() {
        let calendar = calendar();
        let resolver = MilestoneResolver::new(&[], &[], "A", "s-1");

        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert!(schedule.degraded);
        assert_eq!(schedule.unit(1).review, calendar.day(0));
        assert_eq!(schedule.unit(4).review, calendar.day(3));
        assert_eq!(schedule.final_exam, calendar.day(4));
        assert_eq!(schedule.last_try, schedule.final_exam);
        assert_eq!(schedule.last_try_attempts, 0);
    }

    #[test]
    fn last_try_never_precedes_the_final() {
        let calendar = calendar();
        let mut milestones = anchored(&calendar, [10, 20, 30, 40, 50]);
        let mut last_try = milestone(MilestoneKey::last_try(1, 1), calendar.day(48));
        last_try.attempt_limit = Some(2);
        milestones.push(last_try);
        let resolver = MilestoneResolver::new(&milestones, &[], "A", "s-1");

        let schedule = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(schedule.last_try, calendar.day(50));
        assert_eq!(schedule.last_try_attempts, 2);
    }

    #[test]
    fn recomputing_yields_identical_schedules() {
        let calendar = calendar();
        let milestones = anchored(&calendar, [8, 19, 33, 41, 57]);
        let overrides = vec![adjustment(MilestoneKey::review(1, 1, 3), calendar.day(35), None)];
        let resolver = MilestoneResolver::new(&milestones, &overrides, "A", "s-1");

        let first = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        let second = EffectiveMilestones::compute(1, 1, &resolver, &calendar);
        assert_eq!(first, second);
    }

    proptest! {
        #[test]
        fn homework_order_follows_objective_order(
            lower in 0usize..120,
            span in 0usize..120,
            first in 1u8..=5,
            step in 1u8..=4,
        ) {
            let second = (first + step).min(5);
            prop_assume!(first < second);
            let upper = lower + span;
            let last = 150;

            prop_assert!(
                interpolate_index(lower, upper, first, last)
                    <= interpolate_index(lower, upper, second, last)
            );
        }
    }
}
