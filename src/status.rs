use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::calendar::weekdays_since;
use crate::config::EngineConfig;
use crate::milestones::EffectiveMilestones;
use crate::models::{AttemptOutcome, ExamAttempt, ExamKind, HomeworkAttempt, SentMessage};

/// Attempt history of one graded milestone. Withdrawn attempts never count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotProgress {
    pub attempts: u32,
    pub passed: bool,
    pub last_attempt: Option<NaiveDate>,
}

impl SlotProgress {
    fn record(&mut self, outcome: AttemptOutcome, date: NaiveDate) {
        if outcome == AttemptOutcome::Withdrawn {
            return;
        }
        self.attempts += 1;
        self.passed |= outcome == AttemptOutcome::Passed;
        self.last_attempt = self.last_attempt.max(Some(date));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitProgress {
    pub homework: [SlotProgress; 5],
    pub review: SlotProgress,
    pub unit_exam: SlotProgress,
    /// Earned by passing the review on or before its due date.
    pub review_bonus: i32,
    /// Best score across passing unit exam attempts.
    pub exam_score: i32,
}

/// Where a student stands in the course, in the order work is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentMilestone {
    Prereq,
    Start,
    Users,
    SkillsReview,
    Homework { unit: u8, objective: u8 },
    Review(u8),
    UnitExam(u8),
    Final,
    LastTry,
    /// Final passed with a total below the passing score.
    Pass,
    /// Final passed, but the grade can still rise to a higher ceiling.
    Max,
}

impl fmt::Display for CurrentMilestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prereq => f.write_str("PREREQ"),
            Self::Start => f.write_str("START"),
            Self::Users => f.write_str("US"),
            Self::SkillsReview => f.write_str("SR"),
            Self::Homework { unit, objective } => write!(f, "HW{unit}.{objective}"),
            Self::Review(unit) => write!(f, "RE{unit}"),
            Self::UnitExam(unit) => write!(f, "UE{unit}"),
            Self::Final => f.write_str("FIN"),
            Self::LastTry => f.write_str("F1"),
            Self::Pass => f.write_str("PASS"),
            Self::Max => f.write_str("MAX"),
        }
    }
}

impl Serialize for CurrentMilestone {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The student-side facts a course status is folded from.
#[derive(Debug, Clone, Copy)]
pub struct StatusInput<'a> {
    pub course: &'a str,
    /// Every exam attempt of the student, all courses.
    pub exams: &'a [ExamAttempt],
    pub homework: &'a [HomeworkAttempt],
    pub messages: &'a [SentMessage],
    pub licensed: bool,
    pub prereqs_met: bool,
    pub started: bool,
    pub term_start: NaiveDate,
    pub today: NaiveDate,
}

/// Progress, score and urgency of one student in their current course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseStatus {
    pub course: String,
    pub slot: u8,
    pub prereqs_met: bool,
    pub started: bool,
    /// Present only for the first course of a pace.
    pub users: Option<SlotProgress>,
    pub skills_review: SlotProgress,
    pub units: [UnitProgress; 4],
    pub final_exam: SlotProgress,
    pub final_score: i32,
    pub total_score: i32,
    pub max_possible_score: i32,
    pub last_try_available: bool,
    pub blocked: bool,
    pub urgency: i32,
    pub current: Option<CurrentMilestone>,
    pub days_since_activity: i64,
    pub days_since_message: i64,
}

impl CourseStatus {
    pub fn evaluate(
        schedule: &EffectiveMilestones,
        input: &StatusInput<'_>,
        config: &EngineConfig,
    ) -> Self {
        let scoring = &config.scoring;
        let today = input.today;

        let mut users = schedule.users.map(|_| SlotProgress::default());
        let mut skills_review = SlotProgress::default();
        let mut units = [UnitProgress::default(); 4];
        let mut final_exam = SlotProgress::default();
        let mut final_score = 0;

        for exam in input.exams {
            let passed = exam.outcome == AttemptOutcome::Passed;
            if exam.kind == ExamKind::UsersExam {
                if let Some(progress) = users.as_mut() {
                    progress.record(exam.outcome, exam.date);
                }
                continue;
            }
            if exam.course != input.course || exam.outcome == AttemptOutcome::Withdrawn {
                continue;
            }

            match (exam.kind, exam.unit) {
                (_, Some(0)) => skills_review.record(exam.outcome, exam.date),
                (ExamKind::Review, Some(unit @ 1..=4)) => {
                    let progress = &mut units[usize::from(unit) - 1];
                    progress.review.record(exam.outcome, exam.date);
                    if passed && exam.date <= schedule.unit(unit).review {
                        progress.review_bonus = scoring.review_bonus;
                    }
                }
                (ExamKind::UnitExam, Some(unit @ 1..=4)) => {
                    let progress = &mut units[usize::from(unit) - 1];
                    progress.unit_exam.record(exam.outcome, exam.date);
                    if passed {
                        progress.exam_score = progress.exam_score.max(exam.score.unwrap_or(0));
                    }
                }
                (ExamKind::Final, Some(5)) => {
                    final_exam.record(exam.outcome, exam.date);
                    if passed {
                        final_score = final_score.max(exam.score.unwrap_or(0));
                    }
                }
                (kind, unit) => {
                    debug!(
                        course = input.course,
                        ?kind,
                        ?unit,
                        "ignoring exam outside the course layout"
                    );
                }
            }
        }
        if input.licensed {
            if let Some(progress) = users.as_mut() {
                progress.passed = true;
            }
        }

        for attempt in input.homework.iter().filter(|h| h.course == input.course) {
            if !(1..=4).contains(&attempt.unit) || !(1..=5).contains(&attempt.objective) {
                continue;
            }
            units[usize::from(attempt.unit) - 1].homework[usize::from(attempt.objective) - 1]
                .record(attempt.outcome, attempt.date);
        }

        let mut last_try_available = false;
        let mut blocked = false;
        if !final_exam.passed {
            if today > schedule.final_exam {
                let late_finals = input
                    .exams
                    .iter()
                    .filter(|e| {
                        e.course == input.course
                            && e.kind == ExamKind::Final
                            && e.unit == Some(5)
                            && e.outcome != AttemptOutcome::Withdrawn
                            && e.date > schedule.final_exam
                    })
                    .count() as u32;
                last_try_available = late_finals < schedule.last_try_attempts;
                blocked = !last_try_available;
            }
            if today > schedule.last_try {
                blocked = true;
            }
        }

        let bonuses: i32 = units.iter().map(|u| u.review_bonus).sum();
        let unit_scores: i32 = units.iter().map(|u| u.exam_score).sum();
        let total_score = bonuses + unit_scores + final_score;
        let max_possible_score = bonuses + scoring.base_max_score;

        let overdue = |due: NaiveDate, progress: &SlotProgress| !progress.passed && due <= today;
        let mut urgency = if input.prereqs_met {
            0
        } else {
            scoring.prereq_urgency
        };
        if let (Some(due), Some(progress)) = (schedule.users, users.as_ref()) {
            if overdue(due, progress) {
                urgency += 1;
            }
        }
        if overdue(schedule.skills_review, &skills_review) {
            urgency += 1;
        }
        for (deadlines, progress) in schedule.units.iter().zip(units.iter()) {
            urgency += deadlines
                .homework
                .iter()
                .zip(progress.homework.iter())
                .filter(|(due, slot)| overdue(**due, slot))
                .count() as i32;
            if overdue(deadlines.review, &progress.review) {
                urgency += 3;
            }
            if overdue(deadlines.unit_exam, &progress.unit_exam) {
                urgency += 2;
            }
        }
        if final_exam.passed {
            if total_score < scoring.passing_score {
                urgency += 3;
            }
        } else {
            urgency += final_exam_urgency(schedule.final_exam, schedule.last_try, today);
        }

        let latest_activity = input
            .homework
            .iter()
            .map(|h| h.date)
            .chain(input.exams.iter().map(|e| e.date))
            .fold(input.term_start, NaiveDate::max);

        let mut status = Self {
            course: input.course.to_string(),
            slot: schedule.slot,
            prereqs_met: input.prereqs_met,
            started: input.started,
            users,
            skills_review,
            units,
            final_exam,
            final_score,
            total_score,
            max_possible_score,
            last_try_available,
            blocked,
            urgency,
            current: None,
            days_since_activity: weekdays_since(latest_activity, today),
            days_since_message: weekdays_since_last_message(
                input.messages,
                today,
                config.cadence.no_message_days,
            ),
        };
        status.current = status.locate_current(
            schedule,
            today,
            &scoring.ceiling_thresholds,
            scoring.passing_score,
        );
        status
    }

    fn locate_current(
        &self,
        schedule: &EffectiveMilestones,
        today: NaiveDate,
        ceiling_thresholds: &[i32],
        passing_score: i32,
    ) -> Option<CurrentMilestone> {
        if !self.prereqs_met {
            return Some(CurrentMilestone::Prereq);
        }
        if !self.started {
            return Some(CurrentMilestone::Start);
        }
        if self.users.is_some_and(|progress| !progress.passed) {
            return Some(CurrentMilestone::Users);
        }
        if !self.skills_review.passed {
            return Some(CurrentMilestone::SkillsReview);
        }
        for (unit, progress) in (1..=4u8).zip(self.units.iter()) {
            if let Some(index) = progress.homework.iter().position(|slot| !slot.passed) {
                return Some(CurrentMilestone::Homework {
                    unit,
                    objective: index as u8 + 1,
                });
            }
            if !progress.review.passed {
                return Some(CurrentMilestone::Review(unit));
            }
            if !progress.unit_exam.passed {
                return Some(CurrentMilestone::UnitExam(unit));
            }
        }

        if self.final_exam.passed {
            if self.total_score < passing_score {
                Some(CurrentMilestone::Pass)
            } else if ceiling_thresholds
                .iter()
                .any(|&ceiling| self.total_score < ceiling && ceiling <= self.max_possible_score)
            {
                Some(CurrentMilestone::Max)
            } else {
                None
            }
        } else if today > schedule.final_exam {
            self.last_try_available.then_some(CurrentMilestone::LastTry)
        } else {
            Some(CurrentMilestone::Final)
        }
    }
}

/// Urgency contributed by an unpassed final, graduated on the days left.
///
/// Only the fourth day out carries the early warning level; three days out
/// already weighs like a missed final. Past the last try the weight stays
/// high for three days, then eases off.
pub fn final_exam_urgency(final_due: NaiveDate, last_try: NaiveDate, today: NaiveDate) -> i32 {
    match (final_due - today).num_days() {
        days if days > 4 => 0,
        4 => 1,
        2 => 3,
        1 => 5,
        0 => 7,
        _ if today <= last_try => 9,
        _ if today > last_try + Duration::days(3) => 5,
        _ => 9,
    }
}

/// Weekdays since the most recent message of any kind.
pub fn weekdays_since_last_message(
    messages: &[SentMessage],
    today: NaiveDate,
    no_message_days: i64,
) -> i64 {
    messages
        .iter()
        .map(|m| m.date)
        .max()
        .map_or(no_message_days, |latest| weekdays_since(latest, today))
}
