use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cadence::{self, CadenceDecision};
use crate::calendar::BusinessCalendar;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::milestones::{EffectiveMilestones, MilestoneCatalog, MilestoneResolver};
use crate::models::{StudentId, StudentRecords, Term};
use crate::selector::{order_by_pace, select_current};
use crate::status::{CourseStatus, CurrentMilestone, StatusInput};

/// Read-only inputs shared by every worker during a scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext<'a> {
    pub term: &'a Term,
    pub calendar: &'a BusinessCalendar,
    pub catalog: &'a MilestoneCatalog,
    pub config: &'a EngineConfig,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    DoNotDisturb,
    ExcludedTrack(String),
    Failed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoNotDisturb => f.write_str("do not disturb"),
            Self::ExcludedTrack(track) => write!(f, "track {track} is not messaged"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

impl From<EngineError> for SkipReason {
    fn from(err: EngineError) -> Self {
        Self::Failed(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStudent {
    pub student_id: StudentId,
    pub reason: SkipReason,
}

impl SkippedStudent {
    pub fn new(student_id: &str, err: &EngineError) -> Self {
        Self {
            student_id: student_id.to_string(),
            reason: SkipReason::Failed(err.to_string()),
        }
    }
}

/// What the nightly run concluded for one student.
#[derive(Debug, Clone, Serialize)]
pub struct StudentOutcome {
    pub student_id: StudentId,
    pub full_name: String,
    pub course: String,
    pub section: String,
    pub pace: u8,
    pub track: String,
    pub instructor: Option<String>,
    pub current: Option<CurrentMilestone>,
    pub urgency: i32,
    pub total_score: i32,
    pub blocked: bool,
    pub decision: CadenceDecision,
    /// Urgency to store on the term record; absent for welcome and blocked notices.
    pub persist_urgency: Option<i32>,
    pub days_since_activity: i64,
    /// Weekdays since the last message; absent for welcome and blocked notices.
    pub days_since_message: Option<i64>,
    /// Code of the most recent message sent to the student.
    pub last_message: Option<String>,
    pub degraded: bool,
}

pub fn scan_student(
    context: &ScanContext<'_>,
    student: &StudentRecords,
) -> Result<StudentOutcome, SkipReason> {
    let student_id = student.student_id.as_str();
    if student.do_not_disturb {
        return Err(SkipReason::DoNotDisturb);
    }
    let track = student
        .track
        .as_deref()
        .ok_or_else(|| EngineError::MissingTrack(student_id.to_string()))?;
    if context.config.is_excluded_track(track) {
        return Err(SkipReason::ExcludedTrack(track.to_string()));
    }

    let ordered = order_by_pace(student_id, &student.registrations)?;
    let pace = ordered.len() as u8;
    let current_index = select_current(&ordered);
    let registration = ordered[current_index];
    let slot = current_index as u8 + 1;

    let milestones = context.catalog.for_pace(pace, track)?;
    let resolver = MilestoneResolver::new(milestones, &student.overrides, track, student_id);
    let schedule = EffectiveMilestones::compute(pace, slot, &resolver, context.calendar);

    let input = StatusInput {
        course: &registration.course,
        exams: &student.exams,
        homework: &student.homework,
        messages: &student.messages,
        licensed: student.licensed,
        prereqs_met: student.prereqs_met.contains(&registration.course),
        started: registration.open_status.is_started(),
        term_start: context.term.start_date,
        today: context.today,
    };
    let status = CourseStatus::evaluate(&schedule, &input, context.config);
    let outcome = cadence::decide((&status).into(), &student.messages, &context.config.cadence);

    debug!(
        student_id,
        course = %registration.course,
        current = ?status.current.map(|m| m.to_string()),
        urgency = status.urgency,
        decision = %outcome.decision,
        "evaluated student"
    );

    Ok(StudentOutcome {
        student_id: student_id.to_string(),
        full_name: student.full_name.clone(),
        course: registration.course.clone(),
        section: registration.section.clone(),
        pace,
        track: track.to_string(),
        instructor: context.config.instructor_for(pace, track).map(str::to_string),
        current: status.current,
        urgency: status.urgency,
        total_score: status.total_score,
        blocked: status.blocked,
        decision: outcome.decision,
        persist_urgency: outcome.persist_urgency,
        days_since_activity: status.days_since_activity,
        days_since_message: outcome.days_ago,
        last_message: student
            .messages
            .iter()
            .max_by_key(|message| message.date)
            .map(|message| message.message_code.clone()),
        degraded: schedule.degraded,
    })
}

/// instructor → course → section → decision → students
pub type ReviewGroups<'a> = BTreeMap<String, BTreeMap<String, SectionGroups<'a>>>;

/// section → decision → students
pub type SectionGroups<'a> = BTreeMap<String, BTreeMap<CadenceDecision, Vec<&'a StudentOutcome>>>;

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub outcomes: Vec<StudentOutcome>,
    pub skipped: Vec<SkippedStudent>,
    pub canceled: bool,
}

impl ScanReport {
    /// `(student, urgency)` pairs to write back after the sweep.
    pub fn urgency_updates(&self) -> Vec<(&str, i32)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.persist_urgency.map(|urgency| (o.student_id.as_str(), urgency)))
            .collect()
    }

    pub fn messages(&self) -> impl Iterator<Item = &StudentOutcome> {
        self.outcomes.iter().filter(|o| o.decision.is_message())
    }

    /// Queued messages arranged for instructor review.
    pub fn review_groups(&self, config: &EngineConfig) -> ReviewGroups<'_> {
        let mut groups = ReviewGroups::new();
        for outcome in self.messages() {
            push_grouped(&mut groups, outcome, outcome.decision, config);
        }
        groups
    }

    /// Early performance feedback list, most urgent first.
    pub fn epf_candidates(&self, min_urgency: i32) -> Vec<&StudentOutcome> {
        let mut candidates: Vec<&StudentOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.urgency >= min_urgency)
            .collect();
        candidates.sort_by(|a, b| {
            b.urgency
                .cmp(&a.urgency)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });
        candidates
    }
}

pub(crate) fn push_grouped<'a>(
    groups: &mut ReviewGroups<'a>,
    outcome: &'a StudentOutcome,
    decision: CadenceDecision,
    config: &EngineConfig,
) {
    let instructor = outcome.instructor.clone().unwrap_or_else(|| "Unassigned".to_string());
    groups
        .entry(instructor)
        .or_default()
        .entry(outcome.course.clone())
        .or_default()
        .entry(config.section_group(&outcome.section).to_string())
        .or_default()
        .entry(decision)
        .or_default()
        .push(outcome);
}

/// Evaluates every student on a worker pool.
///
/// `cancel` is checked before each student; a canceled run keeps whatever
/// students were fully evaluated. A panic inside one student's evaluation is
/// recorded as a skip.
pub fn run_scan(
    context: &ScanContext<'_>,
    students: &[StudentRecords],
    cancel: &AtomicBool,
) -> Result<ScanReport, EngineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(context.config.worker_threads)
        .build()
        .map_err(|e| EngineError::WorkerPool(e.to_string()))?;

    let run_id = Uuid::new_v4();
    info!(%run_id, today = %context.today, students = students.len(), "starting scan");

    let results: Vec<Option<Result<StudentOutcome, SkippedStudent>>> = pool.install(|| {
        students
            .par_iter()
            .map(|student| {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }
                let attempt = catch_unwind(AssertUnwindSafe(|| scan_student(context, student)));
                let reason = match attempt {
                    Ok(Ok(outcome)) => return Some(Ok(outcome)),
                    Ok(Err(reason)) => reason,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        SkipReason::Failed(format!("panicked: {message}"))
                    }
                };
                match &reason {
                    SkipReason::DoNotDisturb | SkipReason::ExcludedTrack(_) => {
                        info!(student_id = %student.student_id, "skipping student: {reason}")
                    }
                    SkipReason::Failed(_) => {
                        warn!(student_id = %student.student_id, "skipping student: {reason}")
                    }
                }
                Some(Err(SkippedStudent {
                    student_id: student.student_id.clone(),
                    reason,
                }))
            })
            .collect()
    });

    let canceled = results.iter().any(Option::is_none);
    let mut outcomes = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();
    for result in results.into_iter().flatten() {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(skip) => skipped.push(skip),
        }
    }

    let degraded = outcomes.iter().filter(|o| o.degraded).count();
    if degraded > 0 {
        warn!(
            %run_id,
            degraded,
            "students scheduled from fallback anchors; review milestone configuration"
        );
    }
    info!(
        %run_id,
        evaluated = outcomes.len(),
        skipped = skipped.len(),
        messages = outcomes.iter().filter(|o| o.decision.is_message()).count(),
        canceled,
        "scan finished"
    );

    Ok(ScanReport {
        run_id,
        today: context.today,
        outcomes,
        skipped,
        canceled,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
