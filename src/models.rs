use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub type StudentId = String;

/// Touchpoint code recorded on the first message a student receives.
pub const WELCOME_TOUCHPOINT: &str = "WELCOME";

#[derive(Debug, Clone)]
pub struct TermWeek {
    pub week_nbr: u32,
    pub monday: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Term {
    pub key: String,
    pub start_date: NaiveDate,
    pub weeks: Vec<TermWeek>,
    pub last_class_day: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MilestoneKind {
    UsersExam,
    SkillsReview,
    /// Homework for one objective (1 to 5) of a unit.
    Homework(u8),
    UnitReview,
    UnitExam,
    FinalExam,
    FinalLastTry,
}

const HOMEWORK_CODES: [&str; 5] = ["H1", "H2", "H3", "H4", "H5"];

impl MilestoneKind {
    /// Two-letter type code used by the milestone tables.
    pub fn code(self) -> &'static str {
        match self {
            Self::UsersExam => "US",
            Self::SkillsReview => "SR",
            Self::Homework(objective) => {
                HOMEWORK_CODES[usize::from(objective.clamp(1, 5)) - 1]
            }
            Self::UnitReview => "RE",
            Self::UnitExam => "UE",
            Self::FinalExam => "FE",
            Self::FinalLastTry => "F1",
        }
    }
}

impl FromStr for MilestoneKind {
    type Err = EngineError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.trim() {
            "US" => Ok(Self::UsersExam),
            "SR" => Ok(Self::SkillsReview),
            "RE" => Ok(Self::UnitReview),
            "UE" => Ok(Self::UnitExam),
            "FE" => Ok(Self::FinalExam),
            "F1" => Ok(Self::FinalLastTry),
            other => HOMEWORK_CODES
                .iter()
                .position(|candidate| *candidate == other)
                .map(|index| Self::Homework(index as u8 + 1))
                .ok_or_else(|| EngineError::parse("milestone type", other)),
        }
    }
}

/// Identifies one deadline within a pace.
///
/// `slot` is the course position within the pace (1 to `pace`; 0 for the
/// pace-wide Users exam). `unit` is 0 for course-level milestones, 1 to 4 for
/// content units and 5 for the final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MilestoneKey {
    pub kind: MilestoneKind,
    pub pace: u8,
    pub slot: u8,
    pub unit: u8,
}

impl MilestoneKey {
    pub fn users(pace: u8) -> Self {
        Self {
            kind: MilestoneKind::UsersExam,
            pace,
            slot: 0,
            unit: 0,
        }
    }

    pub fn skills_review(pace: u8, slot: u8) -> Self {
        Self {
            kind: MilestoneKind::SkillsReview,
            pace,
            slot,
            unit: 0,
        }
    }

    pub fn homework(pace: u8, slot: u8, unit: u8, objective: u8) -> Self {
        Self {
            kind: MilestoneKind::Homework(objective),
            pace,
            slot,
            unit,
        }
    }

    pub fn review(pace: u8, slot: u8, unit: u8) -> Self {
        Self {
            kind: MilestoneKind::UnitReview,
            pace,
            slot,
            unit,
        }
    }

    pub fn unit_exam(pace: u8, slot: u8, unit: u8) -> Self {
        Self {
            kind: MilestoneKind::UnitExam,
            pace,
            slot,
            unit,
        }
    }

    pub fn final_exam(pace: u8, slot: u8) -> Self {
        Self {
            kind: MilestoneKind::FinalExam,
            pace,
            slot,
            unit: 5,
        }
    }

    pub fn last_try(pace: u8, slot: u8) -> Self {
        Self {
            kind: MilestoneKind::FinalLastTry,
            pace,
            slot,
            unit: 5,
        }
    }

    /// Legacy numeric form, `100 * pace + 10 * slot + unit`.
    pub fn number(&self) -> i32 {
        100 * i32::from(self.pace) + 10 * i32::from(self.slot) + i32::from(self.unit)
    }

    /// Decodes a `(type code, number)` pair as stored in the milestone tables.
    pub fn from_legacy(code: &str, number: i32) -> Result<Self, EngineError> {
        let invalid = || EngineError::InvalidMilestoneKey {
            code: code.to_string(),
            number,
        };
        let kind: MilestoneKind = code.parse()?;
        let pace = u8::try_from(number / 100).map_err(|_| invalid())?;
        let slot = ((number / 10) % 10) as u8;
        let unit = (number % 10) as u8;

        if !(1..=5).contains(&pace) || slot > pace || unit > 5 || number < 0 {
            return Err(invalid());
        }

        let consistent = match kind {
            MilestoneKind::UsersExam => slot == 0 && unit == 0,
            MilestoneKind::SkillsReview => slot >= 1 && unit == 0,
            MilestoneKind::Homework(_) | MilestoneKind::UnitReview | MilestoneKind::UnitExam => {
                slot >= 1 && (1..=4).contains(&unit)
            }
            MilestoneKind::FinalExam | MilestoneKind::FinalLastTry => slot >= 1 && unit == 5,
        };
        if !consistent {
            return Err(invalid());
        }

        Ok(Self {
            kind,
            pace,
            slot,
            unit,
        })
    }
}

impl fmt::Display for MilestoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.code(), self.number())
    }
}

/// A configured deadline for every student on a pace and track.
#[derive(Debug, Clone)]
pub struct Milestone {
    pub key: MilestoneKey,
    pub track: String,
    pub date: NaiveDate,
    pub attempt_limit: Option<u32>,
}

/// A per-student deadline adjustment (an approved appeal or accommodation).
#[derive(Debug, Clone)]
pub struct MilestoneOverride {
    pub student_id: StudentId,
    pub key: MilestoneKey,
    pub track: String,
    pub date: NaiveDate,
    pub attempt_limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenStatus {
    Unset,
    Open,
    ClosedEarly,
    ForfeitLate,
}

impl OpenStatus {
    pub fn from_code(code: Option<&str>) -> Result<Self, EngineError> {
        match code.map(str::trim) {
            None | Some("") => Ok(Self::Unset),
            Some("open") => Ok(Self::Open),
            Some("closed") => Ok(Self::ClosedEarly),
            Some("forfeit") => Ok(Self::ForfeitLate),
            Some(other) => Err(EngineError::parse("open status", other)),
        }
    }

    pub fn is_started(self) -> bool {
        self != Self::Unset
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub course: String,
    pub section: String,
    pub pace_order: Option<u8>,
    pub open_status: OpenStatus,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Passed,
    Failed,
    Withdrawn,
}

impl FromStr for AttemptOutcome {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "withdrawn" => Ok(Self::Withdrawn),
            other => Err(EngineError::parse("attempt outcome", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExamKind {
    Review,
    UnitExam,
    Final,
    UsersExam,
}

impl FromStr for ExamKind {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "review" => Ok(Self::Review),
            "unit" => Ok(Self::UnitExam),
            "final" => Ok(Self::Final),
            "users" => Ok(Self::UsersExam),
            other => Err(EngineError::parse("exam type", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExamAttempt {
    pub course: String,
    /// 0 is the skills review, 1-4 content units, 5 the final; `None` for the Users exam.
    pub unit: Option<u8>,
    pub kind: ExamKind,
    pub outcome: AttemptOutcome,
    pub score: Option<i32>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct HomeworkAttempt {
    pub course: String,
    pub unit: u8,
    pub objective: u8,
    pub outcome: AttemptOutcome,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub date: NaiveDate,
    pub touchpoint: String,
    pub message_code: String,
}

/// Everything the nightly scan knows about one student in the active term.
#[derive(Debug, Clone, Default)]
pub struct StudentRecords {
    pub student_id: StudentId,
    pub full_name: String,
    pub licensed: bool,
    pub do_not_disturb: bool,
    pub track: Option<String>,
    pub registrations: Vec<Registration>,
    pub exams: Vec<ExamAttempt>,
    pub homework: Vec<HomeworkAttempt>,
    pub overrides: Vec<MilestoneOverride>,
    pub messages: Vec<SentMessage>,
    /// Courses whose prerequisites the student has satisfied.
    pub prereqs_met: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct DecisionSummary {
    pub label: String,
    pub count: usize,
    pub avg_urgency: f64,
}
