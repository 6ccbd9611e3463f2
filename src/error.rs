use thiserror::Error;

/// Errors raised by the deadline and cadence engine.
///
/// Everything here is scoped to a single student or a single term; the batch
/// turns per-student errors into skip records instead of aborting.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("term {0} has no business days")]
    EmptyCalendar(String),

    #[error("no first course for student {0}")]
    NoFirstCourse(String),

    #[error("student {student_id} has {count} registrations; pace must be 1 to 5")]
    InvalidPace { student_id: String, count: usize },

    #[error("no milestones configured for pace {pace} track {track}")]
    NoMilestones { pace: u8, track: String },

    #[error("no pace track recorded for student {0}")]
    MissingTrack(String),

    #[error("invalid milestone key {code} {number}")]
    InvalidMilestoneKey { code: String, number: i32 },

    #[error("unrecognized {field} value: {value}")]
    Parse { field: &'static str, value: String },

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl EngineError {
    pub(crate) fn parse(field: &'static str, value: impl Into<String>) -> Self {
        Self::Parse {
            field,
            value: value.into(),
        }
    }
}
