use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;

/// Engine configuration, typically parsed from TOML.
///
/// Every field has a default, so a missing file (or a partial one) yields the
/// production policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of scan worker threads. 0 = rayon default.
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default)]
    pub scoring: ScoringPolicy,
    #[serde(default)]
    pub cadence: CadencePolicy,
    /// Urgency at which a student lands on the early performance feedback list.
    #[serde(default = "default_epf_min_urgency")]
    pub epf_min_urgency: i32,
    /// Tracks that are never messaged (face-to-face sections).
    #[serde(default = "default_excluded_tracks")]
    pub excluded_tracks: BTreeSet<String>,
    #[serde(default)]
    pub instructors: Vec<InstructorAssignment>,
    /// Cross-listed sections reported under another section number.
    #[serde(default = "default_section_aliases")]
    pub section_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    /// Bonus for passing a unit review on time.
    #[serde(default = "default_review_bonus")]
    pub review_bonus: i32,
    #[serde(default = "default_base_max_score")]
    pub base_max_score: i32,
    #[serde(default = "default_passing_score")]
    pub passing_score: i32,
    /// Totals just under one of these (and not above the attainable maximum)
    /// are reported as MAX: the student can still raise their grade.
    #[serde(default = "default_ceiling_thresholds")]
    pub ceiling_thresholds: Vec<i32>,
    /// Starting urgency when a course's prerequisites are not satisfied.
    #[serde(default = "default_prereq_urgency")]
    pub prereq_urgency: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadencePolicy {
    /// Weekdays of silence after which an on-schedule student gets a nudge.
    #[serde(default = "default_on_time_gap")]
    pub on_time_gap: i64,
    /// Late tiers in order; the first whose urgency band matches decides.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierRule>,
    /// Stand-in gap for a student who has never been messaged.
    #[serde(default = "default_no_message_days")]
    pub no_message_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    /// Inclusive upper bound of the urgency band; `None` is unbounded.
    #[serde(default)]
    pub max_urgency: Option<i32>,
    /// Weekdays since the last message must exceed this.
    pub min_gap: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructorAssignment {
    pub pace: u8,
    pub track: String,
    pub name: String,
}

fn default_epf_min_urgency() -> i32 {
    15
}
fn default_excluded_tracks() -> BTreeSet<String> {
    ["D", "E"].into_iter().map(String::from).collect()
}
fn default_section_aliases() -> BTreeMap<String, String> {
    [("801", "401"), ("809", "401")]
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect()
}
fn default_review_bonus() -> i32 {
    3
}
fn default_base_max_score() -> i32 {
    60
}
fn default_passing_score() -> i32 {
    54
}
fn default_ceiling_thresholds() -> Vec<i32> {
    vec![62, 65]
}
fn default_prereq_urgency() -> i32 {
    5
}
fn default_on_time_gap() -> i64 {
    4
}
fn default_tiers() -> Vec<TierRule> {
    vec![
        TierRule {
            max_urgency: Some(2),
            min_gap: 7,
        },
        TierRule {
            max_urgency: Some(4),
            min_gap: 5,
        },
        TierRule {
            max_urgency: None,
            min_gap: 3,
        },
    ]
}
fn default_no_message_days() -> i64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            scoring: ScoringPolicy::default(),
            cadence: CadencePolicy::default(),
            epf_min_urgency: default_epf_min_urgency(),
            excluded_tracks: default_excluded_tracks(),
            instructors: Vec::new(),
            section_aliases: default_section_aliases(),
        }
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            review_bonus: default_review_bonus(),
            base_max_score: default_base_max_score(),
            passing_score: default_passing_score(),
            ceiling_thresholds: default_ceiling_thresholds(),
            prereq_urgency: default_prereq_urgency(),
        }
    }
}

impl Default for CadencePolicy {
    fn default() -> Self {
        Self {
            on_time_gap: default_on_time_gap(),
            tiers: default_tiers(),
            no_message_days: default_no_message_days(),
        }
    }
}

impl EngineConfig {
    /// Load config from the given path; defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let Some(path) = path else {
            debug!("no config file given, using defaults");
            return Ok(Self::default());
        };

        debug!(config_path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(content)?)
    }

    /// Instructor of record for a pace and track, if one is configured.
    pub fn instructor_for(&self, pace: u8, track: &str) -> Option<&str> {
        self.instructors
            .iter()
            .find(|assignment| assignment.pace == pace && assignment.track == track)
            .map(|assignment| assignment.name.as_str())
    }

    /// Section number a report groups under, after cross-listing.
    pub fn section_group<'a>(&'a self, section: &'a str) -> &'a str {
        self.section_aliases
            .get(section)
            .map(String::as_str)
            .unwrap_or(section)
    }

    pub fn is_excluded_track(&self, track: &str) -> bool {
        self.excluded_tracks.contains(track)
    }
}
