use std::fmt;

use serde::{Serialize, Serializer};

use crate::config::CadencePolicy;
use crate::models::{SentMessage, WELCOME_TOUCHPOINT};
use crate::status::CourseStatus;

/// The one outbound message a student gets this run, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CadenceDecision {
    NoMessage,
    Welcome,
    Blocked,
    OnTime,
    /// Late notice at tier 1 (mild) to 3 (most frequent).
    Late(u8),
}

impl CadenceDecision {
    pub fn is_message(self) -> bool {
        self != Self::NoMessage
    }
}

impl fmt::Display for CadenceDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMessage => f.write_str("no message"),
            Self::Welcome => f.write_str("welcome"),
            Self::Blocked => f.write_str("blocked"),
            Self::OnTime => f.write_str("on time"),
            Self::Late(tier) => write!(f, "late tier {tier}"),
        }
    }
}

impl Serialize for CadenceDecision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceInput {
    pub urgency: i32,
    pub blocked: bool,
    /// Weekdays since the latest message of any kind.
    pub days_since_message: i64,
}

impl From<&CourseStatus> for CadenceInput {
    fn from(status: &CourseStatus) -> Self {
        Self {
            urgency: status.urgency,
            blocked: status.blocked,
            days_since_message: status.days_since_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CadenceOutcome {
    pub decision: CadenceDecision,
    /// Urgency to write back to the student's term record.
    pub persist_urgency: Option<i32>,
    pub days_ago: Option<i64>,
}

/// Picks the message tier. Welcome and blocked notices preempt everything
/// and leave the stored urgency untouched.
pub fn decide(
    input: CadenceInput,
    messages: &[SentMessage],
    policy: &CadencePolicy,
) -> CadenceOutcome {
    let welcomed = messages.iter().any(|m| m.touchpoint == WELCOME_TOUCHPOINT);
    if !welcomed {
        return CadenceOutcome {
            decision: CadenceDecision::Welcome,
            persist_urgency: None,
            days_ago: None,
        };
    }
    if input.blocked {
        return CadenceOutcome {
            decision: CadenceDecision::Blocked,
            persist_urgency: None,
            days_ago: None,
        };
    }

    let days_ago = input.days_since_message;
    let decision = if input.urgency < 1 && days_ago > policy.on_time_gap {
        CadenceDecision::OnTime
    } else {
        late_tier(input.urgency, days_ago, policy)
    };

    CadenceOutcome {
        decision,
        persist_urgency: Some(input.urgency),
        days_ago: Some(days_ago),
    }
}

fn late_tier(urgency: i32, days_ago: i64, policy: &CadencePolicy) -> CadenceDecision {
    let band = policy
        .tiers
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.max_urgency.map_or(true, |max| urgency <= max));

    match band {
        Some((index, rule)) if days_ago > rule.min_gap => CadenceDecision::Late(index as u8 + 1),
        _ => CadenceDecision::NoMessage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn message(touchpoint: &str) -> SentMessage {
        SentMessage {
            date: NaiveDate::from_ymd_opt(2026, 2, 2).unwrap(),
            touchpoint: touchpoint.to_string(),
            message_code: format!("{touchpoint}-1"),
        }
    }

    fn welcomed() -> Vec<SentMessage> {
        vec![message(WELCOME_TOUCHPOINT), message("RE1")]
    }

    fn input(urgency: i32, days_since_message: i64) -> CadenceInput {
        CadenceInput {
            urgency,
            blocked: false,
            days_since_message,
        }
    }

    fn decision(urgency: i32, days_ago: i64) -> CadenceDecision {
        decide(input(urgency, days_ago), &welcomed(), &CadencePolicy::default()).decision
    }

    #[test]
    fn welcome_comes_first_and_only_once() {
        let policy = CadencePolicy::default();
        let mut blocked = input(12, 100);
        blocked.blocked = true;

        let outcome = decide(blocked, &[message("RE1")], &policy);
        assert_eq!(outcome.decision, CadenceDecision::Welcome);
        assert_eq!(outcome.persist_urgency, None);

        for urgency in 0..20 {
            for days_ago in [0, 5, 100] {
                let outcome = decide(input(urgency, days_ago), &welcomed(), &policy);
                assert_ne!(outcome.decision, CadenceDecision::Welcome);
            }
        }
    }

    #[test]
    fn blocked_students_always_get_the_blocked_notice() {
        let policy = CadencePolicy::default();
        for (urgency, days_ago) in [(0, 0), (0, 50), (3, 6), (20, 1)] {
            let mut facts = input(urgency, days_ago);
            facts.blocked = true;
            assert_eq!(decide(facts, &welcomed(), &policy).decision, CadenceDecision::Blocked);
        }
    }

    #[test]
    fn on_schedule_students_hear_from_us_after_a_quiet_week() {
        assert_eq!(decision(0, 5), CadenceDecision::OnTime);
        assert_eq!(decision(0, 4), CadenceDecision::NoMessage);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(decision(2, 7), CadenceDecision::NoMessage);
        assert_eq!(decision(2, 8), CadenceDecision::Late(1));
        assert_eq!(decision(3, 5), CadenceDecision::NoMessage);
        assert_eq!(decision(3, 6), CadenceDecision::Late(2));
        assert_eq!(decision(5, 3), CadenceDecision::NoMessage);
        assert_eq!(decision(5, 4), CadenceDecision::Late(3));
    }

    #[test]
    fn urgency_is_persisted_once_past_the_preemptive_notices() {
        let outcome = decide(input(3, 2), &welcomed(), &CadencePolicy::default());
        assert_eq!(outcome.decision, CadenceDecision::NoMessage);
        assert_eq!(outcome.persist_urgency, Some(3));
        assert_eq!(outcome.days_ago, Some(2));
    }
}
