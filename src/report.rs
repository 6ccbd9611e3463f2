use std::collections::HashMap;
use std::fmt::Write;

use crate::behind::{DaysBehindReport, GATE_NOT_MET, NOT_STARTED};
use crate::config::EngineConfig;
use crate::models::DecisionSummary;
use crate::scan::{push_grouped, ReviewGroups, ScanReport, StudentOutcome};

pub fn summarize_decisions(outcomes: &[StudentOutcome]) -> Vec<DecisionSummary> {
    let mut map: HashMap<String, (usize, i32)> = HashMap::new();

    for outcome in outcomes {
        let entry = map.entry(outcome.decision.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += outcome.urgency;
    }

    let mut summaries: Vec<DecisionSummary> = map
        .into_iter()
        .map(|(label, (count, total_urgency))| DecisionSummary {
            label,
            count,
            avg_urgency: if count == 0 {
                0.0
            } else {
                total_urgency as f64 / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    summaries
}

fn write_student_line(output: &mut String, outcome: &StudentOutcome) {
    let current = outcome
        .current
        .map(|milestone| milestone.to_string())
        .unwrap_or_else(|| "done".to_string());
    let last_message = match &outcome.last_message {
        Some(code) => format!(", last message {code}"),
        None => String::new(),
    };
    let _ = writeln!(
        output,
        "- {} ({}) at {} urgency {}, idle {} days{}{}",
        outcome.full_name,
        outcome.student_id,
        current,
        outcome.urgency,
        outcome.days_since_activity,
        last_message,
        if outcome.degraded { " [fallback schedule]" } else { "" }
    );
}

fn write_groups(output: &mut String, groups: &ReviewGroups<'_>) {
    for (instructor, courses) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "### {instructor}");
        for (course, sections) in courses {
            for (section, decisions) in sections {
                let _ = writeln!(output);
                let _ = writeln!(output, "#### {course} section {section}");
                for (decision, outcomes) in decisions {
                    let _ = writeln!(output, "{decision} ({}):", outcomes.len());
                    for outcome in outcomes {
                        write_student_line(output, outcome);
                    }
                }
            }
        }
    }
}

pub fn build_scan_report(report: &ScanReport, config: &EngineConfig, dry_run: bool) -> String {
    let summaries = summarize_decisions(&report.outcomes);
    let mut output = String::new();

    let _ = writeln!(output, "# Nightly Pace Cadence Report");
    let _ = writeln!(
        output,
        "Run {} for {}{}",
        report.run_id,
        report.today,
        if dry_run { " (dry run, urgency not stored)" } else { "" }
    );
    if report.canceled {
        let _ = writeln!(output, "The run was canceled; only fully evaluated students are listed.");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Decision Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No students evaluated.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} students (avg urgency {:.1})",
                summary.label, summary.count, summary.avg_urgency
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Messages For Review");
    let groups = report.review_groups(config);
    if groups.is_empty() {
        let _ = writeln!(output, "No messages queued for this run.");
    } else {
        write_groups(&mut output, &groups);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Skipped Students");
    if report.skipped.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for skip in report.skipped.iter() {
            let _ = writeln!(output, "- {}: {}", skip.student_id, skip.reason);
        }
    }

    output
}

pub fn build_epf_report(report: &ScanReport, config: &EngineConfig) -> String {
    let candidates = report.epf_candidates(config.epf_min_urgency);
    let mut output = String::new();

    let _ = writeln!(output, "# Early Performance Feedback");
    let _ = writeln!(
        output,
        "Students with urgency {} or higher as of {}",
        config.epf_min_urgency, report.today
    );

    if candidates.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No students meet the threshold.");
        return output;
    }

    let mut groups = ReviewGroups::new();
    for outcome in candidates {
        push_grouped(&mut groups, outcome, outcome.decision, config);
    }
    write_groups(&mut output, &groups);
    output
}

pub fn build_behind_report(report: &DaysBehindReport, min_days: i64) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Days Behind Report");
    let _ = writeln!(output, "As of {}", report.today);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Buckets");

    if report.buckets.is_empty() {
        let _ = writeln!(output, "No students in scope.");
    } else {
        for (days, ids) in report.buckets.iter() {
            let label = match *days {
                NOT_STARTED => "not started".to_string(),
                GATE_NOT_MET => "licensing gate not met".to_string(),
                0 => "on time".to_string(),
                days => format!("{days} days behind"),
            };
            let _ = writeln!(output, "- {label}: {} students", ids.len());
        }
    }

    let flagged = report.students_n_days_late(min_days);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Not Started, Gated, Or {min_days}+ Days Behind");
    if flagged.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for student_id in flagged {
            let _ = writeln!(output, "- {student_id}");
        }
    }

    if !report.skipped.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Skipped Students");
        for skip in report.skipped.iter() {
            let _ = writeln!(output, "- {}: {}", skip.student_id, skip.reason);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::CadenceDecision;
    use crate::status::CurrentMilestone;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn outcome(id: &str, decision: CadenceDecision, urgency: i32, section: &str) -> StudentOutcome {
        StudentOutcome {
            student_id: id.to_string(),
            full_name: format!("Student {id}"),
            course: "M 117".to_string(),
            section: section.to_string(),
            pace: 2,
            track: "A".to_string(),
            instructor: Some("Dr. Reyes".to_string()),
            current: Some(CurrentMilestone::Review(2)),
            urgency,
            total_score: 0,
            blocked: false,
            decision,
            persist_urgency: Some(urgency),
            days_since_activity: 3,
            days_since_message: Some(6),
            last_message: Some("LATE2-1".to_string()),
            degraded: false,
        }
    }

    fn scan_report() -> ScanReport {
        ScanReport {
            run_id: Uuid::nil(),
            today: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            outcomes: vec![
                outcome("s-1", CadenceDecision::Late(2), 4, "001"),
                outcome("s-2", CadenceDecision::Late(2), 3, "809"),
                outcome("s-3", CadenceDecision::NoMessage, 16, "401"),
            ],
            skipped: Vec::new(),
            canceled: false,
        }
    }

    #[test]
    fn decision_mix_counts_and_averages() {
        let summaries = summarize_decisions(&scan_report().outcomes);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].label, "late tier 2");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].avg_urgency, 3.5);
    }

    #[test]
    fn scan_report_groups_messages_by_section() {
        let text = build_scan_report(&scan_report(), &EngineConfig::default(), true);

        assert!(text.contains("dry run"));
        assert!(text.contains("### Dr. Reyes"));
        assert!(text.contains("#### M 117 section 001"));
        assert!(text.contains("#### M 117 section 401"));
        assert!(text.contains(
            "- Student s-2 (s-2) at RE2 urgency 3, idle 3 days, last message LATE2-1"
        ));
        assert!(!text.contains("Student s-3 (s-3)"));
    }

    #[test]
    fn epf_report_lists_only_highly_urgent_students() {
        let text = build_epf_report(&scan_report(), &EngineConfig::default());

        assert!(text.contains("urgency 15 or higher"));
        assert!(text.contains("Student s-3 (s-3)"));
        assert!(!text.contains("Student s-1 (s-1)"));
    }

    #[test]
    fn behind_report_labels_sentinel_buckets() {
        let mut buckets = BTreeMap::new();
        buckets.insert(NOT_STARTED, vec!["s-1".to_string()]);
        buckets.insert(0, vec!["s-2".to_string()]);
        buckets.insert(16, vec!["s-3".to_string()]);
        let report = DaysBehindReport {
            today: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            buckets,
            skipped: Vec::new(),
        };

        let text = build_behind_report(&report, 14);
        assert!(text.contains("- not started: 1 students"));
        assert!(text.contains("- 16 days behind: 1 students"));
        assert!(text.contains("- s-3"));
        assert!(!text.contains("- s-2\n"));
    }
}
