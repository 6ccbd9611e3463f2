use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{Duration, NaiveDate};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AttemptOutcome, ExamAttempt, ExamKind, HomeworkAttempt, Milestone, MilestoneKey,
    MilestoneOverride, OpenStatus, Registration, SentMessage, StudentRecords, Term, TermWeek,
    WELCOME_TOUCHPOINT,
};

/// Everything one nightly run reads, loaded up front.
#[derive(Debug)]
pub struct ScanData {
    pub term: Term,
    pub holidays: Vec<NaiveDate>,
    pub milestones: Vec<Milestone>,
    pub students: Vec<StudentRecords>,
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn load_scan_data(pool: &PgPool) -> anyhow::Result<ScanData> {
    let term = load_active_term(pool).await?;
    let holidays = load_holidays(pool, &term.key).await?;
    let milestones = load_milestones(pool, &term.key).await?;
    let students = load_students(pool, &term.key).await?;

    info!(
        term = %term.key,
        holidays = holidays.len(),
        milestones = milestones.len(),
        students = students.len(),
        "loaded scan data"
    );
    Ok(ScanData {
        term,
        holidays,
        milestones,
        students,
    })
}

async fn load_active_term(pool: &PgPool) -> anyhow::Result<Term> {
    let row = sqlx::query(
        "SELECT term_key, start_date, last_class_day FROM pace_cadence.terms WHERE active",
    )
    .fetch_optional(pool)
    .await?
    .context("no active term is configured; nothing to scan")?;

    let key: String = row.get("term_key");
    let weeks = sqlx::query(
        "SELECT week_nbr, monday FROM pace_cadence.term_weeks \
         WHERE term_key = $1 ORDER BY week_nbr",
    )
    .bind(&key)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|week| -> Result<TermWeek, EngineError> {
        let week_nbr: i32 = week.get("week_nbr");
        Ok(TermWeek {
            week_nbr: u32::try_from(week_nbr)
                .map_err(|_| EngineError::parse("week number", week_nbr.to_string()))?,
            monday: week.get("monday"),
        })
    })
    .collect::<Result<Vec<_>, EngineError>>()?;

    Ok(Term {
        key,
        start_date: row.get("start_date"),
        weeks,
        last_class_day: row.get("last_class_day"),
    })
}

async fn load_holidays(pool: &PgPool, term_key: &str) -> anyhow::Result<Vec<NaiveDate>> {
    let rows = sqlx::query("SELECT holiday FROM pace_cadence.holidays WHERE term_key = $1")
        .bind(term_key)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|row| row.get("holiday")).collect())
}

async fn load_milestones(pool: &PgPool, term_key: &str) -> anyhow::Result<Vec<Milestone>> {
    let rows = sqlx::query(
        "SELECT pace_track, ms_type, ms_nbr, ms_date, attempt_limit \
         FROM pace_cadence.milestones WHERE term_key = $1",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;

    let mut milestones = Vec::with_capacity(rows.len());
    for row in rows {
        let code: String = row.get("ms_type");
        let number: i32 = row.get("ms_nbr");
        match MilestoneKey::from_legacy(&code, number) {
            Ok(key) => milestones.push(Milestone {
                key,
                track: row.get("pace_track"),
                date: row.get("ms_date"),
                attempt_limit: attempt_limit(row.get("attempt_limit")),
            }),
            Err(err) => warn!("ignoring milestone row: {err}"),
        }
    }
    Ok(milestones)
}

fn attempt_limit(value: Option<i32>) -> Option<u32> {
    value.and_then(|limit| u32::try_from(limit).ok())
}

fn small(field: &'static str, value: i16) -> Result<u8, EngineError> {
    u8::try_from(value).map_err(|_| EngineError::parse(field, value.to_string()))
}

fn keep<T>(table: &str, student_id: &str, parsed: Result<T, EngineError>) -> Option<T> {
    match parsed {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(student_id, table, "ignoring row: {err}");
            None
        }
    }
}

async fn load_students(pool: &PgPool, term_key: &str) -> anyhow::Result<Vec<StudentRecords>> {
    let rows = sqlx::query(
        "SELECT st.student_id, s.full_name, s.licensed, st.do_not_disturb, st.pace_track \
         FROM pace_cadence.student_terms st \
         JOIN pace_cadence.students s ON s.student_id = st.student_id \
         WHERE st.term_key = $1 \
         ORDER BY st.student_id",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;

    let mut students: Vec<StudentRecords> = rows
        .iter()
        .map(|row| StudentRecords {
            student_id: row.get("student_id"),
            full_name: row.get("full_name"),
            licensed: row.get("licensed"),
            do_not_disturb: row.get("do_not_disturb"),
            track: row.get("pace_track"),
            ..StudentRecords::default()
        })
        .collect();
    let index: HashMap<String, usize> = students
        .iter()
        .enumerate()
        .map(|(position, student)| (student.student_id.clone(), position))
        .collect();

    let registrations = sqlx::query(
        "SELECT student_id, course, section, pace_order, open_status, completed, prereqs_met \
         FROM pace_cadence.registrations WHERE term_key = $1 ORDER BY student_id, course",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;
    for row in registrations {
        let student_id: String = row.get("student_id");
        let Some(&position) = index.get(&student_id) else {
            continue;
        };
        let parsed = (|| -> Result<Registration, EngineError> {
            let pace_order: Option<i16> = row.get("pace_order");
            Ok(Registration {
                course: row.get("course"),
                section: row.get("section"),
                pace_order: pace_order.map(|order| small("pace order", order)).transpose()?,
                open_status: OpenStatus::from_code(
                    row.get::<Option<String>, _>("open_status").as_deref(),
                )?,
                completed: row.get("completed"),
            })
        })();
        if let Some(registration) = keep("registrations", &student_id, parsed) {
            let student = &mut students[position];
            if row.get::<bool, _>("prereqs_met") {
                student.prereqs_met.insert(registration.course.clone());
            }
            student.registrations.push(registration);
        }
    }

    let exams = sqlx::query(
        "SELECT e.student_id, e.course, e.unit, e.exam_type, e.outcome, e.score, e.exam_date \
         FROM pace_cadence.exam_attempts e \
         JOIN pace_cadence.student_terms st ON st.student_id = e.student_id AND st.term_key = $1 \
         ORDER BY e.exam_date",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;
    for row in exams {
        let student_id: String = row.get("student_id");
        let Some(&position) = index.get(&student_id) else {
            continue;
        };
        let parsed = (|| -> Result<ExamAttempt, EngineError> {
            let unit: Option<i16> = row.get("unit");
            Ok(ExamAttempt {
                course: row.get("course"),
                unit: unit.map(|unit| small("exam unit", unit)).transpose()?,
                kind: row.get::<String, _>("exam_type").parse::<ExamKind>()?,
                outcome: row.get::<String, _>("outcome").parse::<AttemptOutcome>()?,
                score: row.get("score"),
                date: row.get("exam_date"),
            })
        })();
        if let Some(exam) = keep("exam_attempts", &student_id, parsed) {
            students[position].exams.push(exam);
        }
    }

    let homework = sqlx::query(
        "SELECT h.student_id, h.course, h.unit, h.objective, h.outcome, h.hw_date \
         FROM pace_cadence.homework_attempts h \
         JOIN pace_cadence.student_terms st ON st.student_id = h.student_id AND st.term_key = $1 \
         ORDER BY h.hw_date",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;
    for row in homework {
        let student_id: String = row.get("student_id");
        let Some(&position) = index.get(&student_id) else {
            continue;
        };
        let parsed = (|| -> Result<HomeworkAttempt, EngineError> {
            Ok(HomeworkAttempt {
                course: row.get("course"),
                unit: small("homework unit", row.get("unit"))?,
                objective: small("homework objective", row.get("objective"))?,
                outcome: row.get::<String, _>("outcome").parse::<AttemptOutcome>()?,
                date: row.get("hw_date"),
            })
        })();
        if let Some(attempt) = keep("homework_attempts", &student_id, parsed) {
            students[position].homework.push(attempt);
        }
    }

    let overrides = sqlx::query(
        "SELECT student_id, pace_track, ms_type, ms_nbr, ms_date, attempt_limit \
         FROM pace_cadence.student_milestones WHERE term_key = $1",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;
    for row in overrides {
        let student_id: String = row.get("student_id");
        let Some(&position) = index.get(&student_id) else {
            continue;
        };
        let code: String = row.get("ms_type");
        let parsed =
            MilestoneKey::from_legacy(&code, row.get("ms_nbr")).map(|key| MilestoneOverride {
                student_id: student_id.clone(),
                key,
                track: row.get("pace_track"),
                date: row.get("ms_date"),
                attempt_limit: attempt_limit(row.get("attempt_limit")),
            });
        if let Some(adjustment) = keep("student_milestones", &student_id, parsed) {
            students[position].overrides.push(adjustment);
        }
    }

    let messages = sqlx::query(
        "SELECT student_id, sent_date, touchpoint, message_code \
         FROM pace_cadence.sent_messages WHERE term_key = $1",
    )
    .bind(term_key)
    .fetch_all(pool)
    .await?;
    for row in messages {
        let student_id: String = row.get("student_id");
        if let Some(&position) = index.get(&student_id) {
            students[position].messages.push(SentMessage {
                date: row.get("sent_date"),
                touchpoint: row.get("touchpoint"),
                message_code: row.get("message_code"),
            });
        }
    }

    Ok(students)
}

pub async fn update_urgency(
    pool: &PgPool,
    term_key: &str,
    student_id: &str,
    urgency: i32,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE pace_cadence.student_terms
        SET urgency = $3, urgency_updated_at = NOW()
        WHERE student_id = $1 AND term_key = $2
        "#,
    )
    .bind(student_id)
    .bind(term_key)
    .bind(urgency)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let term_key = "SP26";
    let week_zero = NaiveDate::from_ymd_opt(2026, 1, 12).context("invalid date")?;
    let last_class_day = week_zero + Duration::days(15 * 7 + 4);

    sqlx::query(
        r#"
        INSERT INTO pace_cadence.terms (term_key, start_date, last_class_day, active)
        VALUES ($1, $2, $3, TRUE)
        ON CONFLICT (term_key) DO UPDATE
        SET start_date = EXCLUDED.start_date, last_class_day = EXCLUDED.last_class_day
        "#,
    )
    .bind(term_key)
    .bind(week_zero)
    .bind(last_class_day)
    .execute(pool)
    .await?;

    for week_nbr in 0..=15i32 {
        sqlx::query(
            r#"
            INSERT INTO pace_cadence.term_weeks (term_key, week_nbr, monday)
            VALUES ($1, $2, $3)
            ON CONFLICT (term_key, week_nbr) DO UPDATE SET monday = EXCLUDED.monday
            "#,
        )
        .bind(term_key)
        .bind(week_nbr)
        .bind(week_zero + Duration::weeks(i64::from(week_nbr)))
        .execute(pool)
        .await?;
    }

    let holidays = [
        NaiveDate::from_ymd_opt(2026, 1, 19).context("invalid date")?,
        NaiveDate::from_ymd_opt(2026, 3, 20).context("invalid date")?,
    ];
    for holiday in holidays {
        sqlx::query(
            r#"
            INSERT INTO pace_cadence.holidays (term_key, holiday)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(term_key)
        .bind(holiday)
        .execute(pool)
        .await?;
    }

    let first_teaching_day = week_zero + Duration::weeks(1);
    for pace in 1..=2u8 {
        let segment = 98 / i64::from(pace);
        for slot in 1..=pace {
            let start = first_teaching_day + Duration::days(segment * i64::from(slot - 1));
            let mut rows: Vec<(MilestoneKey, NaiveDate, Option<i32>)> = (1..=4u8)
                .map(|unit| {
                    (
                        MilestoneKey::review(pace, slot, unit),
                        start + Duration::days(segment * i64::from(unit) / 6),
                        None,
                    )
                })
                .collect();
            let final_due = start + Duration::days(segment * 5 / 6);
            rows.push((MilestoneKey::final_exam(pace, slot), final_due, None));
            rows.push((MilestoneKey::last_try(pace, slot), final_due + Duration::days(4), Some(1)));

            for (key, date, limit) in rows {
                sqlx::query(
                    r#"
                    INSERT INTO pace_cadence.milestones
                    (term_key, pace_track, ms_type, ms_nbr, ms_date, attempt_limit)
                    VALUES ($1, 'A', $2, $3, $4, $5)
                    ON CONFLICT (term_key, pace_track, ms_type, ms_nbr) DO UPDATE
                    SET ms_date = EXCLUDED.ms_date, attempt_limit = EXCLUDED.attempt_limit
                    "#,
                )
                .bind(term_key)
                .bind(key.kind.code())
                .bind(key.number())
                .bind(date)
                .bind(limit)
                .execute(pool)
                .await?;
            }
        }
    }

    // (id, name, licensed, track, registrations)
    // registration: (course, section, order, open status, completed)
    let students = vec![
        (
            "830000001",
            "Avery Lee",
            true,
            "A",
            vec![("M 117", "001", 1i16, Some("open"), false)],
        ),
        (
            "830000002",
            "Jules Moreno",
            true,
            "A",
            vec![
                ("M 117", "401", 1i16, Some("open"), true),
                ("M 118", "801", 2i16, Some("open"), false),
            ],
        ),
        (
            "830000003",
            "Kiara Patel",
            false,
            "A",
            vec![("M 117", "001", 1i16, None, false)],
        ),
        (
            "830000004",
            "Rowan Diaz",
            true,
            "D",
            vec![("M 117", "002", 1i16, Some("open"), false)],
        ),
    ];

    for (student_id, full_name, licensed, track, registrations) in students {
        sqlx::query(
            r#"
            INSERT INTO pace_cadence.students (student_id, full_name, licensed)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id) DO UPDATE
            SET full_name = EXCLUDED.full_name, licensed = EXCLUDED.licensed
            "#,
        )
        .bind(student_id)
        .bind(full_name)
        .bind(licensed)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO pace_cadence.student_terms (student_id, term_key, pace_track)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, term_key) DO UPDATE SET pace_track = EXCLUDED.pace_track
            "#,
        )
        .bind(student_id)
        .bind(term_key)
        .bind(track)
        .execute(pool)
        .await?;

        for (course, section, pace_order, open_status, completed) in registrations {
            sqlx::query(
                r#"
                INSERT INTO pace_cadence.registrations
                (student_id, term_key, course, section, pace_order, open_status,
                 completed, prereqs_met)
                VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
                ON CONFLICT (student_id, term_key, course) DO NOTHING
                "#,
            )
            .bind(student_id)
            .bind(term_key)
            .bind(course)
            .bind(section)
            .bind(pace_order)
            .bind(open_status)
            .bind(completed)
            .execute(pool)
            .await?;
        }
    }

    let exams = vec![
        ("seed-e1", "830000001", "M 117", Some(0i16), "review", "passed", None, (2026, 1, 23)),
        ("seed-e2", "830000001", "M 117", Some(1i16), "review", "failed", None, (2026, 2, 2)),
        ("seed-e3", "830000002", "M 117", Some(5i16), "final", "passed", Some(58), (2026, 2, 27)),
        ("seed-e4", "830000002", "M 118", Some(0i16), "review", "passed", None, (2026, 3, 3)),
    ];
    for (source_key, student_id, course, unit, exam_type, outcome, score, (y, m, d)) in exams {
        sqlx::query(
            r#"
            INSERT INTO pace_cadence.exam_attempts
            (id, student_id, course, unit, exam_type, outcome, score, exam_date, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(course)
        .bind(unit)
        .bind(exam_type)
        .bind(outcome)
        .bind(score)
        .bind(NaiveDate::from_ymd_opt(y, m, d).context("invalid date")?)
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    let existing: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM pace_cadence.sent_messages WHERE term_key = $1",
    )
    .bind(term_key)
    .fetch_one(pool)
    .await?
    .get("n");
    if existing == 0 {
        for student_id in ["830000001", "830000002"] {
            sqlx::query(
                r#"
                INSERT INTO pace_cadence.sent_messages
                (id, student_id, term_key, sent_date, touchpoint, message_code)
                VALUES ($1, $2, $3, $4, $5, 'WELCOME-1')
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(term_key)
            .bind(week_zero + Duration::days(8))
            .bind(WELCOME_TOUCHPOINT)
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

pub async fn import_exams_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: String,
        course: String,
        unit: Option<u8>,
        exam_type: String,
        outcome: String,
        score: Option<i32>,
        exam_date: NaiveDate,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let kind: ExamKind = row.exam_type.parse()?;
        row.outcome.parse::<AttemptOutcome>()?;
        if kind == ExamKind::UsersExam && row.unit.is_some() {
            anyhow::bail!("users exam rows carry no unit (student {})", row.student_id);
        }

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO pace_cadence.exam_attempts
            (id, student_id, course, unit, exam_type, outcome, score, exam_date, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.student_id)
        .bind(&row.course)
        .bind(row.unit.map(i16::from))
        .bind(row.exam_type.trim())
        .bind(row.outcome.trim())
        .bind(row.score)
        .bind(row.exam_date)
        .bind(source_key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to import exam for student {}", row.student_id))?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
