use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod behind;
mod cadence;
mod calendar;
mod config;
mod db;
mod error;
mod milestones;
mod models;
mod report;
mod scan;
mod selector;
mod status;

use calendar::BusinessCalendar;
use config::EngineConfig;
use milestones::MilestoneCatalog;
use scan::{ScanContext, ScanReport};

#[derive(Parser)]
#[command(name = "pace-cadence")]
#[command(about = "Nightly deadline and cadence engine for paced courses", long_about = None)]
struct Cli {
    /// Engine policy file (TOML); production defaults when omitted
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a realistic term, milestones and students
    Seed,
    /// Import exam attempts from a CSV file
    ImportExams {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the nightly scan and write the review report
    Scan {
        /// Evaluate as of this date instead of today
        #[arg(long)]
        today: Option<NaiveDate>,
        /// Skip the urgency write-back
        #[arg(long)]
        dry_run: bool,
        /// Also dump every decision as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        #[arg(long, default_value = "scan-report.md")]
        out: PathBuf,
    },
    /// Bucket students by days behind their configured deadlines
    Behind {
        #[arg(long)]
        today: Option<NaiveDate>,
        #[arg(long, default_value_t = 14)]
        min_days: i64,
        #[arg(long, default_value = "behind-report.md")]
        out: PathBuf,
    },
    /// List students for early performance feedback
    Epf {
        #[arg(long)]
        today: Option<NaiveDate>,
        #[arg(long, default_value = "epf-report.md")]
        out: PathBuf,
    },
}

fn evaluate(
    data: &db::ScanData,
    config: &EngineConfig,
    today: NaiveDate,
    cancel: &AtomicBool,
) -> anyhow::Result<ScanReport> {
    let calendar = BusinessCalendar::build(&data.term, &data.holidays)?;
    let catalog = MilestoneCatalog::new(data.milestones.clone());
    info!(
        term = %data.term.key,
        last_class_day = %data.term.last_class_day,
        business_days = calendar.len(),
        milestones = catalog.len(),
        "term loaded"
    );
    let context = ScanContext {
        term: &data.term,
        calendar: &calendar,
        catalog: &catalog,
        config,
        today,
    };
    Ok(scan::run_scan(&context, &data.students, cancel)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())
        .context("failed to load engine configuration")?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupt = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the students in flight");
            interrupt.store(true, Ordering::Relaxed);
        }
    });

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportExams { csv } => {
            let inserted = db::import_exams_csv(&pool, &csv).await?;
            println!("Inserted {inserted} exam attempts from {}.", csv.display());
        }
        Commands::Scan {
            today,
            dry_run,
            json,
            out,
        } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let data = db::load_scan_data(&pool).await?;
            let report = tokio::task::block_in_place(|| evaluate(&data, &config, today, &cancel))?;

            if dry_run {
                info!("dry run; urgency not stored");
            } else {
                let mut failures = 0usize;
                for (student_id, urgency) in report.urgency_updates() {
                    let stored =
                        db::update_urgency(&pool, &data.term.key, student_id, urgency).await;
                    if let Err(err) = stored {
                        warn!(student_id, urgency, "failed to store urgency: {err:#}");
                        failures += 1;
                    }
                }
                info!(failures, "urgency write-back finished");
            }

            std::fs::write(&out, report::build_scan_report(&report, &config, dry_run))?;
            if let Some(path) = json {
                let dump = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, dump)?;
                println!("Decisions written to {}.", path.display());
            }
            println!(
                "Evaluated {} students ({} messages queued, {} skipped). Report written to {}.",
                report.outcomes.len(),
                report.messages().count(),
                report.skipped.len(),
                out.display()
            );
        }
        Commands::Behind {
            today,
            min_days,
            out,
        } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let data = db::load_scan_data(&pool).await?;
            let catalog = MilestoneCatalog::new(data.milestones);
            let report = behind::DaysBehindReport::build(&data.students, &catalog, today);

            let flagged = report.students_n_days_late(min_days).len();
            std::fs::write(&out, report::build_behind_report(&report, min_days))?;
            println!(
                "{flagged} students not started, gated, or {min_days}+ days behind. \
                 Report written to {}.",
                out.display()
            );
        }
        Commands::Epf { today, out } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let data = db::load_scan_data(&pool).await?;
            let report = tokio::task::block_in_place(|| evaluate(&data, &config, today, &cancel))?;

            std::fs::write(&out, report::build_epf_report(&report, &config))?;
            println!(
                "{} students at urgency {} or higher. Report written to {}.",
                report.epf_candidates(config.epf_min_urgency).len(),
                config.epf_min_urgency,
                out.display()
            );
        }
    }

    Ok(())
}
