use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use tabled::{settings::Style, Table, Tabled};

use hrrs::calibration::{calibrate, CalibrationSettings};
use hrrs::config::{AppConfig, HrrConfig};
use hrrs::database::Database;
use hrrs::logging::{init_logging, LogLevel};
use hrrs::models::{HrSample, RecoveryInterval, SessionSamples};
use hrrs::pipeline::{BatchSummary, SessionProcessor};

/// hrrs - Heart-rate recovery interval detection
///
/// Finds recovery intervals in per-second heart-rate recordings, fits
/// exponential decay curves over fixed windows and stores quality-gated
/// HRR features.
#[derive(Parser)]
#[command(name = "hrrs")]
#[command(author = "hrrs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Heart-rate recovery interval detection", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the database path from the config file
    #[arg(short, long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and store recovery intervals
    Process {
        /// Only this session (default: all sessions)
        #[arg(short, long)]
        session: Option<String>,

        /// Run detection without writing results
        #[arg(long)]
        dry_run: bool,

        /// Stored threshold set to use instead of the active one
        #[arg(short = 't', long)]
        threshold_version: Option<String>,
    },

    /// Derive thresholds from recorded sessions
    Calibrate {
        /// Sessions to calibrate on (default: all sessions)
        #[arg(short, long)]
        session: Vec<String>,

        /// Make the new threshold set the active one
        #[arg(long)]
        activate: bool,

        /// Also write the full calibration result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import heart-rate samples from CSV (timestamp,heart_rate_bpm)
    Import {
        /// Session id to store the samples under
        #[arg(short, long)]
        session: String,

        /// Input CSV file
        #[arg(short, long)]
        file: PathBuf,

        /// Resting heart rate reference for the session
        #[arg(short, long)]
        resting_hr: Option<f64>,
    },

    /// Show stored intervals of a session
    Show {
        #[arg(short, long)]
        session: String,
    },

    /// Inspect and activate stored threshold sets
    Thresholds {
        #[command(subcommand)]
        action: ThresholdAction,
    },

    /// Manage the application config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ThresholdAction {
    /// List stored threshold sets
    List,
    /// Make a stored threshold set active
    Activate { version: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Intervals")]
    detected: usize,
    #[tabled(rename = "Pass")]
    passed: usize,
    #[tabled(rename = "Flagged")]
    flagged: usize,
    #[tabled(rename = "Rejected")]
    rejected: usize,
    #[tabled(rename = "Re-anchored")]
    reanchored: usize,
}

#[derive(Tabled)]
struct IntervalRow {
    #[tabled(rename = "#")]
    order: usize,
    #[tabled(rename = "Peak")]
    peak: String,
    #[tabled(rename = "Peak HR")]
    peak_hr: String,
    #[tabled(rename = "Trough HR")]
    trough_hr: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "HRR60")]
    hrr60: String,
    #[tabled(rename = "Best R²")]
    best_r2: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Method")]
    method: String,
    #[tabled(rename = "Flags")]
    flags: String,
}

impl From<&RecoveryInterval> for IntervalRow {
    fn from(interval: &RecoveryInterval) -> Self {
        let optional = |value: Option<f64>, precision: usize| {
            value.map_or_else(|| "-".to_string(), |v| format!("{:.*}", precision, v))
        };

        Self {
            order: interval.interval_order,
            peak: interval.peak_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            peak_hr: format!("{:.0}", interval.peak_hr),
            trough_hr: format!("{:.0}", interval.trough_hr),
            duration: format!("{}s", interval.duration_seconds),
            hrr60: optional(interval.hrr_value(60), 1),
            best_r2: optional(interval.best_r_squared(), 3),
            status: interval.quality_status.to_string(),
            method: interval.detection_method.to_string(),
            flags: interval
                .quality_flags
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Pick the threshold set for a run: explicit version, then the config
/// file's pinned version, then the active stored set, then the file's own
/// `[hrr]` table
fn resolve_thresholds(app: &AppConfig, db: &Database, version: Option<&str>) -> Result<HrrConfig> {
    let version = version.or(app.threshold_version.as_deref());
    let stored = db
        .load_threshold_config(version)
        .context("Failed to load threshold set")?;
    Ok(stored.unwrap_or_else(|| app.hrr.clone()))
}

fn read_samples_csv(path: &Path) -> Result<Vec<HrSample>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let mut samples = Vec::new();
    for (line, record) in reader.deserialize::<HrSample>().enumerate() {
        let sample = record.with_context(|| format!("Invalid sample on data row {}", line + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

fn print_batch(summary: &BatchSummary) {
    let rows: Vec<SessionRow> = summary
        .sessions
        .iter()
        .map(|s| SessionRow {
            session: s.session_id.clone(),
            detected: s.detected,
            passed: s.passed,
            flagged: s.flagged,
            rejected: s.rejected,
            reanchored: s.reanchored,
        })
        .collect();

    if !rows.is_empty() {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    println!("{}", summary.to_string_pretty());

    for (session, error) in &summary.errors {
        println!("{} {}: {}", "✗".red(), session, error);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
    let mut app = AppConfig::load_or_default(&config_path)?;
    if let Some(database) = cli.database {
        app.database_path = database;
    }
    if cli.verbose > 0 {
        app.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&app.logging)?;

    match cli.command {
        Commands::Process {
            session,
            dry_run,
            threshold_version,
        } => {
            println!("{}", "Detecting recovery intervals...".green().bold());
            let db = Database::new(&app.database_path)
                .with_context(|| format!("Failed to open database: {}", app.database_path.display()))?;
            let thresholds = resolve_thresholds(&app, &db, threshold_version.as_deref())?;
            println!("  Threshold set: {}", thresholds.version);

            let mut processor = SessionProcessor::new(db, thresholds, app.batch.clone());
            let summary = match session {
                Some(id) => processor.process_sessions(&[id], dry_run)?,
                None => processor.process_all(dry_run)?,
            };

            print_batch(&summary);
            if summary.is_fully_successful() {
                println!("{}", "✓ Processing completed".green());
            } else {
                println!("{}", "⚠ Processing completed with errors".yellow());
            }
        }

        Commands::Calibrate {
            session,
            activate,
            output,
        } => {
            println!("{}", "Calibrating thresholds...".blue().bold());
            let mut db = Database::new(&app.database_path)
                .with_context(|| format!("Failed to open database: {}", app.database_path.display()))?;

            let ids = if session.is_empty() {
                db.list_session_ids()?
            } else {
                session
            };
            let sessions = ids
                .iter()
                .map(|id| db.fetch_samples(id))
                .collect::<std::result::Result<Vec<SessionSamples>, _>>()?;

            let base = resolve_thresholds(&app, &db, None)?;
            let result = calibrate(&sessions, &base, &CalibrationSettings::default())
                .context("Calibration failed")?;

            db.save_threshold_set(&result.thresholds, "calibration", activate)?;
            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&result)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }

            let t = &result.thresholds;
            println!("  Version: {}", result.version);
            println!("  allowed_rise: {:.2} bpm/s", t.allowed_rise);
            println!("  min_drop_abs: {:.2} bpm", t.min_drop_abs);
            println!("  min_peak_minus_rest: {:.2} bpm", t.min_peak_minus_rest);
            println!("  r2_threshold: {:.3}", t.r2_threshold);
            println!(
                "  Evidence: {} stable stretches, {} HRR60 pairs",
                result.diagnostics.noise.stretches, result.diagnostics.recovery_pairs
            );
            if activate {
                println!("{}", "✓ Threshold set saved and activated".blue());
            } else {
                println!("{}", "✓ Threshold set saved".blue());
            }
        }

        Commands::Import {
            session,
            file,
            resting_hr,
        } => {
            println!("{}", "Importing heart-rate samples...".green().bold());
            let samples = read_samples_csv(&file)?;
            let mut db = Database::new(&app.database_path)
                .with_context(|| format!("Failed to open database: {}", app.database_path.display()))?;
            let stored = db.store_session(&SessionSamples {
                session_id: session.clone(),
                samples,
                resting_hr,
            })?;
            println!("  Session: {}", session);
            println!("  Samples: {}", stored);
            println!("{}", "✓ Import completed successfully".green());
        }

        Commands::Show { session } => {
            let db = Database::new(&app.database_path)
                .with_context(|| format!("Failed to open database: {}", app.database_path.display()))?;
            let intervals = db.load_intervals(&session)?;
            if intervals.is_empty() {
                println!("{}", format!("No intervals stored for {}", session).yellow());
            } else {
                let rows: Vec<IntervalRow> = intervals.iter().map(IntervalRow::from).collect();
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }

        Commands::Thresholds { action } => {
            let mut db = Database::new(&app.database_path)
                .with_context(|| format!("Failed to open database: {}", app.database_path.display()))?;
            match action {
                ThresholdAction::List => {
                    for set in db.list_threshold_sets()? {
                        let marker = if set.active { "*".green().bold() } else { " ".normal() };
                        println!(
                            "{} {}  {}  {}",
                            marker,
                            set.version,
                            set.created_at.format("%Y-%m-%d %H:%M:%S"),
                            set.source.dimmed()
                        );
                    }
                }
                ThresholdAction::Activate { version } => {
                    db.activate_threshold_set(&version)?;
                    println!("{}", format!("✓ Activated {}", version).green());
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", format!("# {}", config_path.display()).dimmed());
                println!("{}", toml::to_string_pretty(&app)?);
            }
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists: {} (use --force to overwrite)",
                        config_path.display()
                    );
                }
                let mut fresh = AppConfig::default();
                fresh.save_to_file(&config_path)?;
                println!("{}", format!("✓ Wrote {}", config_path.display()).white());
            }
        },
    }

    Ok(())
}
