//! tuner-vts: conformance harness for tuner HAL implementations.
//!
//! Runs every named scenario against each device service instance and
//! prints one outcome per (service, scenario, configuration).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use tuner_vts::config::{load_config, HarnessConfig};
use tuner_vts::logging;
use tuner_vts::orchestrator::{prepare, run_services, ScenarioKind};
use tuner_vts::RunReport;

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;

/// tuner-vts - Conformance harness for tuner HAL implementations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: PathBuf,

    /// Device service instance to test (repeatable)
    #[arg(short, long = "service", default_value = "loopback")]
    services: Vec<String>,

    /// Only run scenarios whose name contains this text
    #[arg(long)]
    scenario: Option<String>,

    /// List scenarios and their resolved configuration counts, then exit
    #[arg(long)]
    list: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
    log_retention_days: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    // Command line takes precedence over the [logging] section
    let log_dir = if args.log_dir.to_string_lossy() != DEFAULT_LOG_DIR {
        args.log_dir.clone()
    } else {
        PathBuf::from(config.logging.log_dir.as_deref().unwrap_or(DEFAULT_LOG_DIR))
    };
    let retention_days = if args.log_retention_days != DEFAULT_RETENTION_DAYS {
        args.log_retention_days
    } else {
        config.logging.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS)
    };
    if let Err(e) = logging::init_logging(&log_dir, retention_days, args.verbose, config.logging.level.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(2);
    }

    info!("tuner-vts starting");
    info!("  Config: {}", args.config.display());
    info!("  Services: {}", args.services.join(", "));
    if let Some(filter) = &args.scenario {
        info!("  Scenario filter: {}", filter);
    }

    if args.list {
        return list(&config, args.scenario.as_deref());
    }

    let report = match run_services(&config, &args.services, args.scenario.as_deref()) {
        Ok(report) => report,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::from(2);
            }
        }
    } else {
        print_report(&report);
    }

    if report.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn list(config: &HarnessConfig, filter: Option<&str>) -> ExitCode {
    let connections = match prepare(config) {
        Ok(connections) => connections,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    for kind in ScenarioKind::ALL.into_iter().filter(|k| k.matches(filter)) {
        println!("{:<34} {} configuration(s)", kind.name(), kind.configurations(&connections));
    }
    ExitCode::SUCCESS
}

fn print_report(report: &RunReport) {
    for result in &report.results {
        let configuration = result
            .configuration
            .map(|c| format!("#{c}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<34} {:>4} {:>6}ms  {}",
            result.service, result.scenario, configuration, result.duration_ms, result.outcome
        );
    }
    println!(
        "\n{} passed, {} skipped, {} failed",
        report.passed(),
        report.skipped(),
        report.failed()
    );
}
