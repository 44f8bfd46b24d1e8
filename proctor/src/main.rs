//! Proctor - process-level acceptance test runner
//!
//! Loads scenario plans written in TOML and runs each scenario against the
//! real binaries they name, reporting one PASS/FAIL line per scenario.

#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proctor_common::{HarnessConfig, PlanFile, ScenarioReport};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "proctor")]
#[command(author, version, about = "Acceptance scenarios for command-line tools and services")]
struct Cli {
    /// Harness configuration file (TOML)
    #[arg(short, long, global = true, env = "PROCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scenario in the given plans
    Run {
        #[arg(required = true)]
        plans: Vec<PathBuf>,

        /// Continue with later plans after a failing scenario
        #[arg(short, long)]
        keep_going: bool,

        /// Only run scenarios whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,

        /// Append one JSON report line per scenario to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Parse and validate plans without running them
    Validate {
        #[arg(required = true)]
        plans: Vec<PathBuf>,
    },
    /// Print the resolved harness configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = HarnessConfig::resolve(cli.config.as_deref())
        .context("Failed to resolve harness configuration")?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(&config.log_level)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Command::Run {
            plans,
            keep_going,
            filter,
            report,
        } => run(
            &config,
            &plans,
            keep_going,
            filter.as_deref(),
            report.as_deref(),
        ),
        Command::Validate { plans } => validate(&plans),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(path: &Path) -> Result<PlanFile> {
    PlanFile::load(path).with_context(|| format!("Invalid plan {}", path.display()))
}

fn validate(plans: &[PathBuf]) -> Result<ExitCode> {
    let mut invalid = 0;
    for path in plans {
        match load(path) {
            Ok(plan) => println!("OK    {} ({} scenarios)", path.display(), plan.scenarios.len()),
            Err(e) => {
                invalid += 1;
                println!("ERROR {}: {e:#}", path.display());
            }
        }
    }
    Ok(if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run(
    config: &HarnessConfig,
    plans: &[PathBuf],
    keep_going: bool,
    filter: Option<&str>,
    report_path: Option<&Path>,
) -> Result<ExitCode> {
    let mut report_file = report_path
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open report file {}", path.display()))
        })
        .transpose()?;
    let mut passed = 0usize;
    let mut failed = 0usize;

    'plans: for path in plans {
        let plan = load(path)?;
        info!("Running {} ({} scenarios)", path.display(), plan.scenarios.len());

        for scenario in &plan.scenarios {
            if let Some(filter) = filter
                && !scenario.name.contains(filter)
            {
                debug!(scenario = %scenario.name, "Skipped by filter");
                continue;
            }

            let report = scenario
                .execute(config)
                .with_context(|| format!("Failed to set up scenario '{}'", scenario.name))?;
            print_report(&report);
            if let Some(file) = report_file.as_mut() {
                writeln!(file, "{}", serde_json::to_string(&report)?)?;
            }
            if report.passed() {
                passed += 1;
            } else {
                failed += 1;
                if !keep_going {
                    break 'plans;
                }
            }
        }
    }

    println!("\n{passed} passed, {failed} failed");
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &ScenarioReport) {
    let status = if report.passed() { "PASS" } else { "FAIL" };
    let elapsed_ms = report.elapsed().num_milliseconds();
    println!("{status}  {} ({elapsed_ms} ms)", report.scenario);

    for step in report.failed_steps() {
        println!("      step: {}", step.description);
        if let Some(error) = &step.error {
            for line in error.lines() {
                println!("        {line}");
            }
        }
    }
    for failure in &report.cleanup.failures {
        println!("      warning: {failure}");
    }
}
