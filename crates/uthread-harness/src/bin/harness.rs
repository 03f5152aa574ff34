//! CLI entrypoint for the uthread stress harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uthread_core::SafetyLevel;
use uthread_harness::{RunSummary, Scenario, ScenarioParams, StressReport, StressRunner};

/// Stress tooling for the uthread runtime.
#[derive(Debug, Parser)]
#[command(name = "uthread-harness")]
#[command(about = "Stress scenarios for the uthread threading runtime")]
struct Cli {
    /// Log scenario progress at debug level.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Strict,
    Hardened,
    Both,
}

impl ModeArg {
    fn levels(self) -> &'static [SafetyLevel] {
        match self {
            Self::Strict => &[SafetyLevel::Strict],
            Self::Hardened => &[SafetyLevel::Hardened],
            Self::Both => &[SafetyLevel::Strict, SafetyLevel::Hardened],
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
            Self::Both => "strict+hardened",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available scenarios.
    List,
    /// Run scenarios and report the results.
    Run {
        /// Scenario to run; repeat for several. Defaults to all of them.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 1_000)]
        iterations: u64,
        #[arg(long, value_enum, default_value_t = ModeArg::Strict)]
        mode: ModeArg,
        /// Output report path (markdown); a JSON twin is written next to it.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .try_init();
}

fn resolve_scenarios(names: &[String]) -> Result<Vec<Scenario>, String> {
    if names.is_empty() {
        return Ok(Scenario::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| {
            Scenario::from_name(name).ok_or_else(|| format!("unknown scenario '{name}'"))
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::List => {
            for s in Scenario::ALL {
                println!("{:<16} {}", s.name(), s.describe());
            }
        }
        Command::Run {
            scenarios,
            threads,
            iterations,
            mode,
            report,
        } => {
            let scenarios = resolve_scenarios(&scenarios)?;
            if threads == 0 {
                return Err("--threads must be at least 1".into());
            }
            let params = ScenarioParams {
                threads,
                iterations,
            };

            let mut results = Vec::new();
            for &level in mode.levels() {
                let runner = StressRunner::new("stress", level, params);
                results.extend(runner.run(&scenarios));
            }

            let report_doc = StressReport {
                title: String::from("uthread Stress Report"),
                mode: mode.label().to_string(),
                timestamp: format!("{:?}", std::time::SystemTime::now()),
                threads,
                iterations,
                summary: RunSummary::from_results(results),
            };
            eprintln!(
                "Stress run complete: total={}, passed={}, failed={}",
                report_doc.summary.total, report_doc.summary.passed, report_doc.summary.failed
            );

            match report {
                Some(report_path) => {
                    eprintln!("Writing report to {}", report_path.display());
                    std::fs::write(&report_path, report_doc.to_markdown())?;
                    std::fs::write(report_path.with_extension("json"), report_doc.to_json())?;
                }
                None => println!("{}", report_doc.to_json()),
            }

            if !report_doc.summary.all_passed() {
                return Err("stress run failed".into());
            }
        }
    }

    Ok(())
}
