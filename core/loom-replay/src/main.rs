//! loom-replay: operator CLI for agent session event logs.
//!
//! ## Subcommands
//!
//! - `replay`: fold a JSONL log through the reducer and print a summary
//! - `check`: strict-mode regression check for recorded fixtures
//! - `classify`: show how an upstream failure would be categorised
//! - `snapshot-info`: validate and summarise a cached snapshot

mod logging;
mod replay;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use loom_core::classify_error;
use loom_core::config::{load_config, LoomConfig};
use loom_protocol::RunStatus;
use serde::Serialize;

use replay::ReplayOptions;

#[derive(Parser)]
#[command(name = "loom-replay")]
#[command(about = "Replay and inspect agent session event logs")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.loom/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay an event log in replay-only mode and print a JSON summary
    Replay {
        /// JSONL event log, one envelope per line
        #[arg(value_name = "LOG")]
        log: PathBuf,

        /// Treat the log as a run with this status (running, idle, completed, failed, stopped)
        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,

        /// Fail on the first reducer anomaly
        #[arg(long)]
        strict: bool,

        /// Write the replayed state as a snapshot
        #[arg(long, value_name = "PATH")]
        snapshot_out: Option<PathBuf>,
    },

    /// Apply a log against a strict reducer; exits non-zero on any anomaly
    Check {
        #[arg(value_name = "LOG")]
        log: PathBuf,
    },

    /// Classify an upstream failure message
    Classify {
        /// Machine-readable error subtype, if the agent sent one
        #[arg(long)]
        subtype: Option<String>,

        #[arg(value_name = "MESSAGE")]
        message: String,
    },

    /// Validate a snapshot document and print what it holds
    SnapshotInfo {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let _logging_guard = logging::init(cli.log_dir.as_deref());
    let config = load_cli_config(cli.config);

    let result = match cli.command {
        Commands::Replay {
            log,
            status,
            strict,
            snapshot_out,
        } => run_replay(
            &log,
            ReplayOptions {
                status,
                strict: strict || config.strict_reducer(),
                snapshot_out,
            },
        ),
        Commands::Check { log } => run_check(&log),
        Commands::Classify { subtype, message } => run_classify(subtype.as_deref(), &message),
        Commands::SnapshotInfo { path } => {
            replay::snapshot_info(&path).and_then(|info| print_json(&info))
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "loom-replay failed");
        std::process::exit(1);
    }
}

fn load_cli_config(path: Option<PathBuf>) -> LoomConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Using default config");
            LoomConfig::default()
        }
    }
}

fn parse_status(value: &str) -> Result<RunStatus, String> {
    RunStatus::from_str(value).ok_or_else(|| format!("unknown run status '{}'", value))
}

fn run_replay(path: &Path, options: ReplayOptions) -> Result<(), String> {
    let log = replay::read_log(path)?;
    if !log.failures.is_empty() {
        tracing::warn!(
            skipped = log.failures.len(),
            path = %path.display(),
            "Skipped unparseable event log lines"
        );
    }
    let summary = replay::replay(&log, &options)?;
    print_json(&summary)
}

fn run_check(path: &Path) -> Result<(), String> {
    let log = replay::read_log(path)?;
    let report = replay::check(&log);
    print_json(&report)?;
    if report.passed() {
        Ok(())
    } else {
        Err(format!(
            "{} anomalies in {}",
            report.failures.len(),
            path.display()
        ))
    }
}

#[derive(Serialize)]
struct Classification<'a> {
    category: &'static str,
    retryable: bool,
    forkable: bool,
    settings_section: Option<&'static str>,
    message: &'a str,
}

fn run_classify(subtype: Option<&str>, message: &str) -> Result<(), String> {
    let category = classify_error(subtype, message);
    print_json(&Classification {
        category: category.as_str(),
        retryable: category.retryable(),
        forkable: category.forkable(),
        settings_section: category.settings_section(),
        message,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| format!("Failed to render output: {}", e))?;
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn replay_arguments_parse() {
        let cli = Cli::try_parse_from([
            "loom-replay",
            "replay",
            "run.jsonl",
            "--status",
            "stopped",
            "--snapshot-out",
            "out.json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Replay {
                log,
                status,
                strict,
                snapshot_out,
            } => {
                assert_eq!(log, PathBuf::from("run.jsonl"));
                assert_eq!(status, Some(RunStatus::Stopped));
                assert!(!strict);
                assert_eq!(snapshot_out, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let result = Cli::try_parse_from(["loom-replay", "replay", "run.jsonl", "--status", "paused"]);
        assert!(result.is_err());
    }

    #[test]
    fn check_fails_on_anomalies() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("bad.jsonl");
        fs_err::write(&path, "{\"type\":\"mystery\",\"session_id\":\"run-1\"}\n").expect("write");
        assert!(run_check(&path).is_err());

        let good = temp_dir.path().join("good.jsonl");
        fs_err::write(&good, "{\"type\":\"user_message\",\"session_id\":\"run-1\",\"text\":\"hi\"}\n")
            .expect("write");
        assert!(run_check(&good).is_ok());
    }
}
