//! Governed turn pipeline CLI.
//!
//! Runs one turn at a time against a steward root (`steward.toml` plus the
//! `ledger/` directory), and offers replay and integrity checks over the
//! ledger it leaves behind.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use steward::consolidation::load_artifacts;
use steward::core::types::TurnOutcome;
use steward::exit_codes;
use steward::io::clock::SystemClock;
use steward::io::config::load_config;
use steward::io::executor::CommandExecutor;
use steward::io::init::{InitOptions, StewardPaths, init_root};
use steward::io::ledger::Ledger;
use steward::logging;
use steward::replay::audit_session;
use steward::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "steward",
    version,
    about = "Governed turn pipeline over an append-only ledger"
)]
struct Cli {
    /// Steward root holding `steward.toml` and `ledger/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ledger layout, a default `steward.toml`, and schema copies.
    Init {
        /// Overwrite existing config and schemas. Ledger streams are kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one governed turn and print the result as JSON.
    Turn {
        #[arg(long)]
        session: String,
        message: String,
    },
    /// Rebuild a session's liveness from the source streams.
    Replay {
        #[arg(long)]
        session: String,
    },
    /// Verify the hash chain of every stream.
    Verify,
    /// List artifacts created by consolidation.
    Artifacts,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = StewardPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Turn { session, message } => cmd_turn(&paths, &session, &message),
        Command::Replay { session } => cmd_replay(&paths, &session),
        Command::Verify => cmd_verify(&paths),
        Command::Artifacts => cmd_artifacts(&paths),
    }
}

fn cmd_init(paths: &StewardPaths, force: bool) -> Result<i32> {
    let paths = init_root(&paths.root, &InitOptions { force })?;
    println!("initialized {}", paths.root.display());
    Ok(exit_codes::OK)
}

fn cmd_turn(paths: &StewardPaths, session: &str, message: &str) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let ledger = open_ledger(paths)?;
    let executor = CommandExecutor::new(config.executor.command.clone());
    let clock = SystemClock;
    let supervisor = Supervisor::new(&ledger, &executor, &clock, config)?;

    let result = supervisor.process_turn(session, message);
    print_json(&result)?;
    Ok(match result.outcome {
        TurnOutcome::Success => exit_codes::OK,
        TurnOutcome::Degraded => exit_codes::DEGRADED,
        TurnOutcome::Error => exit_codes::INVALID,
    })
}

fn cmd_replay(paths: &StewardPaths, session: &str) -> Result<i32> {
    let ledger = open_ledger(paths)?;
    let replay = audit_session(&ledger, session)?;
    print_json(&replay)?;
    if replay.snapshot_mismatches.is_empty() {
        Ok(exit_codes::OK)
    } else {
        eprintln!(
            "cached liveness differs from replay for: {}",
            replay.snapshot_mismatches.join(", ")
        );
        Ok(exit_codes::INVALID)
    }
}

fn cmd_verify(paths: &StewardPaths) -> Result<i32> {
    let ledger = open_ledger(paths)?;
    let streams = ledger.streams()?.len();
    let broken = ledger.verify_all()?;
    if broken.is_empty() {
        println!("ok: {streams} streams verified");
        return Ok(exit_codes::OK);
    }
    for (stream, violations) in &broken {
        for violation in violations {
            println!("{stream}: {violation}");
        }
    }
    Ok(exit_codes::BROKEN_CHAIN)
}

fn cmd_artifacts(paths: &StewardPaths) -> Result<i32> {
    let ledger = open_ledger(paths)?;
    let artifacts = load_artifacts(&ledger)?;
    print_json(&artifacts)?;
    Ok(exit_codes::OK)
}

fn open_ledger(paths: &StewardPaths) -> Result<Ledger> {
    Ledger::open(&paths.ledger_dir)
        .with_context(|| format!("open ledger {}", paths.ledger_dir.display()))
}

/// Pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["steward", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["steward", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_turn_with_root() {
        let cli = Cli::parse_from([
            "steward",
            "--root",
            "/tmp/x",
            "turn",
            "--session",
            "s1",
            "hello there",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/x"));
        match cli.command {
            Command::Turn { session, message } => {
                assert_eq!(session, "s1");
                assert_eq!(message, "hello there");
            }
            _ => panic!("expected turn"),
        }
    }

    #[test]
    fn turn_requires_session() {
        assert!(Cli::try_parse_from(["steward", "turn", "hello"]).is_err());
    }
}
