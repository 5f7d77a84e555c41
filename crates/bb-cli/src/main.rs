//! `bb`: converge a fleet of machines onto a consistent set of git
//! working copies.
//!
//! This binary is a thin adapter: argument parsing, output rendering, and
//! exit-code mapping. Everything else lives in `bb-core`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use bb_core::notify::LogSink;
use bb_core::{Clock, SyncOptions, doctor, engine};
use bb_git::SystemGit;
use bb_state::StateStore;
use bb_types::MachineSnapshot;

#[derive(Parser)]
#[command(name = "bb", version, about = "Multi-machine git catalog fleet manager")]
struct Cli {
    /// State directory (defaults to ~/.bb).
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Observe local repositories, publish the snapshot, and converge
    /// toward the fleet winners.
    Sync {
        /// Operate only on these catalogs (repeatable).
        #[arg(long = "catalog", value_name = "NAME")]
        catalogs: Vec<String>,
        /// Push ahead branches even when auto-push is off.
        #[arg(long)]
        push: bool,
        /// Show what would happen without running mutating git commands.
        #[arg(long)]
        dry_run: bool,
        /// Skip the notification pass.
        #[arg(long)]
        no_notify: bool,
    },
    /// Show this machine's snapshot, refreshing it first when stale.
    Status {
        /// Restrict to these catalogs (repeatable).
        #[arg(long = "catalog", value_name = "NAME")]
        catalogs: Vec<String>,
    },
    /// Check the health of the state directory and external tools.
    Doctor,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("bb: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("BB_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_store(cli: &Cli) -> Result<StateStore> {
    let root = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => StateStore::default_root().ok_or_else(|| anyhow!("cannot locate home directory"))?,
    };
    Ok(StateStore::new(root))
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let store = resolve_store(cli)?;
    let git = SystemGit::locate().context("git is required")?;
    let clock = Clock::system();

    match &cli.command {
        Command::Sync {
            catalogs,
            push,
            dry_run,
            no_notify,
        } => {
            let opts = SyncOptions {
                include: catalogs.clone(),
                push: *push,
                dry_run: *dry_run,
                notify: !no_notify,
                ..SyncOptions::default()
            };
            let outcome = engine::sync(&store, &git, &clock, &LogSink, &opts)?;
            render_snapshot(&outcome.snapshot);
            Ok(ExitCode::from(outcome.exit_code as u8))
        }
        Command::Status { catalogs } => {
            let snapshot =
                engine::status(&store, &git, &clock, catalogs, Duration::from_secs(10))?;
            render_snapshot(&snapshot);
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => {
            let checks = doctor::run_doctor(&store, &clock)?;
            let mut failed = false;
            for check in &checks {
                let mark = if check.ok { "ok" } else { "FAIL" };
                println!("{mark:>4}  {:<24} {}", check.name, check.detail);
                failed |= !check.ok;
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn render_snapshot(snapshot: &MachineSnapshot) {
    println!(
        "machine {} ({}): {} repositories",
        snapshot.machine_id,
        snapshot.hostname,
        snapshot.repos.len()
    );
    for record in &snapshot.repos {
        if record.syncable {
            println!("  ok    {:<40} {}", record.repo_key, record.branch);
        } else {
            let reasons: Vec<&str> = record
                .unsyncable_reasons
                .iter()
                .map(|r| r.as_str())
                .collect();
            println!(
                "  !!    {:<40} {} [{}]",
                record.repo_key,
                record.branch,
                reasons.join(", ")
            );
        }
    }
}
