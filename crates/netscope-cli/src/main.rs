//! Netscope CLI
//!
//! Command-line interface for the snapshot store:
//! - Running one reconciliation cycle from observation files
//! - Point-in-time and history queries
//! - Invariant verification and compaction

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use netscope_core::{
    max_sentinel, Clock, CycleJournal, NodeKind, ObservedNodeSource, ObservedOrganizationSource,
    OrganizationKind, SnapshotOrchestrator, SnapshotStore, Stores, SystemClock, TracingReporter,
};
use netscope_storage::Database;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod source;

use config::CliConfig;
use source::JsonFileSource;

#[derive(Parser)]
#[command(name = "netscope")]
#[command(author, version, about = "Netscope: versioned snapshots of network nodes and organizations")]
struct Cli {
    /// Configuration file (default: ./netscope.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store directory, overrides `[store] path`
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation cycle.
    ///
    /// Every node in the nodes file is recorded as seen at the cycle time
    /// before nodes, organizations and archival are reconciled.
    Cycle {
        /// JSON array of observed nodes
        #[arg(long)]
        nodes: PathBuf,
        /// JSON array of observed organizations
        #[arg(long)]
        organizations: Option<PathBuf>,
        /// Observation time (RFC 3339), defaults to now
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// List snapshots valid at a point in time.
    Active {
        #[arg(long, value_enum)]
        kind: Kind,
        /// RFC 3339, defaults to now
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// List the snapshots of one identity within a time range.
    History {
        #[arg(long, value_enum)]
        kind: Kind,
        /// Public key or organization id
        #[arg(long)]
        key: String,
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,
    },

    /// Check history invariants; exits non-zero on any violation.
    Verify,

    /// Row counts and the latest cycle.
    Status,

    /// Checkpoint the store and truncate its write-ahead log.
    Compact,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Node,
    Organization,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected RFC 3339 time: {}", e))
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging.level);

    let store_path = cli.store.unwrap_or_else(|| config.store.path.clone());
    tracing::debug!(store = %store_path.display(), "using store");
    let db = Arc::new(
        Database::open(&store_path)
            .with_context(|| format!("opening store {}", store_path.display()))?,
    );

    match cli.command {
        Commands::Cycle {
            nodes,
            organizations,
            at,
        } => cmd_cycle(&config, db, nodes, organizations, at),
        Commands::Active { kind, at } => cmd_active(&db, kind, at),
        Commands::History {
            kind,
            key,
            from,
            to,
        } => cmd_history(&db, kind, &key, from, to),
        Commands::Verify => cmd_verify(&db),
        Commands::Status => cmd_status(&db),
        Commands::Compact => cmd_compact(&db),
    }
}

fn cmd_cycle(
    config: &CliConfig,
    db: Arc<Database>,
    nodes: PathBuf,
    organizations: Option<PathBuf>,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let time = at.unwrap_or_else(|| SystemClock.now());
    let source = JsonFileSource::new(nodes, organizations);
    let observed_nodes = source.observe_nodes()?;
    let observed_organizations = source.observe_organizations()?;

    db.record_activity(
        observed_nodes
            .iter()
            .map(|n| &n.public_key)
            .filter(|k| !k.trim().is_empty()),
        time,
    )?;

    let orchestrator = SnapshotOrchestrator::new(
        &config.snapshot,
        Stores::shared(db),
        Arc::new(netscope_core::FixedClock(time)),
        Arc::new(TracingReporter),
    );
    let report = orchestrator.run_cycle(&observed_nodes, &observed_organizations)?;

    if report.failures.is_empty() {
        eprintln!("{} cycle {}", "ok".green().bold(), report.sequence);
    } else {
        eprintln!(
            "{} cycle {} completed with {} failures",
            "warning:".yellow().bold(),
            report.sequence,
            report.failures.len()
        );
    }
    print_json(&report)
}

fn cmd_active(db: &Database, kind: Kind, at: Option<DateTime<Utc>>) -> Result<()> {
    let at = at.unwrap_or_else(|| SystemClock.now());
    match kind {
        Kind::Node => print_json(&SnapshotStore::<NodeKind>::find_active_at(db, at)?),
        Kind::Organization => {
            print_json(&SnapshotStore::<OrganizationKind>::find_active_at(db, at)?)
        }
    }
}

fn cmd_history(
    db: &Database,
    kind: Kind,
    key: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    let from = from.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let to = to.unwrap_or_else(max_sentinel);
    if to < from {
        bail!("--to {} is before --from {}", to, from);
    }
    let key = key.to_string();
    match kind {
        Kind::Node => print_json(&SnapshotStore::<NodeKind>::find_for_identity_between(
            db, &key, from, to,
        )?),
        Kind::Organization => print_json(
            &SnapshotStore::<OrganizationKind>::find_for_identity_between(db, &key, from, to)?,
        ),
    }
}

fn cmd_verify(db: &Database) -> Result<()> {
    let violations = db.verify();
    if violations.is_empty() {
        eprintln!("{} no invariant violations", "ok".green().bold());
        return Ok(());
    }
    for v in &violations {
        eprintln!("{} {} {}: {}", "violation:".red().bold(), v.kind, v.key, v.problem);
    }
    bail!("{} invariant violations", violations.len())
}

#[derive(Serialize)]
struct Status {
    store: PathBuf,
    #[serde(flatten)]
    stats: netscope_storage::DatabaseStats,
    latest_cycle: Option<netscope_core::CycleRecord>,
}

fn cmd_status(db: &Database) -> Result<()> {
    let status = Status {
        store: db.path().to_path_buf(),
        stats: db.stats()?,
        latest_cycle: db.latest_cycle()?,
    };
    if let Some(cycle) = &status.latest_cycle {
        if !cycle.completed {
            eprintln!(
                "{} cycle {} at {} did not complete",
                "warning:".yellow().bold(),
                cycle.sequence,
                cycle.observed_at
            );
        }
    }
    print_json(&status)
}

fn cmd_compact(db: &Database) -> Result<()> {
    let before = db.stats()?;
    db.checkpoint()?;
    eprintln!(
        "{} checkpoint written, WAL {} -> {} bytes",
        "ok".green().bold(),
        before.wal_bytes,
        db.stats()?.wal_bytes
    );
    Ok(())
}
