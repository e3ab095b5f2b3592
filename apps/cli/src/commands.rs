//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use repolore_core::bridge::{BridgeAgent, BridgeConfig};
use repolore_core::dimension_context::DimensionContext;
use repolore_core::orchestrator::{
    DimensionStatus, Orchestrator, PipelineConfig, RunInput, RunReport,
};
use repolore_shared::{
    AppConfig, MissingAgentPolicy, SessionId, default_dimensions, init_config, load_config,
};
use repolore_storage::Storage;
use tracing::{info, warn};

use crate::adapters::{CliTracker, ScanFile, ScanFileSupplier, StorageAggregator, StorageSink};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// repolore — bootstrap a project's knowledge base from scanner evidence.
#[derive(Parser)]
#[command(
    name = "repolore",
    version,
    about = "Run the dimension-by-dimension knowledge bootstrap over a project scan.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// `--on-missing-agent` values.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum MissingAgentArg {
    Ask,
    Degrade,
    Abort,
}

impl From<MissingAgentArg> for MissingAgentPolicy {
    fn from(arg: MissingAgentArg) -> Self {
        match arg {
            MissingAgentArg::Ask => Self::Ask,
            MissingAgentArg::Degrade => Self::Degrade,
            MissingAgentArg::Abort => Self::Abort,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over a pre-computed scan file.
    Run {
        /// Scan file (JSON) with project facts and per-dimension evidence.
        #[arg(long)]
        scan: PathBuf,

        /// Session id for the new run (defaults to a fresh one).
        #[arg(long, conflicts_with = "resume")]
        session: Option<String>,

        /// Resume a previous session from its last checkpoint.
        #[arg(long)]
        resume: Option<String>,

        /// What to do when no production agent is available.
        #[arg(long)]
        on_missing_agent: Option<MissingAgentArg>,

        /// Enable the bridge production agent regardless of config.
        #[arg(long)]
        agent: bool,

        /// Database path (overrides config).
        #[arg(long, env = "REPOLORE_DB")]
        db: Option<PathBuf>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the candidates persisted for a session.
    Candidates {
        #[arg(long)]
        session: String,

        #[arg(long, env = "REPOLORE_DB")]
        db: Option<PathBuf>,
    },

    /// Inspect saved checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Print the built-in dimension catalog.
    Dimensions,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// Print the saved Dimension Context of a session.
    Show {
        #[arg(long)]
        session: String,

        #[arg(long, env = "REPOLORE_DB")]
        db: Option<PathBuf>,
    },
    /// List sessions that have a checkpoint.
    List {
        #[arg(long, env = "REPOLORE_DB")]
        db: Option<PathBuf>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "repolore=info",
        1 => "repolore=debug",
        _ => "repolore=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            scan,
            session,
            resume,
            on_missing_agent,
            agent,
            db,
            json,
        } => {
            let opts = RunOptions {
                scan,
                session,
                resume,
                on_missing_agent,
                agent,
                db,
                json,
            };
            cmd_run(opts).await
        }
        Command::Candidates { session, db } => cmd_candidates(&session, db.as_deref()).await,
        Command::Checkpoint { action } => match action {
            CheckpointAction::Show { session, db } => {
                cmd_checkpoint_show(&session, db.as_deref()).await
            }
            CheckpointAction::List { db } => cmd_checkpoint_list(db.as_deref()).await,
        },
        Command::Dimensions => cmd_dimensions(),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

fn resolve_db(config: &AppConfig, flag: Option<&Path>) -> Result<PathBuf> {
    match flag {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(config.storage.resolve_db_path()?),
    }
}

fn parse_session(raw: &str) -> Result<SessionId> {
    raw.parse()
        .map_err(|e| eyre!("invalid session id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    scan: PathBuf,
    session: Option<String>,
    resume: Option<String>,
    on_missing_agent: Option<MissingAgentArg>,
    agent: bool,
    db: Option<PathBuf>,
    json: bool,
}

async fn cmd_run(opts: RunOptions) -> Result<()> {
    let mut config = load_config()?;
    if let Some(policy) = opts.on_missing_agent {
        config.pipeline.on_missing_agent = policy.into();
    }
    if opts.agent {
        config.agent.enabled = true;
    }

    let scan = ScanFile::load(&opts.scan)?;
    for orphan in scan.orphaned_evidence() {
        warn!(dimension = %orphan, "scan evidence for unknown dimension ignored");
    }
    let dimensions = scan.resolved_dimensions();

    let storage = Arc::new(Storage::open(&resolve_db(&config, opts.db.as_deref())?).await?);

    let (session, resume_from) = match opts.resume.as_deref() {
        Some(raw) => {
            let session = parse_session(raw)?;
            let checkpoint = storage
                .get_checkpoint(&session.to_string())
                .await?
                .ok_or_else(|| eyre!("no checkpoint saved for session {session}"))?;
            let context = DimensionContext::from_json(&checkpoint.snapshot_json)?;
            info!(%session, digests = context.digests().len(), "restored checkpoint");
            (session, Some(context))
        }
        None => match opts.session.as_deref() {
            Some(raw) => (parse_session(raw)?, None),
            None => (SessionId::new(), None),
        },
    };

    let mut input = RunInput::new(scan.project, dimensions);
    input.session = session;
    input.files = scan.files;
    input.targets = scan.targets;
    input.resume_from = resume_from;

    info!(
        session = %input.session,
        scan = %opts.scan.display(),
        dimensions = input.dimensions.len(),
        "starting run"
    );

    let agent = Arc::new(BridgeAgent::new(BridgeConfig::from(&config.agent)));
    let tracker = Arc::new(CliTracker::new(storage.clone(), opts.json));

    let orchestrator = Orchestrator::new(
        PipelineConfig::from(&config),
        Arc::new(ScanFileSupplier::new(scan.evidence)),
        Arc::new(StorageSink::new(storage.clone())),
    )
    .with_agent(agent.clone())
    .with_tracker(tracker.clone())
    .with_aggregator(Arc::new(StorageAggregator::new(storage.clone())));

    let report = orchestrator.run(input).await;
    agent.shutdown().await;
    tracker.finish();

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let path = report.path.map(|p| p.as_str()).unwrap_or("none");

    println!();
    println!("  Session:  {}", report.session);
    println!("  Path:     {path}");
    println!("  Outcome:  {}", report.outcome.as_str());
    println!("  Created:  {}", report.results.created);
    println!("  Failed:   {}", report.results.failed);
    println!(
        "  Time:     {:.1}s",
        std::time::Duration::from_millis(report.elapsed_ms).as_secs_f64()
    );
    println!();

    for dim in &report.dimensions {
        let status = match dim.status {
            DimensionStatus::Pending => "pending",
            DimensionStatus::Completed => "done",
            DimensionStatus::Failed => "failed",
            DimensionStatus::Skipped => "skipped",
        };
        let reason = dim
            .reason
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        println!(
            "  {:<24} {status:<8} signals={:<3} persisted={:<3}{}{reason}",
            dim.dim_id,
            dim.signals,
            dim.persisted,
            if dim.fallback { " fallback" } else { "" },
        );
    }

    if !report.aggregated.is_empty() {
        println!();
        println!("  Aggregated: {}", report.aggregated.join(", "));
    }

    if !report.results.errors.is_empty() {
        println!();
        println!("  Errors:");
        for err in &report.results.errors {
            match &err.sub_topic {
                Some(sub) => println!("    {} / {sub}: {}", err.dimension, err.error),
                None => println!("    {}: {}", err.dimension, err.error),
            }
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

async fn open_readonly(db: Option<&Path>) -> Result<Storage> {
    let config = load_config()?;
    Ok(Storage::open_readonly(&resolve_db(&config, db)?).await?)
}

async fn cmd_candidates(session: &str, db: Option<&Path>) -> Result<()> {
    let session = parse_session(session)?;
    let storage = open_readonly(db).await?;
    let candidates = storage.list_candidates(&session.to_string()).await?;

    if candidates.is_empty() {
        println!("No candidates for session {session}.");
        return Ok(());
    }

    for c in &candidates {
        println!("  [{}] {} / {} ({})", c.source, c.dimension_id, c.title, c.sub_topic);
        if !c.summary.is_empty() {
            println!("      {}", c.summary);
        }
    }
    println!();
    for (dimension, source, count) in storage.candidate_counts(&session.to_string()).await? {
        println!("  {dimension:<24} {source:<15} {count}");
    }
    Ok(())
}

async fn cmd_checkpoint_show(session: &str, db: Option<&Path>) -> Result<()> {
    let session = parse_session(session)?;
    let storage = open_readonly(db).await?;
    let checkpoint = storage
        .get_checkpoint(&session.to_string())
        .await?
        .ok_or_else(|| eyre!("no checkpoint saved for session {session}"))?;

    let context = DimensionContext::from_json(&checkpoint.snapshot_json)?;
    println!("  Session:  {session}");
    println!("  Project:  {}", context.project().name);
    println!("  Saved:    {}", checkpoint.updated_at.to_rfc3339());
    println!("  Candidates submitted: {}", context.submitted_candidates().len());
    println!();
    for (dim_id, stored) in context.digests() {
        println!("  {dim_id}: {}", stored.digest.summary);
        for gap in &stored.digest.gaps {
            println!("      gap: {gap}");
        }
    }
    Ok(())
}

async fn cmd_checkpoint_list(db: Option<&Path>) -> Result<()> {
    let storage = open_readonly(db).await?;
    let sessions = storage.list_checkpoints().await?;
    if sessions.is_empty() {
        println!("No checkpoints saved.");
    }
    for (session, updated_at) in sessions {
        println!("  {session}  {}", updated_at.to_rfc3339());
    }
    Ok(())
}

fn cmd_dimensions() -> Result<()> {
    for dim in default_dimensions() {
        let kind = match dim.output_kind() {
            repolore_shared::OutputKind::Candidates => "candidates",
            repolore_shared::OutputKind::DigestOnly => "digest-only",
            repolore_shared::OutputKind::Dual => "dual",
        };
        println!("  {:<24} {kind:<12} {}", dim.id, dim.label);
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "repolore",
            "-vv",
            "run",
            "--scan",
            "scan.json",
            "--on-missing-agent",
            "degrade",
            "--json",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                scan,
                on_missing_agent,
                json,
                agent,
                ..
            } => {
                assert_eq!(scan, PathBuf::from("scan.json"));
                assert!(matches!(on_missing_agent, Some(MissingAgentArg::Degrade)));
                assert!(json);
                assert!(!agent);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn session_and_resume_conflict() {
        let parsed = Cli::try_parse_from([
            "repolore", "run", "--scan", "s.json", "--session", "a", "--resume", "b",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn policy_flag_maps_to_config() {
        assert_eq!(
            MissingAgentPolicy::from(MissingAgentArg::Abort),
            MissingAgentPolicy::Abort
        );
    }

    #[test]
    fn bad_session_id_is_rejected() {
        assert!(parse_session("not-a-uuid").is_err());
        let id = SessionId::new();
        assert_eq!(parse_session(&id.to_string()).expect("valid"), id);
    }
}
