//! Hierarchical task delegation and execution engine.
//!
//! Manages a task ledger (`.swarm/state/ledger.json`) worked by an
//! organization of identity-named workers under `.swarm/org/`. Each worker
//! claims tasks, drives a language model through adapter prompts, and reports
//! progress up the hierarchy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use swarm::core::identity::{decode, encode};
use swarm::core::task::LedgerStats;
use swarm::exit_codes;
use swarm::io::adapter::AdapterLoader;
use swarm::io::config::load_config;
use swarm::io::init::{InitOptions, SwarmPaths, init_workspace};
use swarm::io::ledger::Ledger;
use swarm::io::org::{materialize_org, scan_org};
use swarm::io::provider::{CommandProvider, LanguageModel};
use swarm::io::report_store::aggregate_reports;
use swarm::io::seed::{load_seed_file, seed_tasks};
use swarm::io::session::{checkpoint_uids, load_or_start_session};
use swarm::logging;
use swarm::looping::{LoopOptions, run_swarm};
use swarm::orchestrator::{ExecSettings, Orchestrator};

#[derive(Parser)]
#[command(
    name = "swarm",
    version,
    about = "Hierarchical task delegation and execution engine"
)]
struct Cli {
    /// Project root holding `.swarm/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// More log output on stderr (`-v` info, `-vv` debug); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.swarm/` with default config, a generic adapter and an empty ledger.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Add tasks from a JSON array of `{type, title, description, params}`.
    Seed { file: PathBuf },
    /// Run every worker until the ledger drains or Ctrl-C.
    Run,
    /// Print ledger task counts.
    Stats,
    /// Roll worker status up into manager reports and the overview.
    Report,
    /// Encode or decode identity tokens.
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    /// Inspect behavior definition files.
    Adapter {
        #[command(subcommand)]
        command: AdapterCommand,
    },
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Print the fields of a token.
    Decode { token: String },
    /// Print the token for a position.
    Encode {
        #[arg(long)]
        role: String,
        #[arg(long, default_value_t = 0)]
        subordinates: u32,
        #[arg(long, default_value_t = 1)]
        rank: u32,
        #[arg(long)]
        uid: u32,
    },
}

#[derive(Subcommand)]
enum AdapterCommand {
    /// Load `.swarm/adapters/<id>.json` and report schema or semantic errors.
    Validate { id: String },
    /// Show which adapter a task type resolves to.
    Resolve { task_type: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = SwarmPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Seed { file } => cmd_seed(&paths, &file),
        Command::Run => cmd_run(&paths),
        Command::Stats => cmd_stats(&paths),
        Command::Report => cmd_report(&paths),
        Command::Identity { command } => cmd_identity(command),
        Command::Adapter { command } => cmd_adapter(&paths, command),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.swarm_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_seed(paths: &SwarmPaths, file: &Path) -> Result<i32> {
    paths.ensure_initialized()?;
    let seeds = load_seed_file(file)?;
    let ledger = ledger_for(paths)?;
    let created = seed_tasks(&ledger, &AdapterLoader::new(&paths.adapters_dir), seeds)?;
    for task in &created {
        println!("{}\t{}\t{}\t{}", task.id, task.task_type, task.status, task.title);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &SwarmPaths) -> Result<i32> {
    paths.ensure_initialized()?;
    let cfg = load_config(&paths.config_path)?;
    let session = load_or_start_session(&paths.session_path, Utc::now())?;
    let uids = session.uid_counter();
    let org = materialize_org(&paths.org_dir, &cfg.hierarchy, &uids)?;
    checkpoint_uids(&paths.session_path, &uids)?;

    let ledger = Arc::new(Ledger::new(&paths.ledger_path).with_lock_stale(cfg.lock_stale()));
    let provider: Arc<dyn LanguageModel> = Arc::new(CommandProvider::from_config(&cfg));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&ledger),
        Arc::new(AdapterLoader::new(&paths.adapters_dir)),
        provider,
        &paths.outputs_dir,
        ExecSettings::from_config(&cfg),
    ));
    let options = LoopOptions {
        pause: cfg.loop_pause(),
        lease: Some(cfg.lease()),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let cancel = CancellationToken::new();
    let outcome = runtime.block_on(async {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling; in-flight tasks will be released");
                on_signal.cancel();
            }
        });
        run_swarm(orchestrator, &org, options, cancel.clone()).await
    })?;

    let tasks = ledger.tasks()?;
    let overview = aggregate_reports(&org, &tasks, &paths.overview_path, Utc::now())?;
    println!(
        "session {}: {} completed, {} failed attempts; overall progress {:.1}% ({}/{})",
        session.session_id,
        outcome.completed(),
        outcome.failed(),
        overview.total.progress_pct,
        overview.total.tasks_completed,
        overview.total.tasks_total,
    );

    if outcome.cancelled {
        return Ok(exit_codes::CANCELLED);
    }
    if LedgerStats::from_tasks(&tasks).failed > 0 {
        return Ok(exit_codes::TASKS_FAILED);
    }
    Ok(exit_codes::OK)
}

fn cmd_stats(paths: &SwarmPaths) -> Result<i32> {
    paths.ensure_initialized()?;
    let stats = ledger_for(paths)?.get_stats()?;
    println!("total:      {}", stats.total);
    println!("pending:    {}", stats.pending);
    println!("processing: {}", stats.processing);
    println!("completed:  {}", stats.completed);
    println!("failed:     {}", stats.failed);
    Ok(exit_codes::OK)
}

fn cmd_report(paths: &SwarmPaths) -> Result<i32> {
    paths.ensure_initialized()?;
    let org = scan_org(&paths.org_dir)?;
    let tasks = ledger_for(paths)?.tasks()?;
    let overview = aggregate_reports(&org, &tasks, &paths.overview_path, Utc::now())?;
    let json = serde_json::to_string_pretty(&overview).context("serialize overview")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_identity(command: IdentityCommand) -> Result<i32> {
    match command {
        IdentityCommand::Decode { token } => {
            let identity = decode(&token)?;
            println!("role:         {}", identity.role);
            println!("depth:        {}", identity.depth());
            println!("subordinates: {}", identity.subordinate_count);
            println!("sibling_rank: {}", identity.sibling_rank);
            println!("uid:          {}", identity.uid);
            if let Err(err) = identity.validate_shape() {
                println!("warning:      {err}");
            }
        }
        IdentityCommand::Encode {
            role,
            subordinates,
            rank,
            uid,
        } => {
            println!("{}", encode(&role, subordinates, rank, uid)?);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_adapter(paths: &SwarmPaths, command: AdapterCommand) -> Result<i32> {
    let loader = AdapterLoader::new(&paths.adapters_dir);
    match command {
        AdapterCommand::Validate { id } => {
            let adapter = loader.load(&id)?;
            println!(
                "{} {}: {} -> {} (max retries {})",
                adapter.id,
                adapter.version,
                adapter.initial_status(),
                adapter.success_status(),
                adapter.max_retries
            );
        }
        AdapterCommand::Resolve { task_type } => {
            let resolved = loader.resolve(&task_type);
            println!("{}\t{}", resolved.adapter.id, resolved.strategy.as_str());
        }
    }
    Ok(exit_codes::OK)
}

fn ledger_for(paths: &SwarmPaths) -> Result<Ledger> {
    let cfg = load_config(&paths.config_path)?;
    Ok(Ledger::new(&paths.ledger_path).with_lock_stale(cfg.lock_stale()))
}
