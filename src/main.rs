//! Strategist - multi-agent strategic research
//!
//! A CLI tool that fans a research question out to several model
//! providers, scores the evidence and merges the answers into a
//! consensus report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, no providers, failed analysis, etc.)

mod agent;
mod analysis;
mod cli;
mod config;
mod error;
mod models;
mod report;
mod workflow;

use agent::{AgentRuntime, ProviderRegistry};
use analysis::{ConsensusAggregator, ParallelTaskRunner};
use anyhow::{bail, Context, Result};
use cli::{Args, OutputFormat};
use config::{Config, StoreKind, DEFAULT_CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use models::AnalysisStatus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use workflow::{FileStore, Framework, MemoryStore, StateStore, WorkflowEngine};

/// How often the CLI polls analysis status.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Config is read before logging starts so `[general] verbose` applies
    let loaded = load_config(&args);
    let config_verbose = loaded
        .as_ref()
        .is_ok_and(|(config, _)| config.general.verbose);
    init_logging(args.log_level(config_verbose));

    info!("Strategist v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, loaded).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .strategist.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to add providers, pick a consensus method, and more.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the requested command. Returns the exit code.
async fn run(args: Args, loaded: Result<(Config, ConfigSource)>) -> Result<i32> {
    let start_time = Instant::now();

    let (mut config, source) = loaded?;
    source.log();
    config.merge_with_args(&args);
    config.validate()?;

    let engine = build_engine(&config)?;

    if args.health {
        let health = engine.health();
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(0);
    }

    if args.dry_run {
        return handle_dry_run(&engine, &args);
    }

    let handle = match args.resume {
        Some(ref id) => {
            if config.store.kind != StoreKind::File {
                bail!("--resume needs a file store; pass --state-dir or set [store] kind = \"file\"");
            }
            println!("🔁 Resuming analysis {}", id);
            engine.resume(id).await?
        }
        None => {
            println!("🔬 Researching: {}", args.query_text());
            println!("   Providers: {}", engine.health().providers.join(", "));
            println!("   Consensus: {}", engine.method());
            engine.start(args.query_text(), args.context_map()).await?
        }
    };
    let id = handle.analysis_id.clone();
    info!("Analysis id: {}", id);

    let snapshot = track_progress(&engine, &id, args.quiet).await?;

    if snapshot.status == AnalysisStatus::Failed {
        eprintln!("\n⛔ Analysis {} failed:", id);
        for err in &snapshot.errors {
            eprintln!("   - {}", err);
        }
        return Ok(1);
    }

    let output = engine.result(&id).await?;

    let format = args
        .format
        .unwrap_or_else(|| OutputFormat::from_config(&config.general.format));
    let path = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.general.output));
    report::write_report(&output, &path, format == OutputFormat::Json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    let consensus = &output.consensus;
    println!("\n📊 Analysis Summary:");
    println!(
        "   Models: {} contributed, {} failed",
        consensus.contributing_models(),
        consensus.failed_models()
    );
    println!("   Insights: {}", consensus.insights.len());
    println!("   Recommendations: {}", consensus.recommendations.len());
    println!(
        "   Consensus confidence: {:.0}%",
        consensus.consensus_confidence * 100.0
    );
    println!("   Data quality: {:.0}%", output.quality_score * 100.0);
    println!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());
    println!("\n✅ Analysis complete! Report saved to: {}", path.display());

    Ok(0)
}

/// Assemble the engine from configuration.
fn build_engine(config: &Config) -> Result<WorkflowEngine> {
    let runtime = AgentRuntime::new(&config.runtime).context("Failed to create agent runtime")?;
    let registry = ProviderRegistry::from_config(&config.providers, &runtime);
    if registry.is_empty() {
        warn!("No research providers are available; check api_key_env settings");
    } else {
        info!("{} research provider(s) available", registry.len());
    }

    let store: Arc<dyn StateStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => {
            let store = FileStore::open(&config.store.path).with_context(|| {
                format!("Failed to open state directory {}", config.store.path.display())
            })?;
            info!("Checkpointing analysis state to {}", store.dir().display());
            Arc::new(store)
        }
    };

    let runner = ParallelTaskRunner::new(Arc::new(runtime), Arc::new(registry));
    Ok(WorkflowEngine::new(store, runner)
        .with_method(config.consensus_method()?)
        .with_aggregator(ConsensusAggregator::new(config.consensus.max_items))
        .with_framework(Framework::from_config(&config.framework.segments)))
}

/// Handle --dry-run: print the research tasks, call nothing.
fn handle_dry_run(engine: &WorkflowEngine, args: &Args) -> Result<i32> {
    println!("\n🔍 Dry run: planning research tasks (no provider calls)...\n");

    let tasks = engine.plan_tasks("dry-run", args.query_text(), &args.context_map())?;
    println!("   {} task(s) would be dispatched:\n", tasks.len());
    for task in &tasks {
        println!("     🤖 {} -> {}", task.id, task.target);
    }
    if let Some(task) = tasks.first() {
        let mut keys: Vec<&String> = task.context.keys().collect();
        keys.sort();
        println!("\n   Context:");
        for key in keys {
            println!("     {}: {}", key, task.context[key]);
        }
    }

    println!("\n✅ Dry run complete. No provider calls were made.");
    Ok(0)
}

/// Poll the analysis until it finishes, drawing a progress bar.
async fn track_progress(
    engine: &WorkflowEngine,
    id: &str,
    quiet: bool,
) -> Result<workflow::StatusSnapshot> {
    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        Some(pb)
    };

    loop {
        let snapshot = engine.status(id).await?;
        if let Some(ref pb) = progress_bar {
            pb.set_position(snapshot.progress as u64);
            if let Some(stage) = snapshot.stage {
                pb.set_message(stage.to_string());
            }
        }
        if snapshot.status.is_terminal() {
            if let Some(pb) = progress_bar {
                pb.finish_with_message(snapshot.status.to_string());
            }
            return Ok(snapshot);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Where the configuration came from. Reported once logging is up.
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile,
    BuiltIn,
    Unreadable(anyhow::Error),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::Explicit(path) => info!("Loaded config from: {}", path.display()),
            ConfigSource::DefaultFile => info!("Loaded default config from {}", DEFAULT_CONFIG_FILE),
            ConfigSource::BuiltIn => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {:#}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigSource::BuiltIn)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(e))),
    }
}
