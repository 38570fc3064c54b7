//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Strategist - multi-agent strategic research with consensus scoring
///
/// Sends one research question to several model providers in parallel,
/// scores the evidence and merges the answers into a consensus report.
///
/// Examples:
///   strategist --query "Evaluate market entry for pergola manufacturer"
///   strategist -Q "Pergola pricing" --context industry="outdoor living" --method majority
///   strategist --query "..." --format json --output report.json
///   strategist --query "..." --dry-run
///   strategist --resume 3f2c... --state-dir .strategist/state
///   strategist --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Research question to analyze
    #[arg(
        short = 'Q',
        long,
        value_name = "TEXT",
        required_unless_present_any = ["init_config", "health", "resume"]
    )]
    pub query: Option<String>,

    /// Extra context for the agents, repeatable
    ///
    /// Example: --context industry="outdoor living" --context region=EU
    #[arg(long = "context", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub context: Vec<(String, String)>,

    /// Consensus strategy
    ///
    /// Overrides the [consensus] method from the config file.
    #[arg(long, value_name = "METHOD", env = "STRATEGIST_METHOD")]
    pub method: Option<MethodArg>,

    /// Similarity threshold for clustering or expert validation (0.0 - 1.0)
    #[arg(long, value_name = "RATIO")]
    pub similarity_threshold: Option<f64>,

    /// Output file path for the report
    ///
    /// Defaults to the [general] output from the config file.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .strategist.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "STRATEGIST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Per-call timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Checkpoint analysis state as JSON files in this directory
    #[arg(long, value_name = "DIR", env = "STRATEGIST_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Resume a checkpointed analysis by id
    ///
    /// Requires a file store (--state-dir or [store] kind = "file").
    #[arg(long, value_name = "ID", conflicts_with = "query")]
    pub resume: Option<String>,

    /// Print the engine health and configured providers, then exit
    #[arg(long)]
    pub health: bool,

    /// Dry run: show the research tasks without calling any provider
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .strategist.toml configuration file
    #[arg(long)]
    pub init_config: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parses the `[general] format` config value.
    pub fn from_config(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Markdown,
        }
    }
}

/// Consensus strategy names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MethodArg {
    /// Weight items by agent confidence
    Confidence,
    /// Keep items at least half of the agents agree on
    Majority,
    /// Group near-duplicate items
    Clustering,
    /// Keep items of the most confident agent that another agent confirms
    Expert,
}

impl MethodArg {
    /// Name used in the `[consensus]` config section.
    pub fn config_name(&self) -> &'static str {
        match self {
            MethodArg::Confidence => "confidence_based",
            MethodArg::Majority => "majority_vote",
            MethodArg::Clustering => "clustering_based",
            MethodArg::Expert => "expert_validation",
        }
    }
}

/// Parses `KEY=VALUE`.
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Query text, empty when not given (validated first).
    pub fn query_text(&self) -> &str {
        self.query.as_deref().unwrap_or("")
    }

    /// Context pairs as a map. Later pairs win on duplicate keys.
    pub fn context_map(&self) -> crate::models::ContextMap {
        self.context.iter().cloned().collect()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref query) = self.query {
            if query.trim().is_empty() {
                return Err("Query must not be empty".to_string());
            }
        }

        if let Some(threshold) = self.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err("Similarity threshold must be between 0.0 and 1.0".to_string());
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `config_verbose` is `[general] verbose` from the config file;
    /// `--quiet` still wins over it.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
