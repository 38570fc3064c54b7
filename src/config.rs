//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.strategist.toml` files.

use crate::agent::RetryPolicy;
use crate::analysis::aggregator::{
    ConsensusMethod, DEFAULT_MAX_ITEMS, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_VALIDATION_THRESHOLD,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".strategist.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Agent runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Research providers, one research task is created per entry.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Consensus settings.
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// State store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Analytical framework.
    #[serde(default)]
    pub framework: FrameworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            runtime: RuntimeConfig::default(),
            providers: default_providers(),
            consensus: ConsensusConfig::default(),
            store: StoreConfig::default(),
            framework: FrameworkConfig::default(),
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Default output format ("markdown" or "json").
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            format: default_format(),
        }
    }
}

fn default_output() -> String {
    "strategy_report.md".to_string()
}

fn default_format() -> String {
    "markdown".to_string()
}

/// Retry, timeout and connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard timeout for a single provider call.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum attempts per task, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Wait on HTTP 429 when no Retry-After header is present.
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_default_secs: u64,

    /// Concurrent outbound calls across all destinations.
    #[serde(default = "default_pool_max_connections")]
    pub pool_max_connections: usize,

    /// Concurrent outbound calls per destination host.
    #[serde(default = "default_pool_max_per_host")]
    pub pool_max_per_host: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_default_secs: default_rate_limit_secs(),
            pool_max_connections: default_pool_max_connections(),
            pool_max_per_host: default_pool_max_per_host(),
        }
    }
}

impl RuntimeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.backoff_initial_ms),
            max_backoff: Duration::from_millis(self.backoff_max_ms),
            rate_limit_default: Duration::from_secs(self.rate_limit_default_secs),
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    4000
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_rate_limit_secs() -> u64 {
    60
}

fn default_pool_max_connections() -> usize {
    10
}

fn default_pool_max_per_host() -> usize {
    5
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` (OpenAI, Perplexity, OpenRouter...).
    #[serde(rename = "openai")]
    OpenAi,
    /// Ollama `/api/chat`.
    Ollama,
}

/// One research provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name; used as the task target.
    pub name: String,

    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// Base URL of the API.
    pub url: String,

    /// Model identifier sent to the API.
    pub model: String,

    /// Environment variable holding the API key. Providers whose variable
    /// is unset are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// USD per 1000 tokens, used for cost estimates.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::OpenAi
}

fn default_temperature() -> f32 {
    0.3
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "ollama".to_string(),
            kind: ProviderKind::Ollama,
            url: "http://localhost:11434".to_string(),
            model: "llama3.2:latest".to_string(),
            api_key_env: None,
            temperature: default_temperature(),
            cost_per_1k_tokens: 0.0,
        },
        ProviderConfig {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            temperature: default_temperature(),
            cost_per_1k_tokens: 0.0006,
        },
        ProviderConfig {
            name: "perplexity".to_string(),
            kind: ProviderKind::OpenAi,
            url: "https://api.perplexity.ai".to_string(),
            model: "sonar".to_string(),
            api_key_env: Some("PERPLEXITY_API_KEY".to_string()),
            temperature: default_temperature(),
            cost_per_1k_tokens: 0.001,
        },
    ]
}

/// Consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// "confidence_based", "majority_vote", "clustering_based" or
    /// "expert_validation".
    #[serde(default = "default_method")]
    pub method: String,

    /// Word-overlap similarity above which two items share a cluster.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Word overlap another model must exceed to confirm an item of the
    /// most confident model (expert validation only).
    #[serde(default = "default_validation_threshold")]
    pub validation_threshold: f64,

    /// Maximum insights and recommendations kept in the consensus.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            similarity_threshold: default_similarity_threshold(),
            validation_threshold: default_validation_threshold(),
            max_items: default_max_items(),
        }
    }
}

fn default_method() -> String {
    "confidence_based".to_string()
}

fn default_similarity_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_validation_threshold() -> f64 {
    DEFAULT_VALIDATION_THRESHOLD
}

fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}

/// Where analysis state is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

/// State store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory for the file store.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".strategist/state")
}

/// One framework segment and the factors it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    #[serde(default)]
    pub factors: Vec<String>,
}

/// Analytical framework override. An empty list means the built-in one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(method) = args.method {
            self.consensus.method = method.config_name().to_string();
        }
        if let Some(threshold) = args.similarity_threshold {
            self.consensus.similarity_threshold = threshold;
            self.consensus.validation_threshold = threshold;
        }
        if let Some(timeout) = args.timeout {
            self.runtime.timeout_seconds = timeout;
        }
        if let Some(ref dir) = args.state_dir {
            self.store.kind = StoreKind::File;
            self.store.path = dir.clone();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Consensus strategy described by the `[consensus]` section.
    pub fn consensus_method(&self) -> Result<ConsensusMethod> {
        match self.consensus.method.as_str() {
            "confidence_based" | "confidence" => Ok(ConsensusMethod::ConfidenceBased),
            "majority_vote" | "majority" => Ok(ConsensusMethod::MajorityVote),
            "clustering_based" | "clustering" => Ok(ConsensusMethod::ClusteringBased {
                similarity_threshold: self.consensus.similarity_threshold,
            }),
            "expert_validation" | "expert" => Ok(ConsensusMethod::ExpertValidation {
                similarity_threshold: self.consensus.validation_threshold,
            }),
            other => bail!("Unknown consensus method: {}", other),
        }
    }

    /// Sanity checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.consensus.similarity_threshold) {
            bail!("consensus.similarity_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.consensus.validation_threshold) {
            bail!("consensus.validation_threshold must be between 0.0 and 1.0");
        }
        if self.runtime.timeout_seconds == 0 {
            bail!("runtime.timeout_seconds must be at least 1");
        }
        let mut names: Vec<&str> = self.providers.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("Duplicate provider name: {}", pair[0]);
        }
        self.consensus_method()?;
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
