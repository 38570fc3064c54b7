//! Data models for the research workflow.
//!
//! This module contains the core data structures passed between the
//! agent runtime, the aggregation layer and the workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Free-form context attached to a query (e.g. `industry = "outdoor living"`).
pub type ContextMap = HashMap<String, String>;

/// One unit of work for a single research agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    /// Unique task identifier within a stage fan-out.
    pub id: String,
    /// The query text sent to the agent.
    pub query: String,
    /// Additional context forwarded to the agent.
    pub context: ContextMap,
    /// Name of the provider registered in the `ProviderRegistry`.
    pub target: String,
}

impl ResearchTask {
    pub fn new(
        id: impl Into<String>,
        query: impl Into<String>,
        context: ContextMap,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            context,
            target: target.into(),
        }
    }
}

/// Whether an agent produced usable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Output of a single agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// Provider/model that produced the result.
    pub model_name: String,
    /// Raw analysis text.
    pub analysis: String,
    /// Self-reported confidence, always within `[0, 1]`.
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: f64,
    /// Extracted insights, in the order the model gave them.
    pub insights: Vec<String>,
    /// Extracted recommendations, in the order the model gave them.
    pub recommendations: Vec<String>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    /// Estimated cost in USD.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_unit(raw))
}

/// Clamp a value into `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

impl AgentResult {
    /// Creates a successful result. The confidence is clamped to `[0, 1]`.
    pub fn success(
        model_name: impl Into<String>,
        analysis: impl Into<String>,
        confidence: f64,
        insights: Vec<String>,
        recommendations: Vec<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            analysis: analysis.into(),
            confidence: clamp_unit(confidence),
            insights,
            recommendations,
            execution_time: 0.0,
            cost: 0.0,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            status: ResultStatus::Success,
            error: None,
        }
    }

    /// Creates a failed result carrying the error message.
    pub fn failed(model_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            analysis: String::new(),
            confidence: 0.0,
            insights: Vec::new(),
            recommendations: Vec::new(),
            execution_time: 0.0,
            cost: 0.0,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            status: ResultStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Sets the confidence, clamping it into `[0, 1]`.
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_unit(confidence);
    }
}

/// Per-model audit line in a consensus result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContribution {
    pub model_name: String,
    pub status: ResultStatus,
    pub confidence: f64,
    pub insight_count: usize,
    pub recommendation_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AgentResult> for ModelContribution {
    fn from(result: &AgentResult) -> Self {
        Self {
            model_name: result.model_name.clone(),
            status: result.status,
            confidence: result.confidence,
            insight_count: result.insights.len(),
            recommendation_count: result.recommendations.len(),
            error: result.error.clone(),
        }
    }
}

/// Merged output of several agent results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub consensus_confidence: f64,
    /// Name of the strategy that produced this result.
    pub method: String,
    pub contributions: Vec<ModelContribution>,
}

impl ConsensusResult {
    /// Number of models whose output fed the consensus.
    pub fn contributing_models(&self) -> usize {
        self.contributions
            .iter()
            .filter(|c| c.status == ResultStatus::Success)
            .count()
    }

    /// Number of models that failed and were excluded.
    pub fn failed_models(&self) -> usize {
        self.contributions.len() - self.contributing_models()
    }
}

/// Lifecycle status of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisStatus {
    Initiated,
    Running,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Initiated => write!(f, "INITIATED"),
            AnalysisStatus::Running => write!(f, "RUNNING"),
            AnalysisStatus::Completed => write!(f, "COMPLETED"),
            AnalysisStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Sequential phases of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Interpret,
    ParallelResearch,
    ScoreAggregate,
    ProduceOutput,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::Interpret,
        Stage::ParallelResearch,
        Stage::ScoreAggregate,
        Stage::ProduceOutput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Interpret => "interpret",
            Stage::ParallelResearch => "parallel_research",
            Stage::ScoreAggregate => "score_aggregate",
            Stage::ProduceOutput => "produce_output",
        }
    }

    /// Progress reported while this stage is running.
    pub fn start_progress(&self) -> u8 {
        match self {
            Stage::Interpret => 5,
            Stage::ParallelResearch => 15,
            Stage::ScoreAggregate => 65,
            Stage::ProduceOutput => 85,
        }
    }

    /// Progress reported once this stage has completed.
    pub fn end_progress(&self) -> u8 {
        match self {
            Stage::Interpret => 15,
            Stage::ParallelResearch => 65,
            Stage::ScoreAggregate => 85,
            Stage::ProduceOutput => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete, checkpointable state of one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisState {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub context: ContextMap,
    pub status: AnalysisStatus,
    /// Stage currently running (or the last one attempted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub progress: u8,
    /// Output of each completed stage, keyed by stage name.
    #[serde(default)]
    pub stage_outputs: HashMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisState {
    /// Creates a fresh state in `INITIATED` with zero progress.
    pub fn new(id: impl Into<String>, query: impl Into<String>, context: ContextMap) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            query: query.into(),
            context,
            status: AnalysisStatus::Initiated,
            stage: None,
            progress: 0,
            stage_outputs: HashMap::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Raises progress to `progress` (capped at 100). Never lowers it.
    pub fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.touch();
    }

    /// Marks `stage` as running.
    pub fn enter(&mut self, stage: Stage) {
        self.status = AnalysisStatus::Running;
        self.stage = Some(stage);
        self.advance(stage.start_progress());
    }

    /// Stores the output of `stage` and advances progress past it.
    pub fn complete_stage(&mut self, stage: Stage, output: Value) {
        self.stage_outputs.insert(stage.as_str().to_string(), output);
        self.advance(stage.end_progress());
    }

    /// Terminal failure. Stage outputs produced so far are kept.
    pub fn fail(&mut self, stage: Stage, error: impl fmt::Display) {
        self.status = AnalysisStatus::Failed;
        self.stage = Some(stage);
        self.errors.push(format!("{}: {}", stage, error));
        self.touch();
    }

    /// Terminal failure caused by a lost state write. The stage is kept
    /// so status still shows where the run stopped.
    pub fn fail_checkpoint(&mut self, error: impl fmt::Display) {
        self.status = AnalysisStatus::Failed;
        self.errors.push(format!("checkpoint: {}", error));
        self.touch();
    }

    pub fn finish(&mut self) {
        self.status = AnalysisStatus::Completed;
        self.advance(100);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Final payload returned by `WorkflowEngine::result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub analysis_id: String,
    pub query: String,
    pub context: ContextMap,
    pub consensus: ConsensusResult,
    /// Multi-factor data confidence over the successful results.
    pub quality_score: f64,
    /// Share of consensus items touching each framework segment.
    pub segment_coverage: Vec<SegmentCoverage>,
    pub total_cost: f64,
    pub generated_at: DateTime<Utc>,
}

/// How strongly the consensus covers one framework segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCoverage {
    pub segment: String,
    pub matched_items: usize,
    pub coverage: f64,
}
