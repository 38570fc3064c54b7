//! Workflow engine.
//!
//! Drives each analysis through interpret, parallel research,
//! score/aggregate and produce-output. Every analysis runs on its own
//! spawned task which is the only writer of its state; readers go through
//! the `StateStore` and get snapshots.

use crate::analysis::{
    ConfidenceScorer, ConsensusAggregator, ConsensusMethod, Outcome, ParallelTaskRunner,
    TaskFailure,
};
use crate::error::{EngineError, StoreError};
use crate::models::{
    AgentResult, AnalysisOutput, AnalysisState, AnalysisStatus, ConsensusResult, ContextMap,
    ResearchTask, SegmentCoverage, Stage,
};
use crate::workflow::framework::Framework;
use crate::workflow::store::StateStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Context key carrying the framework segments into research prompts.
pub const FOCUS_AREAS_KEY: &str = "focus_areas";

/// Returned by `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisHandle {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    pub progress: u8,
}

/// Point-in-time view of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub progress: u8,
    pub errors: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&AnalysisState> for StatusSnapshot {
    fn from(state: &AnalysisState) -> Self {
        Self {
            analysis_id: state.id.clone(),
            status: state.status,
            stage: state.stage,
            progress: state.progress,
            errors: state.errors.clone(),
            updated_at: state.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub providers: Vec<String>,
    pub active_analyses: usize,
}

type ActiveSet = Arc<Mutex<HashSet<String>>>;

/// Terminal states the store refused to take, keyed by analysis id.
type UnsavedStates = Arc<Mutex<HashMap<String, AnalysisState>>>;

/// Removes an id from the active set when its run ends, however it ends.
struct ActiveGuard {
    active: ActiveSet,
    id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sequences analyses and owns their state.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    runner: ParallelTaskRunner,
    aggregator: ConsensusAggregator,
    scorer: ConfidenceScorer,
    method: ConsensusMethod,
    framework: Arc<Framework>,
    active: ActiveSet,
    unsaved: UnsavedStates,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, runner: ParallelTaskRunner) -> Self {
        Self {
            store,
            runner,
            aggregator: ConsensusAggregator::default(),
            scorer: ConfidenceScorer::new(),
            method: ConsensusMethod::default(),
            framework: Arc::new(Framework::default()),
            active: Arc::new(Mutex::new(HashSet::new())),
            unsaved: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_method(mut self, method: ConsensusMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_aggregator(mut self, aggregator: ConsensusAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_framework(mut self, framework: Framework) -> Self {
        self.framework = Arc::new(framework);
        self
    }

    pub fn method(&self) -> &ConsensusMethod {
        &self.method
    }

    /// Submits a new analysis and returns at once.
    ///
    /// The stages run on a spawned task, so this must be called from
    /// within a Tokio runtime.
    pub async fn start(
        &self,
        query: impl Into<String>,
        context: ContextMap,
    ) -> Result<AnalysisHandle, EngineError> {
        let id = Uuid::new_v4().to_string();
        let state = AnalysisState::new(id.clone(), query, context);
        self.store.set(&state).await?;

        let handle = AnalysisHandle {
            analysis_id: id.clone(),
            status: state.status,
            progress: state.progress,
        };

        lock(&self.active).insert(id.clone());
        self.spawn(state);

        info!(analysis = %id, "Analysis submitted");
        Ok(handle)
    }

    /// Continues an interrupted or failed analysis from its last checkpoint.
    ///
    /// Stages whose output is already stored are not run again.
    pub async fn resume(&self, id: &str) -> Result<AnalysisHandle, EngineError> {
        let state = self.load(id).await?;
        let handle = AnalysisHandle {
            analysis_id: state.id.clone(),
            status: state.status,
            progress: state.progress,
        };
        if state.status == AnalysisStatus::Completed {
            return Ok(handle);
        }

        if !lock(&self.active).insert(state.id.clone()) {
            return Err(EngineError::AlreadyRunning(state.id));
        }
        info!(analysis = %id, progress = state.progress, "Resuming analysis");
        self.spawn(state);
        Ok(handle)
    }

    pub async fn status(&self, id: &str) -> Result<StatusSnapshot, EngineError> {
        let state = self.load(id).await?;
        Ok(StatusSnapshot::from(&state))
    }

    /// Final output. Only available once the analysis has completed.
    pub async fn result(&self, id: &str) -> Result<AnalysisOutput, EngineError> {
        let state = self.load(id).await?;
        if state.status != AnalysisStatus::Completed {
            return Err(EngineError::NotReady {
                id: state.id,
                status: state.status,
            });
        }
        let output = state
            .stage_outputs
            .get(Stage::ProduceOutput.as_str())
            .cloned()
            .ok_or_else(|| EngineError::MalformedOutput("missing final output".to_string()))?;
        serde_json::from_value(output).map_err(|e| EngineError::MalformedOutput(e.to_string()))
    }

    /// Polls `status` until the analysis reaches a terminal state.
    pub async fn wait(&self, id: &str, poll: Duration) -> Result<StatusSnapshot, EngineError> {
        loop {
            let snapshot = self.status(id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Deletes a finished analysis from the store.
    pub async fn forget(&self, id: &str) -> Result<(), EngineError> {
        if lock(&self.active).contains(id) {
            return Err(EngineError::AlreadyRunning(id.to_string()));
        }
        let was_unsaved = lock(&self.unsaved).remove(id).is_some();
        if self.store.delete(id).await? || was_unsaved {
            Ok(())
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            providers: self.runner.registry().names(),
            active_analyses: lock(&self.active).len(),
        }
    }

    /// Cancels every running analysis. In-flight agent calls are aborted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Research tasks the interpret stage creates for a query: one per
    /// registered provider, with the framework segments as focus areas.
    pub fn plan_tasks(
        &self,
        analysis_id: &str,
        query: &str,
        context: &ContextMap,
    ) -> Result<Vec<ResearchTask>, EngineError> {
        let providers = self.runner.registry().names();
        if providers.is_empty() {
            return Err(EngineError::NoProviders);
        }

        let mut context = context.clone();
        context
            .entry(FOCUS_AREAS_KEY.to_string())
            .or_insert_with(|| self.framework.segment_names().join(", "));

        let prefix: String = analysis_id.chars().take(8).collect();
        Ok(providers
            .into_iter()
            .map(|name| {
                ResearchTask::new(format!("{}-{}", prefix, name), query, context.clone(), name)
            })
            .collect())
    }

    async fn load(&self, id: &str) -> Result<AnalysisState, EngineError> {
        // A final state the store refused is newer than anything stored.
        let unsaved = lock(&self.unsaved).get(id).cloned();
        if let Some(state) = unsaved {
            return Ok(state);
        }
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    fn spawn(&self, state: AnalysisState) {
        let engine = self.clone();
        let guard = ActiveGuard {
            active: self.active.clone(),
            id: state.id.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            engine.drive(state).await;
        });
    }

    async fn drive(&self, mut state: AnalysisState) {
        let Err(err) = self.run_stages(&mut state).await else {
            return;
        };

        // Losing a checkpoint ends the run; the failure itself must stay visible.
        error!(analysis = %state.id, "Checkpoint failed: {}", err);
        state.fail_checkpoint(&err);
        if let Err(err) = self.checkpoint(&state).await {
            warn!(analysis = %state.id, "Final state kept in memory only: {}", err);
            lock(&self.unsaved).insert(state.id.clone(), state);
        }
    }

    /// Runs the remaining stages. Errors are checkpoint failures only;
    /// stage errors are recorded in `state`.
    async fn run_stages(&self, state: &mut AnalysisState) -> Result<(), StoreError> {
        let cancel = self.shutdown.child_token();

        for stage in Stage::ALL {
            if state.stage_outputs.contains_key(stage.as_str()) {
                continue;
            }
            if cancel.is_cancelled() {
                state.fail(stage, "analysis cancelled");
                return self.checkpoint(state).await;
            }

            state.enter(stage);
            self.checkpoint(state).await?;
            debug!(analysis = %state.id, %stage, "Stage started");

            let run = AssertUnwindSafe(self.run_stage(stage, state, &cancel))
                .catch_unwind()
                .await;
            match run {
                Ok(Ok(output)) => {
                    state.complete_stage(stage, output);
                    self.checkpoint(state).await?;
                    info!(analysis = %state.id, %stage, progress = state.progress, "Stage complete");
                }
                Ok(Err(err)) => {
                    error!(analysis = %state.id, %stage, "Stage failed: {}", err);
                    state.fail(stage, err);
                    return self.checkpoint(state).await;
                }
                Err(_) => {
                    error!(analysis = %state.id, %stage, "Stage panicked");
                    state.fail(stage, "stage panicked");
                    return self.checkpoint(state).await;
                }
            }
        }

        state.finish();
        self.checkpoint(state).await?;
        info!(analysis = %state.id, "Analysis completed");
        Ok(())
    }

    /// Writes `state`, retrying once.
    async fn checkpoint(&self, state: &AnalysisState) -> Result<(), StoreError> {
        if let Err(e) = self.store.set(state).await {
            warn!(analysis = %state.id, "Checkpoint write failed, retrying: {}", e);
            self.store.set(state).await?;
        }
        lock(&self.unsaved).remove(&state.id);
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        state: &AnalysisState,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        match stage {
            Stage::Interpret => {
                let tasks = self.plan_tasks(&state.id, &state.query, &state.context)?;
                Ok(json!({
                    "focus_areas": self.framework.segment_names(),
                    "tasks": tasks,
                }))
            }
            Stage::ParallelResearch => {
                let tasks: Vec<ResearchTask> = stage_field(state, Stage::Interpret, "tasks")?;
                let outcomes = self.runner.run_all(tasks, cancel).await;

                let failures: Vec<TaskFailure> = outcomes
                    .iter()
                    .filter_map(|o| match o {
                        Outcome::Failure(f) => Some(f.clone()),
                        Outcome::Success(_) => None,
                    })
                    .collect();
                let results: Vec<AgentResult> =
                    outcomes.into_iter().map(Outcome::into_agent_result).collect();

                info!(
                    analysis = %state.id,
                    succeeded = results.len() - failures.len(),
                    failed = failures.len(),
                    "Research finished"
                );
                Ok(json!({ "results": results, "failures": failures }))
            }
            Stage::ScoreAggregate => {
                let results: Vec<AgentResult> =
                    stage_field(state, Stage::ParallelResearch, "results")?;
                let successful: Vec<AgentResult> =
                    results.iter().filter(|r| r.is_success()).cloned().collect();

                let quality_score = self.scorer.score_results(&successful);
                let consensus = self.aggregator.aggregate(&results, &self.method);
                let items: Vec<String> = consensus
                    .insights
                    .iter()
                    .chain(consensus.recommendations.iter())
                    .cloned()
                    .collect();
                let segment_coverage = self.framework.coverage(&items);
                let total_cost: f64 = results.iter().map(|r| r.cost).sum();

                Ok(json!({
                    "consensus": consensus,
                    "quality_score": quality_score,
                    "segment_coverage": segment_coverage,
                    "total_cost": total_cost,
                }))
            }
            Stage::ProduceOutput => {
                let consensus: ConsensusResult = stage_field(state, Stage::ScoreAggregate, "consensus")?;
                let quality_score: f64 = stage_field(state, Stage::ScoreAggregate, "quality_score")?;
                let segment_coverage: Vec<SegmentCoverage> =
                    stage_field(state, Stage::ScoreAggregate, "segment_coverage")?;
                let total_cost: f64 = stage_field(state, Stage::ScoreAggregate, "total_cost")?;

                let output = AnalysisOutput {
                    analysis_id: state.id.clone(),
                    query: state.query.clone(),
                    context: state.context.clone(),
                    consensus,
                    quality_score,
                    segment_coverage,
                    total_cost,
                    generated_at: Utc::now(),
                };
                serde_json::to_value(&output).map_err(|e| EngineError::MalformedOutput(e.to_string()))
            }
        }
    }
}

/// Reads `key` from the stored output of an earlier stage.
fn stage_field<T: DeserializeOwned>(
    state: &AnalysisState,
    stage: Stage,
    key: &str,
) -> Result<T, EngineError> {
    let value = state
        .stage_outputs
        .get(stage.as_str())
        .and_then(|output| output.get(key))
        .ok_or_else(|| EngineError::MalformedOutput(format!("{} output has no '{}'", stage, key)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::MalformedOutput(format!("{}.{}: {}", stage, key, e)))
}
