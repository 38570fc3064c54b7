//! Fan-out/fan-in execution of research tasks.
//!
//! All tasks start at once. Each task's failure is captured as its own
//! outcome, results come back in submission order, and the whole run can
//! be cancelled cooperatively.

use crate::agent::{AgentRuntime, ProviderRegistry};
use crate::error::AgentError;
use crate::models::{AgentResult, ResearchTask};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    UnknownAgent,
    InvalidResponse,
    Cancelled,
    Panicked,
}

/// Why a single task produced no result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub target: String,
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    fn new(task: &ResearchTask, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            target: task.target.clone(),
            kind,
            message: message.into(),
        }
    }

    fn from_agent_error(task: &ResearchTask, err: &AgentError) -> Self {
        let kind = match err {
            AgentError::Transient { .. } => FailureKind::Transient,
            AgentError::Permanent { .. } | AgentError::Configuration(_) => FailureKind::Permanent,
            AgentError::UnknownAgent(_) => FailureKind::UnknownAgent,
            AgentError::InvalidResponse(_) => FailureKind::InvalidResponse,
        };
        Self::new(task, kind, err.to_string())
    }
}

/// Settled result of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success(AgentResult),
    Failure(TaskFailure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Failures become failed `AgentResult`s so they stay visible downstream.
    pub fn into_agent_result(self) -> AgentResult {
        match self {
            Outcome::Success(result) => result,
            Outcome::Failure(failure) => AgentResult::failed(failure.target, failure.message),
        }
    }
}

/// Runs research tasks concurrently through the agent runtime.
#[derive(Debug, Clone)]
pub struct ParallelTaskRunner {
    runtime: Arc<AgentRuntime>,
    registry: Arc<ProviderRegistry>,
}

impl ParallelTaskRunner {
    pub fn new(runtime: Arc<AgentRuntime>, registry: Arc<ProviderRegistry>) -> Self {
        Self { runtime, registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Runs every task and waits for all of them to settle.
    ///
    /// `output[i]` always belongs to `tasks[i]`. When `cancel` fires, tasks
    /// still in flight are aborted (releasing their pool permits) and
    /// reported as `Cancelled`; outcomes that already settled are kept.
    pub async fn run_all(&self, tasks: Vec<ResearchTask>, cancel: &CancellationToken) -> Vec<Outcome> {
        let total = tasks.len();
        info!("Dispatching {} research task(s)", total);

        let mut slots: Vec<Option<Outcome>> = vec![None; total];
        let mut set = JoinSet::new();

        for (idx, task) in tasks.iter().cloned().enumerate() {
            let runtime = self.runtime.clone();
            let provider = self.registry.get(&task.target);

            set.spawn(async move {
                let Some(provider) = provider else {
                    let err = AgentError::UnknownAgent(task.target.clone());
                    return (idx, Outcome::Failure(TaskFailure::from_agent_error(&task, &err)));
                };

                let run = AssertUnwindSafe(runtime.execute(provider.as_ref(), &task)).catch_unwind();
                let outcome = match run.await {
                    Ok(Ok(result)) => Outcome::Success(result),
                    Ok(Err(err)) => Outcome::Failure(TaskFailure::from_agent_error(&task, &err)),
                    Err(_) => Outcome::Failure(TaskFailure::new(
                        &task,
                        FailureKind::Panicked,
                        "agent task panicked",
                    )),
                };
                (idx, outcome)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Research run cancelled, aborting {} in-flight task(s)", set.len());
                    set.abort_all();
                    break;
                }
                next = set.join_next() => match next {
                    Some(Ok((idx, outcome))) => {
                        debug!(task = %tasks[idx].id, success = outcome.is_success(), "Task settled");
                        slots[idx] = Some(outcome);
                    }
                    Some(Err(err)) => warn!("Research task did not complete: {}", err),
                    None => break,
                }
            }
        }

        // Keep anything that finished before the abort took effect.
        while let Some(joined) = set.join_next().await {
            if let Ok((idx, outcome)) = joined {
                slots[idx] = Some(outcome);
            }
        }

        slots
            .into_iter()
            .zip(tasks.iter())
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| {
                    Outcome::Failure(TaskFailure::new(
                        task,
                        FailureKind::Cancelled,
                        "cancelled before completion",
                    ))
                })
            })
            .collect()
    }
}
