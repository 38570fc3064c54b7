//! Analysis modules.
//!
//! Parallel execution of research tasks, data-confidence scoring and
//! consensus aggregation.

pub mod aggregator;
pub mod runner;
pub mod scorer;

pub use aggregator::{ConsensusAggregator, ConsensusMethod};
pub use runner::{Outcome, ParallelTaskRunner, TaskFailure};
pub use scorer::ConfidenceScorer;
