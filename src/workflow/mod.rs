//! Analysis workflow: staged execution, checkpointing and the framework
//! used to steer and score research.

pub mod engine;
pub mod framework;
pub mod store;

pub use engine::{StatusSnapshot, WorkflowEngine};
pub use framework::Framework;
pub use store::{FileStore, MemoryStore, StateStore};
