//! Research agents.
//!
//! This module provides the provider abstraction and the resilient runtime
//! that executes single agent calls.

pub mod provider;
pub mod runtime;

pub use provider::{ProviderRegistry, ResearchProvider};
pub use runtime::{AgentRuntime, CallError, RetryPolicy};
