//! Resilient execution of a single agent call.
//!
//! The runtime wraps a `ResearchProvider` call with:
//! - a bounded connection pool (global and per-destination permits)
//! - a hard per-call timeout
//! - retries with exponential backoff for transient failures
//! - `Retry-After` aware waiting on HTTP 429

use crate::agent::provider::ResearchProvider;
use crate::config::RuntimeConfig;
use crate::error::{AgentError, TransientKind};
use crate::models::{AgentResult, ResearchTask};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Raw failure of one attempt, before retry classification.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Connection refused, reset, DNS failure and the like.
    Network(String),
    /// The call exceeded the hard timeout.
    Timeout,
    /// The provider answered with a non-success status.
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    /// The provider answered but the body was unusable.
    InvalidResponse(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Network(msg) => write!(f, "network error: {}", msg),
            CallError::Timeout => write!(f, "timeout"),
            CallError::Status {
                status, message, ..
            } => write!(f, "HTTP {}: {}", status, message),
            CallError::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
        }
    }
}

impl CallError {
    /// Network errors, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Network(_) | CallError::Timeout => true,
            CallError::Status { status, .. } => *status == 429 || *status >= 500,
            CallError::InvalidResponse(_) => false,
        }
    }

    /// Final classification once no further attempts will be made.
    pub fn into_agent_error(self, attempts: u32) -> AgentError {
        let transient = |kind, message| AgentError::Transient {
            kind,
            attempts,
            message,
        };
        match self {
            CallError::Network(msg) => transient(TransientKind::Network, msg),
            CallError::Timeout => transient(TransientKind::Timeout, "call timed out".to_string()),
            CallError::Status {
                status: 429,
                message,
                ..
            } => transient(TransientKind::RateLimited, message),
            CallError::Status {
                status, message, ..
            } if status >= 500 => transient(TransientKind::Server, format!("HTTP {}: {}", status, message)),
            CallError::Status {
                status, message, ..
            } => AgentError::Permanent { status, message },
            CallError::InvalidResponse(msg) => AgentError::InvalidResponse(msg),
        }
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait used on 429 when the server gives no hint.
    pub rate_limit_default: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(10),
            rate_limit_default: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (1-indexed) failed with `err`.
    pub fn delay_for(&self, attempt: u32, err: &CallError) -> Duration {
        match err {
            CallError::Status {
                status: 429,
                retry_after,
                ..
            } => retry_after.unwrap_or(self.rate_limit_default),
            _ => {
                let exp = attempt.saturating_sub(1).min(16);
                self.initial_backoff
                    .saturating_mul(1u32 << exp)
                    .min(self.max_backoff)
            }
        }
    }
}

/// Reads a `Retry-After` header given either as seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let secs = (at - Utc::now()).num_seconds().max(0) as u64;
    Some(Duration::from_secs(secs))
}

/// Bounded pool of outbound call slots.
///
/// Every call holds one global permit and one permit for its destination.
/// Both are released when the `PoolPermit` is dropped.
#[derive(Debug)]
pub struct ConnectionPool {
    global: Arc<Semaphore>,
    per_host_limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Scoped hold on a pool slot.
#[derive(Debug)]
pub struct PoolPermit {
    _host: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl ConnectionPool {
    pub fn new(max_connections: usize, per_host_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_connections.max(1))),
            per_host_limit: per_host_limit.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for a slot towards `destination`.
    pub async fn acquire(&self, destination: &str) -> Result<PoolPermit, AgentError> {
        let host = self.host_semaphore(destination);
        // Host first so a saturated destination does not sit on global slots.
        let host = host
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Configuration("connection pool closed".to_string()))?;
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Configuration("connection pool closed".to_string()))?;
        Ok(PoolPermit {
            _host: host,
            _global: global,
        })
    }

    /// Free global slots.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    fn host_semaphore(&self, destination: &str) -> Arc<Semaphore> {
        let mut hosts = match self.hosts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        hosts
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }
}

/// Executes agent calls with retries, timeouts and pooled connections.
#[derive(Debug)]
pub struct AgentRuntime {
    policy: RetryPolicy,
    call_timeout: Duration,
    pool: ConnectionPool,
    client: reqwest::Client,
}

impl AgentRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .pool_max_idle_per_host(config.pool_max_per_host)
            .build()
            .map_err(|e| AgentError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            policy: config.retry_policy(),
            call_timeout: Duration::from_secs(config.timeout_seconds),
            pool: ConnectionPool::new(config.pool_max_connections, config.pool_max_per_host),
            client,
        })
    }

    /// Shared HTTP client for providers.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs `task` against `provider`, retrying transient failures.
    ///
    /// Always returns a classified outcome. The pool permit is held only for
    /// the duration of each attempt, never across backoff sleeps.
    pub async fn execute(
        &self,
        provider: &dyn ResearchProvider,
        task: &ResearchTask,
    ) -> Result<AgentResult, AgentError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            let outcome = {
                let _permit = self.pool.acquire(provider.destination()).await?;
                match tokio::time::timeout(self.call_timeout, provider.analyze(task)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CallError::Timeout),
                }
            };

            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(mut result) => {
                    info!(
                        provider = provider.name(),
                        task = %task.id,
                        attempt,
                        elapsed_ms,
                        outcome = "success",
                        "Agent call finished"
                    );
                    result.set_confidence(result.confidence);
                    result.execution_time = started.elapsed().as_secs_f64();
                    result
                        .metadata
                        .insert("attempts".to_string(), serde_json::json!(attempt));
                    return Ok(result);
                }
                Err(err) => {
                    warn!(
                        provider = provider.name(),
                        task = %task.id,
                        attempt,
                        elapsed_ms,
                        outcome = %err,
                        "Agent call failed"
                    );

                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err.into_agent_error(attempt));
                    }

                    let delay = self.policy.delay_for(attempt, &err);
                    debug!(
                        provider = provider.name(),
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Provider that replays scripted outcomes and records call times.
    struct ScriptedProvider {
        script: StdMutex<Vec<Result<AgentResult, CallError>>>,
        fallback: CallError,
        calls: AtomicU32,
        call_times: StdMutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<AgentResult, CallError>>, fallback: CallError) -> Self {
            Self {
                script: StdMutex::new(script.into_iter().rev().collect()),
                fallback,
                calls: AtomicU32::new(0),
                call_times: StdMutex::new(Vec::new()),
            }
        }

        fn always(err: CallError) -> Self {
            Self::new(vec![], err)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResearchProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn destination(&self) -> &str {
            "scripted.test"
        }

        async fn analyze(&self, _task: &ResearchTask) -> Result<AgentResult, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            let next = self.script.lock().unwrap().pop();
            next.unwrap_or_else(|| Err(self.fallback.clone()))
        }
    }

    fn fast_runtime() -> AgentRuntime {
        let mut config = RuntimeConfig::default();
        config.backoff_initial_ms = 1;
        config.backoff_max_ms = 2;
        config.rate_limit_default_secs = 0;
        AgentRuntime::new(&config).unwrap()
    }

    fn task() -> ResearchTask {
        ResearchTask::new("t1", "query", Default::default(), "scripted")
    }

    fn status(code: u16) -> CallError {
        CallError::Status {
            status: code,
            message: "err".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1, &CallError::Timeout), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2, &CallError::Timeout), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3, &CallError::Timeout), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30, &CallError::Timeout), Duration::from_secs(10));
    }

    #[test]
    fn test_rate_limit_delay_uses_hint() {
        let policy = RetryPolicy::default();
        let hinted = CallError::Status {
            status: 429,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1, &status(429)), Duration::from_secs(60));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CallError::Timeout.is_retryable());
        assert!(CallError::Network("reset".into()).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!CallError::InvalidResponse("bad".into()).is_retryable());

        assert!(matches!(
            status(429).into_agent_error(3),
            AgentError::Transient {
                kind: TransientKind::RateLimited,
                attempts: 3,
                ..
            }
        ));
        assert!(matches!(
            status(403).into_agent_error(1),
            AgentError::Permanent { status: 403, .. }
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_transient_failure_uses_all_attempts() {
        let runtime = fast_runtime();
        let provider = ScriptedProvider::always(status(503));

        let err = runtime.execute(&provider, &task()).await.unwrap_err();

        assert_eq!(provider.calls(), 3);
        assert!(matches!(
            err,
            AgentError::Transient {
                kind: TransientKind::Server,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_client_error_fails_immediately() {
        let runtime = fast_runtime();
        let provider = ScriptedProvider::always(status(401));

        let err = runtime.execute(&provider, &task()).await.unwrap_err();

        assert_eq!(provider.calls(), 1);
        assert!(matches!(err, AgentError::Permanent { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let runtime = fast_runtime();
        let ok = AgentResult::success("scripted", "fine", 1.4, vec!["i".into()], vec![]);
        let provider = ScriptedProvider::new(
            vec![Err(CallError::Network("reset".into())), Ok(ok)],
            CallError::Timeout,
        );

        let result = runtime.execute(&provider, &task()).await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.metadata["attempts"], serde_json::json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_delays_next_attempt() {
        let runtime = AgentRuntime::new(&RuntimeConfig::default()).unwrap();
        let hinted = CallError::Status {
            status: 429,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };
        let ok = AgentResult::success("scripted", "fine", 0.7, vec![], vec![]);
        let provider = ScriptedProvider::new(vec![Err(hinted), Ok(ok)], CallError::Timeout);

        runtime.execute(&provider, &task()).await.unwrap();

        let times = provider.call_times.lock().unwrap().clone();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(30));
        assert!(times[1] - times[0] < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_hint_waits_default() {
        let runtime = AgentRuntime::new(&RuntimeConfig::default()).unwrap();
        let ok = AgentResult::success("scripted", "fine", 0.7, vec![], vec![]);
        let provider = ScriptedProvider::new(vec![Err(status(429)), Ok(ok)], CallError::Timeout);

        runtime.execute(&provider, &task()).await.unwrap();

        let times = provider.call_times.lock().unwrap().clone();
        assert!(times[1] - times[0] >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_and_retries() {
        struct Hanging(AtomicUsize);

        #[async_trait]
        impl ResearchProvider for Hanging {
            fn name(&self) -> &str {
                "hanging"
            }
            fn destination(&self) -> &str {
                "hanging.test"
            }
            async fn analyze(&self, _task: &ResearchTask) -> Result<AgentResult, CallError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                std::future::pending().await
            }
        }

        let runtime = AgentRuntime::new(&RuntimeConfig::default()).unwrap();
        let provider = Hanging(AtomicUsize::new(0));

        let err = runtime.execute(&provider, &task()).await.unwrap_err();

        assert_eq!(provider.0.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            AgentError::Transient {
                kind: TransientKind::Timeout,
                ..
            }
        ));
        // Every permit is back in the pool.
        assert_eq!(runtime.pool().available(), 10);
    }

    #[tokio::test]
    async fn test_pool_permits_released_on_drop() {
        let pool = ConnectionPool::new(2, 1);
        let first = pool.acquire("a.test").await.unwrap();
        assert_eq!(pool.available(), 1);
        drop(first);
        assert_eq!(pool.available(), 2);

        let _a = pool.acquire("a.test").await.unwrap();
        let _b = pool.acquire("b.test").await.unwrap();
        assert_eq!(pool.available(), 0);
    }
}
