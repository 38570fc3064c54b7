//! Research providers and the registry that names them.
//!
//! A provider turns one `ResearchTask` into one `AgentResult` with a single
//! outbound call. Retries and pooling live in `AgentRuntime`; providers only
//! classify what happened on that one call.

use crate::agent::runtime::{parse_retry_after, AgentRuntime, CallError};
use crate::analysis::aggregator::strip_list_marker;
use crate::config::{ProviderConfig, ProviderKind};
use crate::models::{AgentResult, ResearchTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Maximum insights or recommendations kept from a single response.
const MAX_EXTRACTED_ITEMS: usize = 5;

/// Something that can answer a research task.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    /// Registry name, also used as the result's `model_name`.
    fn name(&self) -> &str;

    /// Host used for per-destination connection limits.
    fn destination(&self) -> &str;

    /// Performs exactly one call.
    async fn analyze(&self, task: &ResearchTask) -> Result<AgentResult, CallError>;
}

/// Lookup table of providers by name, in registration order.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ResearchProvider>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any previous one with the same name.
    pub fn register(&mut self, provider: Arc<dyn ResearchProvider>) {
        let name = provider.name().to_string();
        match self.index.get(&name) {
            Some(&i) => self.providers[i] = provider,
            None => {
                self.index.insert(name, self.providers.len());
                self.providers.push(provider);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ResearchProvider>> {
        self.index.get(name).map(|&i| self.providers[i].clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Builds HTTP providers for every configured entry. Entries whose API
    /// key variable is set but empty, or missing, are skipped.
    pub fn from_config(configs: &[ProviderConfig], runtime: &AgentRuntime) -> Self {
        let mut registry = Self::new();
        for config in configs {
            let api_key = match config.api_key_env.as_deref() {
                Some(var) => match std::env::var(var) {
                    Ok(key) if !key.is_empty() => Some(key),
                    _ => {
                        info!(
                            "Skipping provider {}: environment variable {} is not set",
                            config.name, var
                        );
                        continue;
                    }
                },
                None => None,
            };
            registry.register(Arc::new(HttpProvider::new(
                config.clone(),
                runtime.client().clone(),
                api_key,
            )));
        }
        registry
    }
}

/// Provider speaking an OpenAI-compatible or Ollama chat API.
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    api_key: Option<String>,
    destination: String,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig, client: reqwest::Client, api_key: Option<String>) -> Self {
        let destination = reqwest::Url::parse(&config.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| config.url.clone());
        Self {
            config,
            client,
            api_key,
            destination,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        match self.config.kind {
            ProviderKind::OpenAi => format!("{}/chat/completions", base),
            ProviderKind::Ollama => format!("{}/api/chat", base),
        }
    }

    fn request_body(&self, task: &ResearchTask) -> Value {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: build_user_prompt(task),
            },
        ];
        match self.config.kind {
            ProviderKind::OpenAi => json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": self.config.temperature,
            }),
            ProviderKind::Ollama => json!({
                "model": self.config.model,
                "messages": messages,
                "stream": false,
                "options": { "temperature": self.config.temperature },
            }),
        }
    }

    /// Pulls the answer text, token usage and citations out of the body.
    fn read_body(&self, body: &Value) -> Result<(String, u64, Vec<String>), CallError> {
        let (content, tokens) = match self.config.kind {
            ProviderKind::OpenAi => (
                body["choices"][0]["message"]["content"].as_str(),
                body["usage"]["total_tokens"].as_u64().unwrap_or(0),
            ),
            ProviderKind::Ollama => (
                body["message"]["content"].as_str(),
                body["prompt_eval_count"].as_u64().unwrap_or(0)
                    + body["eval_count"].as_u64().unwrap_or(0),
            ),
        };
        let content = content
            .ok_or_else(|| CallError::InvalidResponse("response has no message content".to_string()))?;
        let citations = body["citations"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok((content.to_string(), tokens, citations))
    }
}

#[async_trait]
impl ResearchProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn destination(&self) -> &str {
        &self.destination
    }

    async fn analyze(&self, task: &ResearchTask) -> Result<AgentResult, CallError> {
        let started = Instant::now();
        let mut request = self.client.post(self.endpoint()).json(&self.request_body(task));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout
            } else if e.is_connect() {
                CallError::Network(format!("cannot connect to {}", self.config.url))
            } else {
                CallError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status {
                status: status.as_u16(),
                message: truncate(&body, 200),
                retry_after,
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout
            } else {
                CallError::InvalidResponse(format!("failed to parse response body: {}", e))
            }
        })?;

        let (content, tokens, citations) = self.read_body(&body)?;
        debug!(
            provider = %self.config.name,
            tokens,
            "Received {} characters",
            content.len()
        );

        let mut result = parse_analysis(&self.config.name, &content);
        result.cost = tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens;
        result.execution_time = started.elapsed().as_secs_f64();
        result
            .metadata
            .insert("model".to_string(), json!(self.config.model));
        result.metadata.insert("tokens".to_string(), json!(tokens));
        if let Some(first) = citations.first() {
            result.metadata.insert("source".to_string(), json!(first));
        }
        if !citations.is_empty() {
            result.metadata.insert("sources".to_string(), json!(citations));
        }
        Ok(result)
    }
}

/// Builds an `AgentResult` from model output. A JSON object with
/// `insights`/`recommendations` is used directly; anything else is mined
/// line by line.
pub fn parse_analysis(model_name: &str, content: &str) -> AgentResult {
    if let Some(parsed) = parse_json_analysis(model_name, content) {
        return parsed;
    }
    let insights = extract_insights(content);
    let recommendations = extract_recommendations(content);
    let confidence = heuristic_confidence(content, &insights, &recommendations);
    AgentResult::success(model_name, content, confidence, insights, recommendations)
}

fn parse_json_analysis(model_name: &str, content: &str) -> Option<AgentResult> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let json: Value = serde_json::from_str(&content[start..=end]).ok()?;

    let list = |keys: &[&str]| -> Option<Vec<String>> {
        keys.iter().find_map(|k| {
            json.get(*k).and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                    .filter(|s| !s.is_empty())
                    .take(MAX_EXTRACTED_ITEMS)
                    .collect()
            })
        })
    };

    let insights = list(&["insights", "key_insights"])?;
    let recommendations = list(&["recommendations"]).unwrap_or_default();
    let analysis = json
        .get("analysis")
        .and_then(Value::as_str)
        .unwrap_or(content)
        .to_string();
    let confidence = json
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| heuristic_confidence(&analysis, &insights, &recommendations));

    Some(AgentResult::success(
        model_name,
        analysis,
        confidence,
        insights,
        recommendations,
    ))
}

const LIST_MARKERS: &[&str] = &["•", "-", "*", "1.", "2.", "3.", "4.", "5."];

/// Bullet/numbered lines or lines mentioning an insight or finding.
pub fn extract_insights(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let lower = line.to_lowercase();
            LIST_MARKERS.iter().any(|m| line.starts_with(m))
                || lower.contains("insight")
                || lower.contains("finding")
        })
        .map(clean_line)
        .filter(|line| !line.is_empty())
        .take(MAX_EXTRACTED_ITEMS)
        .collect()
}

/// Lines that recommend, suggest or call for action.
pub fn extract_recommendations(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            ["recommend", "suggest", "should", "action"]
                .iter()
                .any(|k| lower.contains(k))
        })
        .map(clean_line)
        .filter(|line| !line.is_empty())
        .take(MAX_EXTRACTED_ITEMS)
        .collect()
}

/// Self-confidence from response shape: 0.5 base, capped at 1.0.
pub fn heuristic_confidence(text: &str, insights: &[String], recommendations: &[String]) -> f64 {
    let mut confidence: f64 = 0.5;
    if text.len() > 500 {
        confidence += 0.1;
    }
    if insights.len() >= 3 {
        confidence += 0.2;
    }
    if recommendations.len() >= 2 {
        confidence += 0.2;
    }
    if LIST_MARKERS.iter().any(|m| text.contains(m)) {
        confidence += 0.1;
    }
    confidence.min(1.0)
}

fn clean_line(line: &str) -> String {
    strip_list_marker(line).trim().to_string()
}

fn build_user_prompt(task: &ResearchTask) -> String {
    let mut prompt = String::new();
    prompt.push_str("Research question:\n");
    prompt.push_str(&task.query);
    prompt.push_str("\n\n");

    if !task.context.is_empty() {
        let mut keys: Vec<&String> = task.context.keys().collect();
        keys.sort();
        prompt.push_str("Context:\n");
        for key in keys {
            prompt.push_str(&format!("- {}: {}\n", key, task.context[key]));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Respond with a JSON object: {\"analysis\": string, \"insights\": [string], \
         \"recommendations\": [string], \"confidence\": number between 0 and 1}.",
    );
    prompt
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

const SYSTEM_PROMPT: &str = r#"You are a strategic market research analyst.
Focus on current market conditions, recent data and concrete evidence.
Give at most five key insights and five actionable recommendations.
Only output valid JSON, no markdown fences."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::AgentError;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_config(kind: ProviderKind, url: &str) -> ProviderConfig {
        ProviderConfig {
            name: "mock".to_string(),
            kind,
            url: url.to_string(),
            model: "mock-model".to_string(),
            api_key_env: None,
            temperature: 0.3,
            cost_per_1k_tokens: 0.5,
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
        let mut context = HashMap::new();
        context.insert("industry".to_string(), "outdoor living".to_string());
        ResearchTask::new("t1", "Evaluate market entry", context, "mock")
    }

    fn openai_body(content: &str) -> Value {
        json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }],
            "usage": { "total_tokens": 2000 },
            "citations": ["https://www.reuters.com/markets", "https://example.edu/paper"]
        })
    }

    #[test]
    fn test_parse_json_analysis() {
        let content = r#"Here you go:
{"analysis": "Solid market", "insights": ["Demand rising", "Few competitors"], "recommendations": ["Enter now"], "confidence": 0.82}"#;
        let result = parse_analysis("m", content);
        assert_eq!(result.analysis, "Solid market");
        assert_eq!(result.insights, vec!["Demand rising", "Few competitors"]);
        assert_eq!(result.recommendations, vec!["Enter now"]);
        assert!((result.confidence - 0.82).abs() < 1e-9);
    }

    #[test]
    fn test_parse_text_analysis() {
        let content = "Overview of the market.\n\
                       - Demand is rising in suburbs\n\
                       - Key finding: premium segment underserved\n\
                       2. Costs are stable\n\
                       You should partner with installers.\n\
                       We recommend a pilot in two regions.";
        let result = parse_analysis("m", content);
        assert_eq!(result.insights.len(), 3);
        assert_eq!(result.insights[0], "Demand is rising in suburbs");
        assert_eq!(result.insights[2], "Costs are stable");
        assert_eq!(result.recommendations.len(), 2);
        // 0.5 base + 0.2 (3 insights) + 0.2 (2 recommendations) + 0.1 (markers)
        assert!((result.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_heuristic_confidence_base() {
        assert!((heuristic_confidence("plain", &[], &[]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_registry_lookup_and_replace() {
        let runtime = fast_runtime();
        let mut registry = ProviderRegistry::new();
        let a = HttpProvider::new(
            provider_config(ProviderKind::Ollama, "http://localhost:11434"),
            runtime.client().clone(),
            None,
        );
        registry.register(Arc::new(a));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mock").unwrap().destination(), "localhost");

        let b = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, "https://api.example.com/v1"),
            runtime.client().clone(),
            None,
        );
        registry.register(Arc::new(b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mock").unwrap().destination(), "api.example.com");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registry_skips_missing_keys() {
        let runtime = fast_runtime();
        let mut config = provider_config(ProviderKind::OpenAi, "https://api.example.com/v1");
        config.api_key_env = Some("STRATEGIST_TEST_KEY_THAT_IS_NOT_SET".to_string());
        let registry = ProviderRegistry::from_config(&[config], &runtime);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_openai_provider_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_body(
                r#"{"analysis": "ok", "insights": ["Demand rising"], "recommendations": ["Enter"], "confidence": 0.9}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, &server.uri()),
            runtime.client().clone(),
            Some("secret".to_string()),
        );

        let result = runtime.execute(&provider, &task()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.insights, vec!["Demand rising"]);
        assert!((result.cost - 1.0).abs() < 1e-9);
        assert_eq!(result.metadata["source"], json!("https://www.reuters.com/markets"));
        assert_eq!(result.metadata["attempts"], json!(1));
    }

    #[tokio::test]
    async fn test_ollama_provider_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": { "role": "assistant", "content": "- Demand rising\n- Costs stable\nYou should enter." },
                "done": true,
                "prompt_eval_count": 100,
                "eval_count": 50
            })))
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::Ollama, &server.uri()),
            runtime.client().clone(),
            None,
        );

        let result = runtime.execute(&provider, &task()).await.unwrap();
        assert_eq!(result.insights, vec!["Demand rising", "Costs stable"]);
        assert_eq!(result.recommendations, vec!["You should enter."]);
        assert_eq!(result.metadata["tokens"], json!(150));
    }

    #[tokio::test]
    async fn test_server_error_retried_to_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, &server.uri()),
            runtime.client().clone(),
            None,
        );

        let err = runtime.execute(&provider, &task()).await.unwrap_err();
        assert!(matches!(err, AgentError::Transient { .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, &server.uri()),
            runtime.client().clone(),
            None,
        );

        let err = runtime.execute(&provider, &task()).await.unwrap_err();
        assert!(matches!(err, AgentError::Permanent { status: 400, .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, &server.uri()),
            runtime.client().clone(),
            None,
        );

        let err = provider.analyze(&task()).await.unwrap_err();
        assert_eq!(
            err,
            CallError::Status {
                status: 429,
                message: String::new(),
                retry_after: Some(std::time::Duration::from_secs(30)),
            }
        );
    }

    #[tokio::test]
    async fn test_missing_content_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let runtime = fast_runtime();
        let provider = HttpProvider::new(
            provider_config(ProviderKind::OpenAi, &server.uri()),
            runtime.client().clone(),
            None,
        );

        let err = runtime.execute(&provider, &task()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
        server.verify().await;
    }
}
