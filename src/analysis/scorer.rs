//! Multi-factor confidence scoring.
//!
//! A score is a weighted blend of three factors:
//! data quality (0.40), source authority (0.35) and recency (0.25).
//! Every computation degrades to a neutral 0.5 instead of failing.

use crate::models::AgentResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

pub const DATA_QUALITY_WEIGHT: f64 = 0.40;
pub const SOURCE_AUTHORITY_WEIGHT: f64 = 0.35;
pub const RECENCY_WEIGHT: f64 = 0.25;

/// Score used whenever an input cannot be assessed.
pub const NEUTRAL_SCORE: f64 = 0.5;

// Entries starting with '.' match a host suffix; others match the
// domain itself or any subdomain of it.
const PREMIER_SOURCES: &[&str] = &["bloomberg.com", "reuters.com", "wsj.com", "economist.com"];
const TRADE_PRESS_SOURCES: &[&str] = &["forbes.com", "techcrunch.com", "wired.com"];
const ACADEMIC_SOURCES: &[&str] = &[".edu", ".ac.uk", "arxiv.org"];
const INSTITUTIONAL_SOURCES: &[&str] = &[".gov", ".org"];

/// Attributes of one result that the scorer looks at.
#[derive(Debug, Clone, Default)]
pub struct ScoringInput {
    pub content: Option<String>,
    pub sources: Vec<String>,
    /// Primary source URL or name.
    pub source: Option<String>,
    /// Raw timestamp text; parsed lazily so bad values only affect recency.
    pub timestamp: Option<String>,
    pub structured_data: Option<Value>,
    pub metadata: Option<Value>,
}

impl ScoringInput {
    /// Builds scoring input from an agent result. Citations are read from
    /// the `sources` metadata entry and the primary source from `source`.
    pub fn from_result(result: &AgentResult) -> Self {
        let sources: Vec<String> = result
            .metadata
            .get("sources")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let source = result
            .metadata
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| sources.first().cloned());

        let structured = if result.insights.is_empty() && result.recommendations.is_empty() {
            None
        } else {
            Some(serde_json::json!({
                "insights": result.insights,
                "recommendations": result.recommendations,
            }))
        };

        Self {
            content: Some(result.analysis.clone()),
            sources,
            source,
            timestamp: Some(result.timestamp.to_rfc3339()),
            structured_data: structured,
            metadata: if result.metadata.is_empty() {
                None
            } else {
                serde_json::to_value(&result.metadata).ok()
            },
        }
    }

    /// Builds scoring input from a loose JSON object. Fields of the wrong
    /// type are treated as absent.
    pub fn from_json(value: &Value) -> Self {
        let get = |key: &str| value.get(key).filter(|v| !v.is_null());

        Self {
            content: get("content").map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            }),
            sources: get("sources")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            source: get("source").and_then(Value::as_str).map(str::to_string),
            timestamp: get("timestamp").map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            }),
            structured_data: get("structured_data").cloned(),
            metadata: get("metadata").cloned(),
        }
    }
}

/// Stateless confidence scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceScorer;

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self
    }

    /// Combined score for a list of inputs. Each factor is averaged across
    /// all inputs before weighting. An empty list scores exactly 0.0.
    pub fn score(&self, inputs: &[ScoringInput]) -> f64 {
        if inputs.is_empty() {
            return 0.0;
        }

        guarded("aggregate", || {
            let n = inputs.len() as f64;
            let quality = inputs.iter().map(|i| self.data_quality(i)).sum::<f64>() / n;
            let authority = inputs.iter().map(|i| self.source_authority(i)).sum::<f64>() / n;
            let recency = inputs.iter().map(|i| self.recency(i)).sum::<f64>() / n;

            (quality * DATA_QUALITY_WEIGHT
                + authority * SOURCE_AUTHORITY_WEIGHT
                + recency * RECENCY_WEIGHT)
                .clamp(0.0, 1.0)
        })
    }

    /// Scores agent results directly.
    pub fn score_results(&self, results: &[AgentResult]) -> f64 {
        let inputs: Vec<ScoringInput> = results.iter().map(ScoringInput::from_result).collect();
        self.score(&inputs)
    }

    /// Scores loose JSON values. Non-object values count as malformed.
    pub fn score_values(&self, values: &[Value]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        if values.iter().any(|v| !v.is_object()) {
            warn!("Malformed scoring input, using neutral confidence");
            return NEUTRAL_SCORE;
        }
        let inputs: Vec<ScoringInput> = values.iter().map(ScoringInput::from_json).collect();
        self.score(&inputs)
    }

    /// Five independent 0.2 increments, capped at 1.0.
    pub fn data_quality(&self, input: &ScoringInput) -> f64 {
        guarded("data_quality", || {
            let checks = [
                input
                    .content
                    .as_ref()
                    .is_some_and(|c| c.chars().count() > 100),
                !input.sources.is_empty(),
                input.timestamp.is_some(),
                input.structured_data.as_ref().is_some_and(is_present),
                input.metadata.as_ref().is_some_and(is_present),
            ];
            let hits = checks.iter().filter(|hit| **hit).count() as f64;
            (hits * 0.2).min(1.0)
        })
    }

    /// First-match lookup on the declared source.
    pub fn source_authority(&self, input: &ScoringInput) -> f64 {
        guarded("source_authority", || match input.source.as_deref() {
            None => NEUTRAL_SCORE,
            Some(source) => authority_for(source),
        })
    }

    /// Age buckets measured from now (UTC).
    pub fn recency(&self, input: &ScoringInput) -> f64 {
        guarded("recency", || {
            let Some(raw) = input.timestamp.as_deref() else {
                return NEUTRAL_SCORE;
            };
            match parse_timestamp(raw) {
                Some(ts) => recency_for_age((Utc::now() - ts).num_days()),
                None => NEUTRAL_SCORE,
            }
        })
    }
}

/// Authority score for a source URL or bare domain. Sources without a
/// usable host score as unknown (0.4).
pub fn authority_for(source: &str) -> f64 {
    let Some(host) = source_host(source) else {
        return 0.4;
    };
    let matches = |domains: &[&str]| domains.iter().any(|d| host_matches(&host, d));

    if matches(PREMIER_SOURCES) {
        0.9
    } else if matches(TRADE_PRESS_SOURCES) {
        0.7
    } else if matches(ACADEMIC_SOURCES) {
        0.8
    } else if matches(INSTITUTIONAL_SOURCES) {
        0.6
    } else {
        0.4
    }
}

/// Lowercased host of `source`, which may lack a scheme.
fn source_host(source: &str) -> Option<String> {
    let source = source.trim();
    let url = Url::parse(source)
        .ok()
        .filter(|url| url.host_str().is_some())
        .or_else(|| Url::parse(&format!("https://{}", source)).ok())?;
    url.host_str()
        .map(|host| host.trim_end_matches('.').to_lowercase())
}

fn host_matches(host: &str, domain: &str) -> bool {
    if domain.starts_with('.') {
        host.ends_with(domain)
    } else {
        host == domain || host.ends_with(&format!(".{}", domain))
    }
}

/// Recency score for an age in whole days.
pub fn recency_for_age(age_days: i64) -> f64 {
    match age_days {
        d if d <= 1 => 1.0,
        d if d <= 7 => 0.9,
        d if d <= 30 => 0.7,
        d if d <= 90 => 0.5,
        _ => 0.3,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Runs one computation, degrading to the neutral score on panic or a
/// non-finite result.
fn guarded<F: FnOnce() -> f64>(name: &str, f: F) -> f64 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(score) if score.is_finite() => score,
        Ok(_) => {
            warn!(factor = name, "Non-finite score, using neutral confidence");
            NEUTRAL_SCORE
        }
        Err(_) => {
            warn!(factor = name, "Scoring failed, using neutral confidence");
            NEUTRAL_SCORE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn source(s: &str) -> ScoringInput {
        ScoringInput {
            source: Some(s.to_string()),
            ..Default::default()
        }
    }

    fn aged(days: i64) -> ScoringInput {
        ScoringInput {
            timestamp: Some((Utc::now() - Duration::days(days)).to_rfc3339()),
            ..Default::default()
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum = DATA_QUALITY_WEIGHT + SOURCE_AUTHORITY_WEIGHT + RECENCY_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input_is_zero() {
        let scorer = ConfidenceScorer::new();
        assert_eq!(scorer.score(&[]), 0.0);
        assert_eq!(scorer.score_values(&[]), 0.0);
        assert_eq!(scorer.score_results(&[]), 0.0);
    }

    #[test]
    fn test_source_authority_lookup() {
        let scorer = ConfidenceScorer::new();
        assert_eq!(scorer.source_authority(&source("https://www.reuters.com/x")), 0.9);
        assert_eq!(scorer.source_authority(&source("https://example.edu/paper")), 0.8);
        assert_eq!(scorer.source_authority(&source("https://techcrunch.com/a")), 0.7);
        assert_eq!(scorer.source_authority(&source("https://data.census.gov")), 0.6);
        assert_eq!(scorer.source_authority(&source("https://someblog.io")), 0.4);
        assert_eq!(scorer.source_authority(&ScoringInput::default()), 0.5);
    }

    #[test]
    fn test_source_authority_matches_hosts_not_substrings() {
        assert_eq!(authority_for("https://news.microsoft.com/x"), 0.4);
        assert_eq!(authority_for("https://opensoft.com/a"), 0.4);
        assert_eq!(authority_for("https://notreuters.com/story"), 0.4);
        assert_eq!(authority_for("https://wsj.com.example.io/page"), 0.4);
        assert_eq!(authority_for("https://example.com/?ref=bloomberg.com"), 0.4);
        assert_eq!(authority_for("https://gov.example.com"), 0.4);
        assert_eq!(authority_for("Reuters special report"), 0.4);

        assert_eq!(authority_for("https://www.Bloomberg.com/markets"), 0.9);
        assert_eq!(authority_for("reuters.com/world"), 0.9);
        assert_eq!(authority_for("https://arxiv.org/abs/2401.00001"), 0.8);
        assert_eq!(authority_for("https://www.ox.ac.uk/research"), 0.8);
        assert_eq!(authority_for("https://www.wikipedia.org"), 0.6);
    }

    #[test]
    fn test_recency_buckets() {
        let scorer = ConfidenceScorer::new();
        assert_eq!(scorer.recency(&aged(0)), 1.0);
        assert_eq!(scorer.recency(&aged(5)), 0.9);
        assert_eq!(scorer.recency(&aged(20)), 0.7);
        assert_eq!(scorer.recency(&aged(60)), 0.5);
        assert_eq!(scorer.recency(&aged(400)), 0.3);
        assert_eq!(scorer.recency(&ScoringInput::default()), 0.5);

        let garbage = ScoringInput {
            timestamp: Some("last tuesday".to_string()),
            ..Default::default()
        };
        assert_eq!(scorer.recency(&garbage), 0.5);
    }

    #[test]
    fn test_data_quality_increments() {
        let scorer = ConfidenceScorer::new();
        assert_eq!(scorer.data_quality(&ScoringInput::default()), 0.0);

        let full = ScoringInput::from_json(&json!({
            "content": "x".repeat(150),
            "sources": ["https://reuters.com/a"],
            "timestamp": "2024-05-01T00:00:00Z",
            "structured_data": {"market_size": 12},
            "metadata": {"agent": "market"}
        }));
        assert!((scorer.data_quality(&full) - 1.0).abs() < 1e-9);

        let short = ScoringInput::from_json(&json!({
            "content": "too short",
            "sources": [],
            "metadata": {}
        }));
        assert_eq!(scorer.data_quality(&short), 0.0);
    }

    #[test]
    fn test_aggregate_averages_factors() {
        let scorer = ConfidenceScorer::new();
        let fresh = (Utc::now()).to_rfc3339();
        let values = vec![
            json!({"content": "x".repeat(150), "source": "https://reuters.com/a", "timestamp": fresh}),
            json!({"source": "https://someblog.io"}),
        ];
        // quality: (0.4 + 0.0) / 2, authority: (0.9 + 0.4) / 2, recency: (1.0 + 0.5) / 2
        let expected = 0.2 * 0.40 + 0.65 * 0.35 + 0.75 * 0.25;
        let score = scorer.score_values(&values);
        assert!((score - expected).abs() < 1e-9, "{score} != {expected}");
    }

    #[test]
    fn test_malformed_input_is_neutral() {
        let scorer = ConfidenceScorer::new();
        assert_eq!(scorer.score_values(&[json!("not an object")]), 0.5);
        assert_eq!(scorer.score_values(&[json!({}), json!(42)]), 0.5);
    }

    #[test]
    fn test_panicking_computation_degrades() {
        assert_eq!(guarded("test", || panic!("boom")), NEUTRAL_SCORE);
        assert_eq!(guarded("test", || f64::NAN), NEUTRAL_SCORE);
    }

    #[test]
    fn test_scores_stay_in_unit_range() {
        let scorer = ConfidenceScorer::new();
        let result = AgentResult::success("m", "x".repeat(300), 0.8, vec!["a".into()], vec![]);
        let score = scorer.score_results(&[result]);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_naive_timestamps_parse() {
        assert!(parse_timestamp("2024-03-01T10:00:00").is_some());
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("\"2024-03-01T10:00:00Z\"").is_some());
        assert!(parse_timestamp("03/01/2024").is_none());
    }
}
