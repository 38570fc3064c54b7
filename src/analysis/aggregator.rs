//! Consensus aggregation over agent results.
//!
//! This module merges the insights and recommendations of several agents
//! into one ranked, deduplicated consensus. Confidence-weighted ranking
//! (the weighted-average method) is `ConfidenceBased`.

use crate::models::{AgentResult, ConsensusResult, ModelContribution};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Default word-overlap threshold for clustering near-duplicates.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Word overlap another result must exceed to validate an expert item.
pub const DEFAULT_VALIDATION_THRESHOLD: f64 = 0.7;

/// Default number of items kept per consensus list.
pub const DEFAULT_MAX_ITEMS: usize = 5;

/// Strategy used to build the consensus.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ConsensusMethod {
    /// Items weighted by the confidence of the results proposing them.
    #[default]
    ConfidenceBased,
    /// Items supported by at least half of the successful results.
    MajorityVote,
    /// Near-duplicate items grouped by word overlap.
    ClusteringBased { similarity_threshold: f64 },
    /// Items of the most confident result that at least one other result
    /// repeats with word overlap above the threshold.
    ExpertValidation { similarity_threshold: f64 },
}

impl ConsensusMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusMethod::ConfidenceBased => "confidence_based",
            ConsensusMethod::MajorityVote => "majority_vote",
            ConsensusMethod::ClusteringBased { .. } => "clustering_based",
            ConsensusMethod::ExpertValidation { .. } => "expert_validation",
        }
    }
}

impl fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Merges agent results into a `ConsensusResult`.
#[derive(Debug, Clone)]
pub struct ConsensusAggregator {
    max_items: usize,
}

impl Default for ConsensusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

/// Which list of an `AgentResult` is being merged.
#[derive(Clone, Copy)]
enum Field {
    Insights,
    Recommendations,
}

impl Field {
    fn items(self, result: &AgentResult) -> &[String] {
        match self {
            Field::Insights => &result.insights,
            Field::Recommendations => &result.recommendations,
        }
    }
}

/// One distinct (normalized) item and who proposed it.
struct Candidate {
    text: String,
    /// Confidence of each distinct result that proposed the item.
    supporters: Vec<f64>,
    /// Order of first appearance, used as the final tie-breaker.
    first_seen: usize,
}

impl Candidate {
    fn support(&self) -> usize {
        self.supporters.len()
    }

    fn weight(&self) -> f64 {
        self.supporters.iter().sum()
    }

    fn mean_confidence(&self) -> f64 {
        if self.supporters.is_empty() {
            0.0
        } else {
            self.weight() / self.supporters.len() as f64
        }
    }
}

impl ConsensusAggregator {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
        }
    }

    /// Builds the consensus. Failed results never contribute content but
    /// always appear in the contribution summary.
    pub fn aggregate(&self, results: &[AgentResult], method: &ConsensusMethod) -> ConsensusResult {
        let contributions: Vec<ModelContribution> =
            results.iter().map(ModelContribution::from).collect();
        let successful: Vec<&AgentResult> = results.iter().filter(|r| r.is_success()).collect();

        debug!(
            method = method.name(),
            successful = successful.len(),
            failed = results.len() - successful.len(),
            "Aggregating agent results"
        );

        if successful.is_empty() {
            return ConsensusResult {
                insights: Vec::new(),
                recommendations: Vec::new(),
                consensus_confidence: 0.0,
                method: method.name().to_string(),
                contributions,
            };
        }

        let (insights, recommendations, confidence) = match method {
            ConsensusMethod::ConfidenceBased => (
                self.confidence_ranked(&successful, Field::Insights),
                self.confidence_ranked(&successful, Field::Recommendations),
                mean_confidence(&successful),
            ),
            ConsensusMethod::MajorityVote => (
                self.majority(&successful, Field::Insights),
                self.majority(&successful, Field::Recommendations),
                mean_confidence(&successful),
            ),
            ConsensusMethod::ClusteringBased {
                similarity_threshold,
            } => (
                self.clustered(&successful, Field::Insights, *similarity_threshold),
                self.clustered(&successful, Field::Recommendations, *similarity_threshold),
                mean_confidence(&successful),
            ),
            ConsensusMethod::ExpertValidation {
                similarity_threshold,
            } => {
                let (expert, others) = split_expert(&successful);
                (
                    self.validated(expert, &others, Field::Insights, *similarity_threshold),
                    self.validated(expert, &others, Field::Recommendations, *similarity_threshold),
                    expert.confidence,
                )
            }
        };

        ConsensusResult {
            insights,
            recommendations,
            consensus_confidence: confidence.clamp(0.0, 1.0),
            method: method.name().to_string(),
            contributions,
        }
    }

    fn confidence_ranked(&self, results: &[&AgentResult], field: Field) -> Vec<String> {
        let mut candidates = collect_candidates(results, field);
        candidates.sort_by(|a, b| {
            b.weight()
                .total_cmp(&a.weight())
                .then(b.support().cmp(&a.support()))
                .then(a.first_seen.cmp(&b.first_seen))
        });
        self.take(candidates.into_iter().map(|c| c.text))
    }

    fn majority(&self, results: &[&AgentResult], field: Field) -> Vec<String> {
        let threshold = results.len().div_ceil(2);
        let mut candidates: Vec<Candidate> = collect_candidates(results, field)
            .into_iter()
            .filter(|c| c.support() >= threshold)
            .collect();
        candidates.sort_by(|a, b| {
            b.support()
                .cmp(&a.support())
                .then(b.mean_confidence().total_cmp(&a.mean_confidence()))
                .then(a.first_seen.cmp(&b.first_seen))
        });
        self.take(candidates.into_iter().map(|c| c.text))
    }

    fn clustered(&self, results: &[&AgentResult], field: Field, threshold: f64) -> Vec<String> {
        // (text, word set, confidence of the proposing result, result index)
        let mut items: Vec<(String, HashSet<String>, f64, usize)> = Vec::new();
        for (ri, result) in results.iter().enumerate() {
            for text in field.items(result) {
                if normalize_text(text).is_empty() {
                    continue;
                }
                items.push((text.clone(), word_set(text), result.confidence, ri));
            }
        }

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for idx in 0..items.len() {
            let home = clusters.iter().position(|members| {
                members
                    .iter()
                    .any(|&m| jaccard(&items[m].1, &items[idx].1) >= threshold)
            });
            match home {
                Some(c) => clusters[c].push(idx),
                None => clusters.push(vec![idx]),
            }
        }

        // Size is the number of distinct results behind a cluster, so one
        // result repeating itself does not outrank agreement.
        let mut ranked: Vec<(usize, f64, usize, &str)> = clusters
            .iter()
            .map(|members| {
                let proposers: HashSet<usize> = members.iter().map(|&m| items[m].3).collect();
                let mean = members.iter().map(|&m| items[m].2).sum::<f64>() / members.len() as f64;
                // Representative: member proposed with the highest confidence.
                let rep = members
                    .iter()
                    .copied()
                    .max_by(|&a, &b| items[a].2.total_cmp(&items[b].2).then(b.cmp(&a)))
                    .unwrap_or(members[0]);
                (proposers.len(), mean, members[0], items[rep].0.as_str())
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.total_cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });

        self.take(ranked.into_iter().map(|(_, _, _, text)| text.to_string()))
    }

    fn validated(
        &self,
        expert: &AgentResult,
        others: &[&AgentResult],
        field: Field,
        threshold: f64,
    ) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let kept = field.items(expert).iter().filter(|text| {
            let key = normalize_text(text);
            if key.is_empty() || !seen.insert(key) {
                return false;
            }
            let words = word_set(text);
            others.iter().any(|other| {
                field
                    .items(other)
                    .iter()
                    .any(|o| jaccard(&words, &word_set(o)) > threshold)
            })
        });
        self.take(kept.map(|text| text.trim().to_string()))
    }

    fn take(&self, items: impl Iterator<Item = String>) -> Vec<String> {
        items.take(self.max_items).collect()
    }
}

/// Groups items by normalized text, counting each result at most once.
fn collect_candidates(results: &[&AgentResult], field: Field) -> Vec<Candidate> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut order = 0;

    for result in results {
        let mut seen_here: HashSet<String> = HashSet::new();
        for text in field.items(result) {
            let key = normalize_text(text);
            if key.is_empty() || !seen_here.insert(key.clone()) {
                continue;
            }
            match index.get(&key) {
                Some(&i) => candidates[i].supporters.push(result.confidence),
                None => {
                    index.insert(key, candidates.len());
                    candidates.push(Candidate {
                        text: text.trim().to_string(),
                        supporters: vec![result.confidence],
                        first_seen: order,
                    });
                }
            }
            order += 1;
        }
    }

    candidates
}

/// The most confident result (first on ties) and everyone else.
/// `results` must not be empty.
fn split_expert<'a>(results: &[&'a AgentResult]) -> (&'a AgentResult, Vec<&'a AgentResult>) {
    let mut best = 0;
    for (i, result) in results.iter().enumerate() {
        if result.confidence > results[best].confidence {
            best = i;
        }
    }
    let others = results
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best)
        .map(|(_, r)| *r)
        .collect();
    (results[best], others)
}

fn mean_confidence(results: &[&AgentResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64
}

/// Removes one leading bullet (`-`, `*`, `•`) or ordinal (`1.`, `2)`).
/// Any other leading number is content and stays.
pub fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start();
    if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        return rest.trim_start();
    }

    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() < line.len() {
        if let Some(after) = rest.strip_prefix(['.', ')']) {
            if after.is_empty() || after.starts_with(char::is_whitespace) {
                return after.trim_start();
            }
        }
    }
    line
}

/// Lowercases, strips a list marker and punctuation, collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = strip_list_marker(text)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn word_set(text: &str) -> HashSet<String> {
    normalize_text(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two word sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(model: &str, confidence: f64, insights: &[&str], recs: &[&str]) -> AgentResult {
        AgentResult::success(
            model,
            "analysis",
            confidence,
            insights.iter().map(|s| s.to_string()).collect(),
            recs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_no_successful_results() {
        let results = vec![
            AgentResult::failed("a", "timeout"),
            AgentResult::failed("b", "HTTP 401"),
        ];
        let consensus =
            ConsensusAggregator::default().aggregate(&results, &ConsensusMethod::MajorityVote);

        assert_eq!(consensus.consensus_confidence, 0.0);
        assert!(consensus.insights.is_empty());
        assert!(consensus.recommendations.is_empty());
        assert_eq!(consensus.contributions.len(), 2);
        assert_eq!(consensus.method, "majority_vote");
    }

    #[test]
    fn test_confidence_based_excludes_failures() {
        let results = vec![
            result("a", 0.9, &["Demand is growing"], &["Enter the market"]),
            result("b", 0.6, &["Demand is growing!"], &[]),
            result("c", 0.3, &["Margins are thin"], &[]),
            AgentResult::failed("d", "timeout after 3 attempt(s)"),
        ];
        let consensus =
            ConsensusAggregator::default().aggregate(&results, &ConsensusMethod::ConfidenceBased);

        assert_eq!(consensus.contributing_models(), 3);
        assert_eq!(consensus.failed_models(), 1);
        // Plain mean of the successful results; weighting only ranks items.
        assert!((consensus.consensus_confidence - 0.6).abs() < 1e-9);
        assert_eq!(
            consensus.insights,
            vec!["Demand is growing".to_string(), "Margins are thin".to_string()]
        );
        assert_eq!(consensus.recommendations, vec!["Enter the market".to_string()]);
    }

    #[test]
    fn test_majority_vote_threshold() {
        let results = vec![
            result("a", 0.5, &["Shared insight", "Only in a"], &[]),
            result("b", 0.7, &["shared insight", "Pair insight"], &[]),
            result("c", 0.9, &["Pair insight"], &[]),
            result("d", 0.4, &["Lonely"], &[]),
        ];
        let consensus =
            ConsensusAggregator::default().aggregate(&results, &ConsensusMethod::MajorityVote);

        // Both have support 2 of 4; "Pair insight" wins on mean confidence.
        assert_eq!(
            consensus.insights,
            vec!["Pair insight".to_string(), "Shared insight".to_string()]
        );
        assert!((consensus.consensus_confidence - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_majority_counts_each_result_once() {
        let results = vec![
            result("a", 0.5, &["Repeat", "repeat", "REPEAT"], &[]),
            result("b", 0.5, &["Other"], &[]),
            result("c", 0.5, &["Else"], &[]),
        ];
        let consensus =
            ConsensusAggregator::default().aggregate(&results, &ConsensusMethod::MajorityVote);
        assert!(consensus.insights.is_empty());
    }

    #[test]
    fn test_clustering_groups_near_duplicates() {
        let results = vec![
            result("a", 0.6, &["Strong demand for outdoor living products"], &[]),
            result("b", 0.9, &["Strong demand for outdoor living products in 2024"], &[]),
            result("c", 0.5, &["Aluminium prices are volatile"], &[]),
        ];
        let method = ConsensusMethod::ClusteringBased {
            similarity_threshold: 0.6,
        };
        let consensus = ConsensusAggregator::default().aggregate(&results, &method);

        assert_eq!(consensus.insights.len(), 2);
        assert_eq!(
            consensus.insights[0],
            "Strong demand for outdoor living products in 2024"
        );
        assert_eq!(consensus.insights[1], "Aluminium prices are volatile");
    }

    #[test]
    fn test_clustering_threshold_is_tunable() {
        let results = vec![
            result("a", 0.6, &["Strong demand for pergolas"], &[]),
            result("b", 0.6, &["Strong demand for gazebos"], &[]),
        ];
        let strict = ConsensusMethod::ClusteringBased {
            similarity_threshold: 0.9,
        };
        let loose = ConsensusMethod::ClusteringBased {
            similarity_threshold: 0.5,
        };
        let aggregator = ConsensusAggregator::default();
        assert_eq!(aggregator.aggregate(&results, &strict).insights.len(), 2);
        assert_eq!(aggregator.aggregate(&results, &loose).insights.len(), 1);
    }

    #[test]
    fn test_max_items_cap() {
        let insights: Vec<String> = (0..10).map(|i| format!("distinct insight {}", i)).collect();
        let refs: Vec<&str> = insights.iter().map(String::as_str).collect();
        let results = vec![result("a", 0.8, &refs, &[])];
        let consensus =
            ConsensusAggregator::new(3).aggregate(&results, &ConsensusMethod::ConfidenceBased);
        assert_eq!(consensus.insights.len(), 3);
    }

    #[test]
    fn test_clustering_counts_distinct_results() {
        let results = vec![
            result(
                "a",
                0.9,
                &[
                    "Aluminium pergolas dominate premium sales",
                    "Aluminium pergolas dominate premium sales today",
                    "Aluminium pergolas dominate the premium sales",
                ],
                &[],
            ),
            result("b", 0.5, &["Installers are in short supply"], &[]),
            result("c", 0.5, &["Installers are in short supply locally"], &[]),
        ];
        let consensus = ConsensusAggregator::default()
            .aggregate(&results, &ConsensusMethod::ClusteringBased {
                similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            });

        assert_eq!(consensus.insights.len(), 2);
        assert!(consensus.insights[0].starts_with("Installers are in short supply"));
    }

    #[test]
    fn test_expert_validation_keeps_confirmed_items() {
        let results = vec![
            result(
                "expert",
                0.9,
                &["Demand for aluminium pergolas is rising", "Tariffs will fall next year"],
                &["Open a showroom in Lyon"],
            ),
            result("peer", 0.6, &["demand for aluminium pergolas is rising fast"], &[]),
            result("other", 0.4, &["Margins are thin"], &["Open a showroom in Lyon"]),
            AgentResult::failed("down", "timeout"),
        ];
        let method = ConsensusMethod::ExpertValidation {
            similarity_threshold: DEFAULT_VALIDATION_THRESHOLD,
        };
        let consensus = ConsensusAggregator::default().aggregate(&results, &method);

        assert_eq!(consensus.method, "expert_validation");
        assert_eq!(consensus.insights, vec!["Demand for aluminium pergolas is rising".to_string()]);
        assert_eq!(consensus.recommendations, vec!["Open a showroom in Lyon".to_string()]);
        assert!((consensus.consensus_confidence - 0.9).abs() < 1e-9);
        assert_eq!(consensus.contributions.len(), 4);
    }

    #[test]
    fn test_expert_validation_needs_a_second_result() {
        let results = vec![result("solo", 0.8, &["Demand is rising"], &["Enter now"])];
        let method = ConsensusMethod::ExpertValidation {
            similarity_threshold: DEFAULT_VALIDATION_THRESHOLD,
        };
        let consensus = ConsensusAggregator::default().aggregate(&results, &method);

        assert!(consensus.insights.is_empty());
        assert!(consensus.recommendations.is_empty());
        assert!((consensus.consensus_confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_items_differing_by_number_stay_apart() {
        let results = vec![
            result("a", 0.8, &["10% growth expected"], &[]),
            result("b", 0.7, &["30% growth expected"], &[]),
            result("c", 0.6, &["3. 10% growth expected"], &[]),
        ];
        let consensus =
            ConsensusAggregator::default().aggregate(&results, &ConsensusMethod::ConfidenceBased);

        assert_eq!(
            consensus.insights,
            vec!["10% growth expected".to_string(), "30% growth expected".to_string()]
        );
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("1. Demand is Growing!"), "demand is growing");
        assert_eq!(normalize_text("2) Demand is Growing"), "demand is growing");
        assert_eq!(normalize_text("  - Margins,   thin "), "margins thin");
        assert_eq!(normalize_text("• Margins thin"), "margins thin");
        assert_eq!(normalize_text("10% growth expected"), "10 growth expected");
        assert_eq!(normalize_text("2024 was a record year"), "2024 was a record year");
        assert_eq!(normalize_text("1.5 million units shipped"), "1 5 million units shipped");
        assert_eq!(normalize_text("***"), "");
    }

    #[test]
    fn test_strip_list_marker() {
        assert_eq!(strip_list_marker("3. Costs are stable"), "Costs are stable");
        assert_eq!(strip_list_marker("12) Costs"), "Costs");
        assert_eq!(strip_list_marker("* Costs"), "Costs");
        assert_eq!(strip_list_marker("10% of buyers"), "10% of buyers");
        assert_eq!(strip_list_marker("1.5x revenue"), "1.5x revenue");
    }

    #[test]
    fn test_method_serde_tag() {
        let method = ConsensusMethod::ClusteringBased {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        };
        let json = serde_json::to_value(method).unwrap();
        assert_eq!(json["method"], "clustering_based");
        assert_eq!(json["similarity_threshold"], 0.6);

        let json = serde_json::to_value(ConsensusMethod::ExpertValidation {
            similarity_threshold: 0.7,
        })
        .unwrap();
        assert_eq!(json["method"], "expert_validation");
    }
}
