//! Read-only analytical framework: segments and the factors they cover.
//!
//! The interpret stage lists the segments as focus areas in the research
//! prompt. The scoring stage measures how much of the consensus touches
//! each segment.

use crate::config::SegmentConfig;
use crate::models::SegmentCoverage;
use std::collections::HashSet;

/// Words that carry no signal when matching factor names.
const STOPWORDS: &[&str] = &["and", "the", "for", "with", "from", "into", "over"];

/// One framework segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub factors: Vec<String>,
    keywords: HashSet<String>,
}

impl Segment {
    pub fn new(name: impl Into<String>, factors: Vec<String>) -> Self {
        let name = name.into();
        let keywords = std::iter::once(name.as_str())
            .chain(factors.iter().map(String::as_str))
            .flat_map(tokenize)
            .collect();
        Self {
            name,
            factors,
            keywords,
        }
    }

    /// Whether `text` mentions any word of this segment or its factors.
    pub fn matches(&self, text: &str) -> bool {
        tokenize(text).any(|word| self.keywords.contains(&word))
    }
}

/// Ordered set of segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Framework {
    segments: Vec<Segment>,
}

impl Default for Framework {
    fn default() -> Self {
        let segment = |name: &str, factors: &[&str]| {
            Segment::new(name, factors.iter().map(|f| f.to_string()).collect())
        };
        Self {
            segments: vec![
                segment(
                    "Consumer",
                    &[
                        "Consumer Demand & Need",
                        "Consumer Behavior & Habits",
                        "Consumer Loyalty & Retention",
                        "Consumer Perception & Sentiment",
                        "Consumer Adoption & Engagement",
                    ],
                ),
                segment(
                    "Market",
                    &[
                        "Market Size & Growth",
                        "Market Trends & Opportunities",
                        "Competitive Landscape",
                        "Regulatory Environment",
                        "Market Risks & Challenges",
                    ],
                ),
                segment(
                    "Product",
                    &[
                        "Features & Functionality",
                        "Innovation & Differentiation",
                        "Value Proposition",
                        "Business Resilience",
                        "Product Quality & Assurance",
                    ],
                ),
                segment(
                    "Brand",
                    &[
                        "Brand Awareness & Recognition",
                        "Brand Equity Profile",
                        "Brand Positioning Strategy",
                        "Brand Messaging & Communication",
                        "Brand Monetization Model",
                    ],
                ),
                segment(
                    "Experience",
                    &[
                        "User Experience & Design",
                        "Customer Journey Mapping",
                        "Customer Support & Service",
                        "Post-Purchase Loyalty & Advocacy",
                        "Customer Engagement & Community",
                    ],
                ),
            ],
        }
    }
}

impl Framework {
    /// Framework from configuration, or the built-in one when none is given.
    pub fn from_config(segments: &[SegmentConfig]) -> Self {
        if segments.is_empty() {
            return Self::default();
        }
        Self {
            segments: segments
                .iter()
                .map(|s| Segment::new(s.name.clone(), s.factors.clone()))
                .collect(),
        }
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    /// Share of `items` touching each segment, in framework order.
    pub fn coverage(&self, items: &[String]) -> Vec<SegmentCoverage> {
        self.segments
            .iter()
            .map(|segment| {
                let matched_items = items.iter().filter(|item| segment.matches(item)).count();
                let coverage = if items.is_empty() {
                    0.0
                } else {
                    matched_items as f64 / items.len() as f64
                };
                SegmentCoverage {
                    segment: segment.name.clone(),
                    matched_items,
                    coverage,
                }
            })
            .collect()
    }
}

/// Lowercased words of at least four letters, minus stopwords.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}
