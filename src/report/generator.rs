//! Markdown and JSON rendering of analysis output.

use crate::models::{AnalysisOutput, ConsensusResult, ResultStatus, SegmentCoverage};
use anyhow::Result;
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(output: &AnalysisOutput) -> String {
    let mut report = String::new();

    report.push_str("# Strategic Research Report\n\n");
    report.push_str(&generate_metadata_section(output));
    report.push_str(&generate_list_section("Key Insights", &output.consensus.insights));
    report.push_str(&generate_list_section(
        "Recommendations",
        &output.consensus.recommendations,
    ));
    report.push_str(&generate_coverage_section(&output.segment_coverage));
    report.push_str(&generate_contributions_section(&output.consensus));
    report.push_str(&generate_footer());

    report
}

fn generate_metadata_section(output: &AnalysisOutput) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Query:** {}\n", output.query));

    if !output.context.is_empty() {
        let mut keys: Vec<&String> = output.context.keys().collect();
        keys.sort();
        for key in keys {
            section.push_str(&format!("- **{}:** {}\n", key, output.context[key]));
        }
    }

    section.push_str(&format!("- **Analysis ID:** `{}`\n", output.analysis_id));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        output.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Consensus Method:** {}\n",
        output.consensus.method
    ));
    section.push_str(&format!(
        "- **Consensus Confidence:** {:.0}%\n",
        output.consensus.consensus_confidence * 100.0
    ));
    section.push_str(&format!(
        "- **Data Quality Score:** {:.0}%\n",
        output.quality_score * 100.0
    ));
    section.push_str(&format!("- **Estimated Cost:** ${:.4}\n", output.total_cost));
    section.push('\n');

    section
}

fn generate_list_section(title: &str, items: &[String]) -> String {
    let mut section = format!("## {}\n\n", title);

    if items.is_empty() {
        section.push_str("_No consensus was reached._\n\n");
        return section;
    }

    for (i, item) in items.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, item));
    }
    section.push('\n');

    section
}

fn generate_coverage_section(coverage: &[SegmentCoverage]) -> String {
    if coverage.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Framework Coverage\n\n");
    section.push_str("| Segment | Items | Coverage |\n");
    section.push_str("|:---|:---:|:---:|\n");
    for entry in coverage {
        section.push_str(&format!(
            "| {} | {} | {:.0}% |\n",
            entry.segment,
            entry.matched_items,
            entry.coverage * 100.0
        ));
    }
    section.push('\n');

    section
}

fn generate_contributions_section(consensus: &ConsensusResult) -> String {
    let mut section = String::new();

    section.push_str("## Model Contributions\n\n");
    section.push_str(&format!(
        "{} of {} models contributed.\n\n",
        consensus.contributing_models(),
        consensus.contributions.len()
    ));
    section.push_str("| Model | Status | Confidence | Insights | Recommendations |\n");
    section.push_str("|:---|:---:|:---:|:---:|:---:|\n");

    for c in &consensus.contributions {
        let status = match c.status {
            ResultStatus::Success => "✅ success".to_string(),
            ResultStatus::Failed => format!(
                "❌ {}",
                table_cell(c.error.as_deref().unwrap_or("failed"))
            ),
        };
        section.push_str(&format!(
            "| `{}` | {} | {:.2} | {} | {} |\n",
            table_cell(&c.model_name),
            status,
            c.confidence,
            c.insight_count,
            c.recommendation_count
        ));
    }
    section.push('\n');

    section
}

/// Makes free text safe inside one markdown table cell.
fn table_cell(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}

fn generate_footer() -> String {
    format!(
        "---\n\n_Generated by strategist v{}_\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON report.
pub fn generate_json_report(output: &AnalysisOutput) -> Result<String> {
    serde_json::to_string_pretty(output).map_err(Into::into)
}

/// Render in the requested format and write to `path`.
pub fn write_report(output: &AnalysisOutput, path: &Path, json: bool) -> Result<()> {
    let content = if json {
        generate_json_report(output)?
    } else {
        generate_markdown_report(output)
    };
    std::fs::write(path, content)?;
    Ok(())
}
