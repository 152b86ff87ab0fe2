//! Markdown and JSON report generation.
//!
//! This module renders run outcomes, scheduler status and worker health
//! for the CLI.

use crate::models::{FinalOutcome, NarrativeSource, SchedulerStatus, WorkResult};
use crate::worker::HealthReport;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Generate a complete Markdown report for one run.
pub fn generate_markdown_report(outcome: &FinalOutcome) -> String {
    let mut output = String::new();

    output.push_str("# Cadence Run Report\n\n");
    output.push_str(&generate_metadata_section(outcome));
    output.push_str(&generate_narrative_section(outcome));
    output.push_str(&generate_insights_section(&outcome.key_insights));
    output.push_str(&generate_evidence_section(&outcome.evidence));
    output.push_str(&generate_breakdown_section(&outcome.breakdown));
    output.push_str(&generate_errors_section(outcome));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(outcome: &FinalOutcome) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Request:** `{}`\n", outcome.request_id));
    section.push_str(&format!("- **Category:** {}\n", outcome.category));
    section.push_str(&format!(
        "- **Completed:** {}\n",
        outcome.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Confidence:** {:.0}%\n",
        outcome.confidence * 100.0
    ));
    section.push_str(&format!(
        "- **Workers:** {} succeeded, {} failed across {} stages\n",
        outcome.succeeded, outcome.failed, outcome.stages_executed
    ));
    section.push_str(&format!(
        "- **Duration:** {:.2}s\n\n",
        outcome.total_elapsed.as_secs_f64()
    ));

    section
}

fn generate_narrative_section(outcome: &FinalOutcome) -> String {
    let mut section = String::new();

    section.push_str("## Narrative\n\n");
    section.push_str(outcome.narrative.trim());
    section.push_str("\n\n");
    if outcome.narrative_source == NarrativeSource::PostProcessed {
        section.push_str("*Narrative post-processed.*\n\n");
    }

    section
}

fn generate_insights_section(insights: &[String]) -> String {
    if insights.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Key Insights\n\n");
    for (i, insight) in insights.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, insight));
    }
    section.push('\n');

    section
}

fn generate_evidence_section(evidence: &[String]) -> String {
    if evidence.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Evidence\n\n");
    for item in evidence {
        section.push_str(&format!("- {}\n", item));
    }
    section.push('\n');

    section
}

/// Generate the per-worker breakdown table.
fn generate_breakdown_section(results: &[WorkResult]) -> String {
    let mut section = String::new();

    section.push_str("## Worker Breakdown\n\n");

    if results.is_empty() {
        section.push_str("No worker units ran for this request.\n\n");
        return section;
    }

    section.push_str("| Stage | Worker | Status | Confidence | Elapsed | Reasoning |\n");
    section.push_str("|:---:|:---|:---:|:---:|---:|:---|\n");

    for result in results {
        let status = if result.succeeded { "✅ ok" } else { "❌ failed" };
        section.push_str(&format!(
            "| {} | `{}` | {} | {:.2} | {}ms | {} |\n",
            result.stage,
            result.worker_id,
            status,
            result.confidence,
            result.elapsed.as_millis(),
            escape_cell(&result.reasoning)
        ));
    }
    section.push('\n');

    section
}

fn generate_errors_section(outcome: &FinalOutcome) -> String {
    if outcome.errors.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Errors\n\n");
    for entry in &outcome.errors {
        section.push_str(&format!("- {}\n", entry));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by Cadence v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Render scheduler status as a Markdown table.
pub fn generate_status_markdown(status: &SchedulerStatus) -> String {
    let mut output = String::new();

    output.push_str("# Source Freshness\n\n");
    output.push_str(&format!(
        "- **Scheduler:** {}\n- **Sources:** {} ({} active loops, {} stale)\n\n",
        if status.running { "running" } else { "stopped" },
        status.total_sources,
        status.active_loops,
        status.stale_count()
    ));

    if status.sources.is_empty() {
        output.push_str("No sources configured.\n");
        return output;
    }

    output.push_str("| Source | Data | Last Updated | Age | State |\n");
    output.push_str("|:---|:---:|:---|---:|:---:|\n");

    for source in &status.sources {
        let last_updated = source
            .last_updated
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let age = source
            .age
            .map(|a| format!("{:.1}s", a.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        let state = if source.is_stale { "🔴 stale" } else { "🟢 fresh" };

        output.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            source.name,
            if source.has_data { "yes" } else { "no" },
            last_updated,
            age,
            state
        ));
    }

    output
}

/// Render worker health as a Markdown table.
pub fn generate_health_markdown(reports: &[HealthReport]) -> String {
    let mut output = String::new();

    output.push_str("# Worker Health\n\n");

    if reports.is_empty() {
        output.push_str("No worker units registered.\n");
        return output;
    }

    output.push_str("| Worker | Calls | Success | Avg Latency | Errors | Healthy |\n");
    output.push_str("|:---|---:|---:|---:|---:|:---:|\n");

    for report in reports {
        output.push_str(&format!(
            "| `{}` | {} | {:.0}% | {:.1}ms | {} | {} |\n",
            report.worker_id,
            report.calls,
            report.success_ratio * 100.0,
            report.avg_latency_ms,
            report.error_count,
            if report.healthy { "yes" } else { "no" }
        ));
    }

    output
}

/// Generate a JSON rendering of any report value.
pub fn generate_json_report<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}

/// Write rendered report content to a file.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
