//! Result aggregation.
//!
//! Folds the results of one run into a [`FinalOutcome`]. Everything here is
//! deterministic: the same results in the same order give the same outcome.

use crate::models::{FinalOutcome, NarrativeSource, RunState, WorkResult};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Maximum number of key insights kept on an outcome.
pub const MAX_KEY_INSIGHTS: usize = 5;

/// Build the final outcome of a run.
pub fn aggregate(
    request_id: &str,
    category: &str,
    state: &RunState,
    total_elapsed: Duration,
) -> FinalOutcome {
    let results = ordered_results(state.results());
    let succeeded = results.iter().filter(|r| r.succeeded).count();

    FinalOutcome {
        request_id: request_id.to_string(),
        category: category.to_string(),
        confidence: overall_confidence(&results),
        narrative: synthesize_narrative(&results),
        narrative_source: NarrativeSource::Deterministic,
        evidence: merge_evidence(&results),
        key_insights: extract_key_insights(&results, MAX_KEY_INSIGHTS),
        succeeded,
        failed: results.len() - succeeded,
        breakdown: results,
        errors: state.errors().to_vec(),
        stages_executed: state.stages_executed(),
        total_elapsed,
        completed_at: Utc::now(),
    }
}

/// Results grouped by stage; the original order is kept within a stage.
fn ordered_results(results: &[WorkResult]) -> Vec<WorkResult> {
    let mut ordered = results.to_vec();
    ordered.sort_by_key(|r| r.stage);
    ordered
}

/// Mean confidence over succeeded results only. Zero when none succeeded.
pub fn overall_confidence(results: &[WorkResult]) -> f64 {
    let confidences: Vec<f64> = results
        .iter()
        .filter(|r| r.succeeded)
        .map(|r| r.confidence)
        .collect();

    if confidences.is_empty() {
        return 0.0;
    }

    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    mean.clamp(0.0, 1.0)
}

/// One line per succeeded unit: `<worker_id>: <reasoning>`.
pub fn synthesize_narrative(results: &[WorkResult]) -> String {
    let lines: Vec<String> = results
        .iter()
        .filter(|r| r.succeeded)
        .map(|r| format!("{}: {}", r.worker_id, r.reasoning.trim()))
        .collect();

    if !lines.is_empty() {
        return lines.join("\n");
    }

    if results.is_empty() {
        "No successful analysis: no worker units were eligible for this request.".to_string()
    } else {
        format!(
            "No successful analysis: all {} worker units failed.",
            results.len()
        )
    }
}

/// Union of succeeded units' evidence, deduplicated, first-seen order.
pub fn merge_evidence(results: &[WorkResult]) -> Vec<String> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| r.succeeded)
        .flat_map(|r| r.evidence.iter())
        .filter(|e| seen.insert(e.as_str()))
        .cloned()
        .collect()
}

/// Collect `recommendations` and `key_insight` entries from succeeded payloads.
pub fn extract_key_insights(results: &[WorkResult], limit: usize) -> Vec<String> {
    let mut insights: Vec<String> = Vec::new();

    let mut push = |text: &str| {
        let text = text.trim();
        if !text.is_empty() && !insights.iter().any(|i| i == text) {
            insights.push(text.to_string());
        }
    };

    for result in results.iter().filter(|r| r.succeeded) {
        if let Some(Value::Array(recommendations)) = result.payload.get("recommendations") {
            for rec in recommendations.iter().filter_map(Value::as_str) {
                push(rec);
            }
        }
        if let Some(insight) = result.payload.get("key_insight").and_then(Value::as_str) {
            push(insight);
        }
    }

    insights.truncate(limit);
    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::models::WorkOutput;
    use serde_json::json;

    fn ok(id: &str, stage: usize, confidence: f64, evidence: &[&str]) -> WorkResult {
        WorkResult::success(
            id,
            stage,
            WorkOutput::new(json!({}), confidence, format!("{} reasoning", id))
                .with_evidence(evidence.iter().copied()),
            Duration::from_millis(1),
        )
    }

    fn failed(id: &str, stage: usize) -> WorkResult {
        WorkResult::failure(
            id,
            stage,
            &WorkerError::Failed("offline".to_string()),
            Duration::from_millis(1),
        )
    }

    fn state(results: Vec<WorkResult>) -> RunState {
        let mut state = RunState::new();
        let mut stage = None;
        for r in results {
            if stage != Some(r.stage) {
                state.begin_stage(r.stage).unwrap();
                state.mark_executed();
                stage = Some(r.stage);
            }
            state.record(r).unwrap();
        }
        state
    }

    #[test]
    fn test_confidence_ignores_failures() {
        let results = vec![ok("a", 0, 0.6, &[]), failed("b", 0), ok("c", 1, 1.0, &[])];
        assert!((overall_confidence(&results) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_zero_without_successes() {
        assert_eq!(overall_confidence(&[]), 0.0);
        assert_eq!(overall_confidence(&[failed("a", 0), failed("b", 1)]), 0.0);
    }

    #[test]
    fn test_confidence_zero_successes_vs_zero_scores() {
        // A success reporting zero confidence still counts toward the mean.
        let results = vec![ok("a", 0, 0.0, &[]), ok("b", 0, 1.0, &[])];
        assert!((overall_confidence(&results) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_evidence_deduplicated_in_first_seen_order() {
        let results = vec![
            ok("a", 0, 0.5, &["odds", "news"]),
            failed("x", 0),
            ok("b", 0, 0.5, &["weather", "odds"]),
            ok("c", 1, 0.5, &["news", "injuries"]),
        ];
        assert_eq!(
            merge_evidence(&results),
            vec!["odds", "news", "weather", "injuries"]
        );
    }

    #[test]
    fn test_narrative_grouped_by_stage() {
        let outcome = aggregate(
            "req",
            "urgent",
            &state(vec![ok("a", 0, 0.5, &[]), failed("b", 0), ok("c", 1, 0.5, &[])]),
            Duration::from_millis(10),
        );

        assert_eq!(outcome.narrative, "a: a reasoning\nc: c reasoning");
        assert_eq!(outcome.narrative_source, NarrativeSource::Deterministic);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.breakdown.len(), 3);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.stages_executed, 2);
    }

    #[test]
    fn test_all_failed_outcome() {
        let outcome = aggregate(
            "req",
            "urgent",
            &state(vec![failed("a", 0), failed("b", 0), failed("c", 1)]),
            Duration::ZERO,
        );

        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.breakdown.len(), 3);
        assert!(outcome.breakdown.iter().all(|r| !r.succeeded));
        assert!(outcome.narrative.contains("No successful analysis"));
        assert!(outcome.evidence.is_empty());
    }

    #[test]
    fn test_empty_run_narrative() {
        let outcome = aggregate("req", "general", &RunState::new(), Duration::ZERO);
        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.narrative.contains("no worker units were eligible"));
    }

    #[test]
    fn test_key_insights() {
        let mut a = ok("a", 0, 0.5, &[]);
        a.payload = json!({
            "recommendations": ["Start the rookie", "Bench the veteran"],
            "key_insight": "Weather is clear",
        });
        let mut b = ok("b", 0, 0.5, &[]);
        b.payload = json!({ "recommendations": ["Start the rookie", "Grab a kicker", "Hold", "Sell high"] });
        let mut c = failed("c", 0);
        c.payload = json!({ "key_insight": "ignored" });

        let insights = extract_key_insights(&[a, b, c], MAX_KEY_INSIGHTS);
        assert_eq!(
            insights,
            vec![
                "Start the rookie",
                "Bench the veteran",
                "Weather is clear",
                "Grab a kicker",
                "Hold",
            ]
        );
    }
}
