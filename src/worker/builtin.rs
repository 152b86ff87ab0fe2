//! Built-in worker units that can be declared in configuration.
//!
//! Neither carries domain logic: one reports on a cached source, the other
//! digests the results of earlier stages.

use super::WorkerUnit;
use crate::cache::FreshnessCache;
use crate::models::{WorkContext, WorkOutput};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Reports the current snapshot of one cached source.
///
/// Confidence falls from 1.0 (just fetched) to 0.5 as the entry approaches
/// its staleness threshold, and is 0.25 once stale.
pub struct SourceSnapshotWorker {
    id: String,
    source: String,
    cache: Arc<FreshnessCache>,
    required: Vec<String>,
}

impl SourceSnapshotWorker {
    pub fn new(id: impl Into<String>, source: impl Into<String>, cache: Arc<FreshnessCache>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            cache,
            required: Vec::new(),
        }
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required = fields;
        self
    }
}

#[async_trait]
impl WorkerUnit for SourceSnapshotWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn required_fields(&self) -> &[String] {
        &self.required
    }

    async fn process(&self, _ctx: &WorkContext) -> Result<WorkOutput> {
        let descriptor = self
            .cache
            .descriptor(&self.source)
            .ok_or_else(|| anyhow!("unknown source '{}'", self.source))?;
        let hit = self
            .cache
            .get(&self.source)
            .ok_or_else(|| anyhow!("no data cached for source '{}'", self.source))?;

        let threshold = descriptor.refresh_interval.as_secs_f64() * 1.5;
        let confidence = if hit.is_stale {
            0.25
        } else if threshold > 0.0 {
            1.0 - 0.5 * (hit.age.as_secs_f64() / threshold)
        } else {
            1.0
        };

        let reasoning = format!(
            "Source '{}' snapshot is {:.0}s old ({})",
            self.source,
            hit.age.as_secs_f64(),
            if hit.is_stale { "stale" } else { "fresh" }
        );

        let payload = json!({
            "source": self.source,
            "data": hit.entry.payload,
            "fetched_at": hit.entry.fetched_at,
            "age_seconds": hit.age.as_secs_f64(),
            "is_stale": hit.is_stale,
        });

        Ok(WorkOutput::new(payload, confidence, reasoning).with_evidence([self.source.clone()]))
    }
}

/// Summarizes every successful result of the stages before it.
pub struct StageDigestWorker {
    id: String,
    required: Vec<String>,
}

impl StageDigestWorker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: Vec::new(),
        }
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required = fields;
        self
    }
}

#[async_trait]
impl WorkerUnit for StageDigestWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn required_fields(&self) -> &[String] {
        &self.required
    }

    async fn process(&self, ctx: &WorkContext) -> Result<WorkOutput> {
        let prior: Vec<_> = ctx.completed().iter().filter(|r| r.succeeded).collect();
        if prior.is_empty() {
            bail!("no successful earlier results to digest");
        }

        let confidence = prior.iter().map(|r| r.confidence).sum::<f64>() / prior.len() as f64;
        let workers: Vec<&str> = prior.iter().map(|r| r.worker_id.as_str()).collect();
        let failed = ctx.completed().len() - prior.len();

        let mut evidence = Vec::new();
        for source in prior.iter().flat_map(|r| &r.evidence) {
            if !evidence.contains(source) {
                evidence.push(source.clone());
            }
        }

        let insight = format!(
            "{} of {} earlier units agree at {:.0}% mean confidence",
            prior.len(),
            ctx.completed().len(),
            confidence * 100.0
        );

        Ok(WorkOutput::new(
            json!({
                "workers": workers,
                "failed_earlier": failed,
                "key_insight": insight,
            }),
            confidence,
            format!("Digested {} for '{}'", workers.join(", "), ctx.query),
        )
        .with_evidence(evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::models::{SourceDescriptor, WorkResult};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ctx(completed: Vec<WorkResult>) -> WorkContext {
        WorkContext::new(
            "req".to_string(),
            "general".to_string(),
            "weekly outlook".to_string(),
            Arc::new(BTreeMap::new()),
            1,
            Arc::new(completed),
        )
    }

    fn cache() -> Arc<FreshnessCache> {
        Arc::new(FreshnessCache::new(vec![SourceDescriptor::new(
            "odds",
            Duration::from_secs(10),
            Duration::from_secs(2),
        )]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_confidence_tracks_age() {
        let cache = cache();
        cache.put("odds", json!({"spread": -3})).unwrap();
        let worker = SourceSnapshotWorker::new("odds_snapshot", "odds", Arc::clone(&cache));

        let fresh = worker.process(&ctx(vec![])).await.unwrap();
        assert_eq!(fresh.confidence, 1.0);
        assert_eq!(fresh.evidence, vec!["odds"]);
        assert_eq!(fresh.payload["data"]["spread"], -3);

        tokio::time::advance(Duration::from_secs(15)).await;
        let edge = worker.process(&ctx(vec![])).await.unwrap();
        assert!((edge.confidence - 0.5).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(1)).await;
        let stale = worker.process(&ctx(vec![])).await.unwrap();
        assert_eq!(stale.confidence, 0.25);
        assert!(stale.reasoning.contains("stale"));
    }

    #[tokio::test]
    async fn test_snapshot_fails_without_data() {
        let worker = SourceSnapshotWorker::new("odds_snapshot", "odds", cache());
        let err = worker.process(&ctx(vec![])).await.unwrap_err();
        assert!(err.to_string().contains("no data cached"));
    }

    #[tokio::test]
    async fn test_digest_uses_only_successes() {
        let ok = |id: &str, c: f64, ev: &str| {
            WorkResult::success(
                id,
                0,
                WorkOutput::new(json!({}), c, "ok").with_evidence([ev]),
                Duration::ZERO,
            )
        };
        let failed = WorkResult::failure(
            "c",
            0,
            &WorkerError::Failed("down".to_string()),
            Duration::ZERO,
        );

        let worker = StageDigestWorker::new("digest");
        let out = worker
            .process(&ctx(vec![ok("a", 0.6, "x"), failed, ok("b", 0.8, "x")]))
            .await
            .unwrap();

        assert!((out.confidence - 0.7).abs() < 1e-9);
        assert_eq!(out.evidence, vec!["x"]);
        assert_eq!(out.payload["failed_earlier"], 1);
        assert!(out.payload["key_insight"].as_str().unwrap().starts_with("2 of 3"));
    }

    #[tokio::test]
    async fn test_digest_fails_on_first_stage() {
        let worker = StageDigestWorker::new("digest");
        assert!(worker.process(&ctx(vec![])).await.is_err());
    }
}
