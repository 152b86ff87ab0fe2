//! Engine wiring.
//!
//! Builds the scheduler, worker registry and orchestrator from a [`Config`]
//! and exposes the operations the CLI needs behind one handle.

use crate::cache::FreshnessCache;
use crate::config::{Config, SourceKind, WorkerKind};
use crate::error::{RefreshError, RunError};
use crate::models::{
    FinalOutcome, FreshData, SchedulerStatus, SourceDescriptor, SourceStatus, WorkRequest,
};
use crate::orchestrator::{ClassifierRule, KeywordClassifier, StageOrchestrator, TableRouter};
use crate::scheduler::{HttpJsonAdapter, RefreshScheduler, SourceAdapter, StaticAdapter};
use crate::worker::{
    HealthReport, HealthThresholds, SourceSnapshotWorker, StageDigestWorker, WorkerRegistry,
    WorkerUnit,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// The assembled engine: refresh scheduler plus stage orchestrator.
#[derive(Debug)]
pub struct Engine {
    scheduler: RefreshScheduler,
    orchestrator: StageOrchestrator,
}

impl Engine {
    pub fn new(scheduler: RefreshScheduler, orchestrator: StageOrchestrator) -> Self {
        Self {
            scheduler,
            orchestrator,
        }
    }

    /// Build every component described by a configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let http_timeout = Duration::from_secs(config.scheduler.http_timeout_secs);
        let mut sources: Vec<(SourceDescriptor, Arc<dyn SourceAdapter>)> = Vec::new();
        for source in &config.sources {
            let adapter: Arc<dyn SourceAdapter> = match source.kind {
                SourceKind::HttpJson => {
                    let url = source.url.clone().unwrap_or_default();
                    Arc::new(HttpJsonAdapter::new(url, http_timeout).with_context(|| {
                        format!("Failed to build adapter for source '{}'", source.name)
                    })?)
                }
                SourceKind::Static => Arc::new(StaticAdapter::new(
                    source.payload.clone().unwrap_or(Value::Null),
                )),
            };
            debug!(source = %source.name, kind = ?source.kind, "Configured source");
            sources.push((SourceDescriptor::from(source), adapter));
        }

        let scheduler = RefreshScheduler::new(
            sources,
            Duration::from_secs(config.scheduler.shutdown_grace_secs),
        );

        let mut registry = WorkerRegistry::new(HealthThresholds::from(&config.health));
        for worker in &config.workers {
            let unit: Arc<dyn WorkerUnit> = match worker.kind {
                WorkerKind::SourceSnapshot => Arc::new(
                    SourceSnapshotWorker::new(
                        worker.id.clone(),
                        worker.source.clone().unwrap_or_default(),
                        Arc::clone(scheduler.cache()),
                    )
                    .with_required_fields(worker.required_fields.clone()),
                ),
                WorkerKind::StageDigest => Arc::new(
                    StageDigestWorker::new(worker.id.clone())
                        .with_required_fields(worker.required_fields.clone()),
                ),
            };
            registry.register(unit)?;
        }

        let router = TableRouter::new(
            config
                .routing
                .routes
                .iter()
                .map(|(category, plan)| (category.clone(), plan.clone()))
                .collect::<HashMap<_, _>>(),
        );
        let classifier = KeywordClassifier::new(
            config.classifier.iter().map(ClassifierRule::from).collect(),
            config.orchestrator.default_category.clone(),
        );

        let orchestrator = StageOrchestrator::new(Arc::new(registry), Arc::new(router))
            .with_classifier(classifier)
            .with_worker_timeout(config.worker_timeout());

        info!(
            sources = config.sources.len(),
            workers = config.workers.len(),
            routes = config.routing.routes.len(),
            "Engine configured"
        );
        Ok(Self::new(scheduler, orchestrator))
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &StageOrchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        self.scheduler.cache()
    }

    /// Start the background refresh loops.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Stop the background refresh loops.
    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub async fn force_refresh(&self, source: &str) -> Result<DateTime<Utc>, RefreshError> {
        self.scheduler.force_refresh(source).await
    }

    pub async fn refresh_all(&self) -> Vec<(String, Result<DateTime<Utc>, RefreshError>)> {
        self.scheduler.refresh_all().await
    }

    pub async fn run(&self, request: WorkRequest) -> Result<FinalOutcome, RunError> {
        self.orchestrator.run(request).await
    }

    pub fn fresh_data(&self, sources: &[&str]) -> BTreeMap<String, FreshData> {
        self.cache().fresh_data(sources)
    }

    /// Freshness of a single source, `None` if it is not configured.
    pub fn source_status(&self, source: &str) -> Option<SourceStatus> {
        self.cache().status(source)
    }

    /// Health of every registered worker unit.
    pub fn health(&self) -> Vec<HealthReport> {
        self.orchestrator.registry().health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_end_to_end() {
        let engine = Engine::from_config(&Config::default()).unwrap();

        let refreshed = engine.refresh_all().await;
        assert_eq!(refreshed.len(), 1);
        assert!(refreshed[0].1.is_ok());

        let outcome = engine.run(WorkRequest::new("how are things")).await.unwrap();
        assert_eq!(outcome.category, "general");
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.stages_executed, 2);
        assert!(outcome.confidence > 0.99);
        assert_eq!(outcome.evidence, vec!["heartbeat"]);
        assert_eq!(outcome.key_insights.len(), 1);

        let health = engine.health();
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|h| h.calls == 1));
    }

    #[tokio::test]
    async fn test_cold_cache_yields_zero_confidence() {
        let engine = Engine::from_config(&Config::default()).unwrap();

        let outcome = engine.run(WorkRequest::new("how are things")).await.unwrap();
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.failed, 2);
        assert!(outcome.narrative.contains("No successful analysis"));

        let status = engine.status();
        assert!(!status.running);
        assert_eq!(status.total_sources, 1);
        assert!(status.sources[0].is_stale);
    }

    #[tokio::test]
    async fn test_fresh_data_and_force_refresh() {
        let engine = Engine::from_config(&Config::default()).unwrap();
        assert!(engine.fresh_data(&["heartbeat"])["heartbeat"].data.is_none());

        engine.force_refresh("heartbeat").await.unwrap();
        let fresh = engine.fresh_data(&["heartbeat", "unknown"]);
        assert_eq!(fresh["heartbeat"].data, Some(serde_json::json!({ "status": "ok" })));
        assert!(fresh["unknown"].data.is_none());

        let status = engine.source_status("heartbeat").unwrap();
        assert!(status.has_data);
        assert!(!status.is_stale);
        assert!(engine.source_status("unknown").is_none());

        assert!(matches!(
            engine.force_refresh("unknown").await,
            Err(RefreshError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let engine = Engine::from_config(&Config::default()).unwrap();
        assert!(engine.start());
        assert!(!engine.start());
        assert!(engine.status().running);

        engine.stop().await;
        assert!(!engine.status().running);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.sources.clear();
        assert!(Engine::from_config(&config).is_err());
    }
}
