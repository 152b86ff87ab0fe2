//! Worker unit contract.
//!
//! A worker unit has a single capability: turn a [`WorkContext`] into a
//! [`WorkOutput`] or fail. Timing, validation, error capture and health
//! metrics are applied once, by [`RegisteredWorker::invoke`], for every unit.

pub mod builtin;

pub use builtin::{SourceSnapshotWorker, StageDigestWorker};

use crate::error::{panic_message, ValidationError, WorkerError};
use crate::models::{WorkContext, WorkOutput, WorkResult};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identity fields every context must carry.
const BASE_FIELDS: [&str; 2] = ["request_id", "query"];

/// How many recent error messages a unit keeps.
const RECENT_ERRORS: usize = 20;

/// One self-contained piece of analytical logic.
#[async_trait]
pub trait WorkerUnit: Send + Sync {
    /// Unique id of this unit.
    fn id(&self) -> &str;

    /// Context fields (identity fields or request parameters) this unit needs.
    fn required_fields(&self) -> &[String] {
        &[]
    }

    /// Unit-specific logic.
    async fn process(&self, ctx: &WorkContext) -> Result<WorkOutput>;
}

/// Limits used to judge a unit healthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Success ratio must be strictly above this.
    pub min_success_ratio: f64,
    /// Average latency must be strictly below this.
    pub max_avg_latency: Duration,
    /// Recorded error count must be strictly below this.
    pub max_errors: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_ratio: 0.8,
            max_avg_latency: Duration::from_secs(5),
            max_errors: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    at: DateTime<Utc>,
    message: String,
}

/// Rolling metrics for one unit.
#[derive(Debug, Default)]
struct HealthMetrics {
    calls: u64,
    successes: u64,
    avg_latency_ms: f64,
    error_count: u64,
    recent_errors: VecDeque<ErrorRecord>,
}

impl HealthMetrics {
    fn record(&mut self, elapsed: Duration, error: Option<&str>) {
        self.calls += 1;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (ms - self.avg_latency_ms) / self.calls as f64;

        match error {
            None => self.successes += 1,
            Some(message) => {
                self.error_count += 1;
                if self.recent_errors.len() == RECENT_ERRORS {
                    self.recent_errors.pop_front();
                }
                self.recent_errors.push_back(ErrorRecord {
                    at: Utc::now(),
                    message: message.to_string(),
                });
            }
        }
    }

    fn success_ratio(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

/// Health snapshot of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub worker_id: String,
    pub calls: u64,
    pub avg_latency_ms: f64,
    pub success_ratio: f64,
    pub error_count: u64,
    pub recent_errors: Vec<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub healthy: bool,
}

/// A unit plus its health metrics.
pub struct RegisteredWorker {
    unit: Arc<dyn WorkerUnit>,
    thresholds: HealthThresholds,
    metrics: Mutex<HealthMetrics>,
}

impl RegisteredWorker {
    pub fn new(unit: Arc<dyn WorkerUnit>, thresholds: HealthThresholds) -> Self {
        Self {
            unit,
            thresholds,
            metrics: Mutex::new(HealthMetrics::default()),
        }
    }

    pub fn id(&self) -> &str {
        self.unit.id()
    }

    /// Run the unit with uniform timing, validation and error capture.
    ///
    /// Never fails: every error, including a panic inside the unit, comes
    /// back as a failed [`WorkResult`].
    pub async fn invoke(&self, ctx: &WorkContext) -> WorkResult {
        self.invoke_with_timeout(ctx, None).await
    }

    /// Like [`invoke`](Self::invoke), but fails the unit once `limit` elapses.
    ///
    /// The unit's future is dropped at the limit, so a timed-out call is
    /// recorded once, as a failure, and can never complete late.
    pub async fn invoke_with_timeout(
        &self,
        ctx: &WorkContext,
        limit: Option<Duration>,
    ) -> WorkResult {
        let id = self.unit.id();
        let start = Instant::now();
        debug!(worker = %id, stage = ctx.stage, "Worker started");

        let outcome = match validate_context(ctx, self.unit.required_fields()) {
            Err(e) => Err(WorkerError::from(e)),
            Ok(()) => self.execute(ctx, limit).await,
        };

        let elapsed = start.elapsed();
        match outcome {
            Ok(output) => {
                self.lock_metrics().record(elapsed, None);
                debug!(
                    worker = %id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Worker completed"
                );
                WorkResult::success(id, ctx.stage, output, elapsed)
            }
            Err(e) => {
                let message = e.to_string();
                self.lock_metrics().record(elapsed, Some(&message));
                warn!(worker = %id, stage = ctx.stage, "Worker failed: {}", message);
                WorkResult::failure(id, ctx.stage, &e, elapsed)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &WorkContext,
        limit: Option<Duration>,
    ) -> Result<WorkOutput, WorkerError> {
        let logic = AssertUnwindSafe(self.unit.process(ctx)).catch_unwind();
        let caught = match limit {
            Some(limit) => tokio::time::timeout(limit, logic)
                .await
                .map_err(|_| WorkerError::TimedOut(limit.as_secs_f64()))?,
            None => logic.await,
        };

        match caught {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(WorkerError::Failed(format!("{:#}", e))),
            Err(panic) => Err(WorkerError::Panicked(panic_message(&*panic))),
        }
    }

    /// Current health of this unit.
    pub fn health(&self) -> HealthReport {
        let metrics = self.lock_metrics();
        let success_ratio = metrics.success_ratio();
        let healthy = success_ratio > self.thresholds.min_success_ratio
            && metrics.avg_latency_ms < self.thresholds.max_avg_latency.as_secs_f64() * 1000.0
            && metrics.error_count < self.thresholds.max_errors;

        HealthReport {
            worker_id: self.unit.id().to_string(),
            calls: metrics.calls,
            avg_latency_ms: metrics.avg_latency_ms,
            success_ratio,
            error_count: metrics.error_count,
            recent_errors: metrics
                .recent_errors
                .iter()
                .map(|r| r.message.clone())
                .collect(),
            last_error_at: metrics.recent_errors.back().map(|r| r.at),
            healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health().healthy
    }

    /// Clear all recorded metrics.
    pub fn reset_metrics(&self) {
        *self.lock_metrics() = HealthMetrics::default();
    }

    fn lock_metrics(&self) -> MutexGuard<'_, HealthMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("id", &self.unit.id())
            .finish()
    }
}

/// Check that the base identity fields and the unit's own fields are present.
pub fn validate_context(ctx: &WorkContext, required: &[String]) -> Result<(), ValidationError> {
    let fields = BASE_FIELDS
        .iter()
        .copied()
        .chain(required.iter().map(String::as_str));

    for field in fields {
        match ctx.field(field) {
            Some(value) if !value.trim().is_empty() => {}
            _ => return Err(ValidationError::MissingField(field.to_string())),
        }
    }
    Ok(())
}

/// Registered units, in registration order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Arc<RegisteredWorker>>,
    index: HashMap<String, usize>,
    thresholds: HealthThresholds,
}

impl WorkerRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            workers: Vec::new(),
            index: HashMap::new(),
            thresholds,
        }
    }

    /// Register a unit. Ids must be unique.
    pub fn register(&mut self, unit: Arc<dyn WorkerUnit>) -> Result<()> {
        let id = unit.id().to_string();
        if id.trim().is_empty() {
            bail!("Worker id must not be empty");
        }
        if self.index.contains_key(&id) {
            bail!("Worker '{}' is already registered", id);
        }

        self.index.insert(id, self.workers.len());
        self.workers
            .push(Arc::new(RegisteredWorker::new(unit, self.thresholds)));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RegisteredWorker>> {
        self.index.get(id).map(|&i| &self.workers[i])
    }

    /// Registration position of a unit.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.id())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Health of every unit in registration order.
    pub fn health(&self) -> Vec<HealthReport> {
        self.workers.iter().map(|w| w.health()).collect()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use serde_json::json;

    /// Behaviour of a [`MockWorker`].
    #[derive(Debug, Clone)]
    pub enum Behavior {
        Succeed { confidence: f64, evidence: Vec<String> },
        Fail(String),
        Panic,
        Sleep(Duration),
    }

    /// Mock unit for testing.
    pub struct MockWorker {
        pub id: String,
        pub required: Vec<String>,
        pub behavior: Behavior,
    }

    impl MockWorker {
        pub fn ok(id: &str, confidence: f64, evidence: &[&str]) -> Arc<dyn WorkerUnit> {
            Arc::new(Self {
                id: id.to_string(),
                required: Vec::new(),
                behavior: Behavior::Succeed {
                    confidence,
                    evidence: evidence.iter().map(|s| s.to_string()).collect(),
                },
            })
        }

        pub fn failing(id: &str, message: &str) -> Arc<dyn WorkerUnit> {
            Arc::new(Self {
                id: id.to_string(),
                required: Vec::new(),
                behavior: Behavior::Fail(message.to_string()),
            })
        }

        pub fn with(id: &str, behavior: Behavior) -> Arc<dyn WorkerUnit> {
            Arc::new(Self {
                id: id.to_string(),
                required: Vec::new(),
                behavior,
            })
        }
    }

    #[async_trait]
    impl WorkerUnit for MockWorker {
        fn id(&self) -> &str {
            &self.id
        }

        fn required_fields(&self) -> &[String] {
            &self.required
        }

        async fn process(&self, ctx: &WorkContext) -> Result<WorkOutput> {
            match &self.behavior {
                Behavior::Succeed {
                    confidence,
                    evidence,
                } => Ok(WorkOutput::new(
                    json!({ "seen": ctx.completed().len() }),
                    *confidence,
                    format!("{} looked at '{}'", self.id, ctx.query),
                )
                .with_evidence(evidence.clone())),
                Behavior::Fail(message) => bail!("{}", message),
                Behavior::Panic => panic!("{} blew up", self.id),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(WorkOutput::new(json!({}), 0.5, format!("{} woke up", self.id)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Behavior, MockWorker};
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> WorkContext {
        WorkContext::new(
            "req-1".to_string(),
            "urgent".to_string(),
            "who should start".to_string(),
            Arc::new(BTreeMap::new()),
            0,
            Arc::new(Vec::new()),
        )
    }

    #[tokio::test]
    async fn test_invoke_success_updates_metrics() {
        let worker = RegisteredWorker::new(
            MockWorker::ok("stats", 0.8, &["feed-a"]),
            HealthThresholds::default(),
        );

        let result = worker.invoke(&ctx()).await;
        assert!(result.succeeded);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.evidence, vec!["feed-a"]);

        let health = worker.health();
        assert_eq!(health.calls, 1);
        assert_eq!(health.success_ratio, 1.0);
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_invoke_captures_error() {
        let worker = RegisteredWorker::new(
            MockWorker::failing("odds", "feed offline"),
            HealthThresholds::default(),
        );

        let result = worker.invoke(&ctx()).await;
        assert!(!result.succeeded);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error.as_deref(), Some("feed offline"));
        assert!(result.reasoning.contains("feed offline"));

        let health = worker.health();
        assert_eq!(health.error_count, 1);
        assert_eq!(health.recent_errors, vec!["feed offline"]);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_invoke_captures_panic() {
        let worker = RegisteredWorker::new(
            MockWorker::with("boom", Behavior::Panic),
            HealthThresholds::default(),
        );

        let result = worker.invoke(&ctx()).await;
        assert!(!result.succeeded);
        assert!(result.error.unwrap().contains("boom blew up"));
        assert_eq!(worker.health().calls, 1);
    }

    #[tokio::test]
    async fn test_missing_required_field_fails_fast() {
        let worker = RegisteredWorker::new(
            Arc::new(MockWorker {
                id: "roster".to_string(),
                required: vec!["league_id".to_string()],
                behavior: Behavior::Panic,
            }),
            HealthThresholds::default(),
        );

        // Logic would panic if it ran; validation must stop it first.
        let result = worker.invoke(&ctx()).await;
        assert!(!result.succeeded);
        assert_eq!(
            result.error.as_deref(),
            Some("Missing required context field: league_id")
        );
        assert_eq!(worker.health().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_in_health() {
        let worker = RegisteredWorker::new(
            MockWorker::with("slow", Behavior::Sleep(Duration::from_secs(3))),
            HealthThresholds::default(),
        );

        let result = worker
            .invoke_with_timeout(&ctx(), Some(Duration::from_secs(1)))
            .await;
        assert!(!result.succeeded);
        assert_eq!(result.error.as_deref(), Some("timed out after 1.0s"));

        // Nothing may complete after the limit and count as a success.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let health = worker.health();
        assert_eq!(health.calls, 1);
        assert_eq!(health.error_count, 1);
        assert_eq!(health.success_ratio, 0.0);
        assert!(!health.healthy);
    }

    #[test]
    fn test_validate_context_rejects_blank_base_fields() {
        let mut c = ctx();
        c.query = "   ".to_string();
        assert_eq!(
            validate_context(&c, &[]),
            Err(ValidationError::MissingField("query".to_string()))
        );
    }

    #[tokio::test]
    async fn test_health_thresholds() {
        let worker = RegisteredWorker::new(
            MockWorker::ok("a", 0.5, &[]),
            HealthThresholds::default(),
        );
        // No calls yet: ratio 0 is not above 0.8.
        assert!(!worker.is_healthy());

        for _ in 0..4 {
            worker.invoke(&ctx()).await;
        }
        assert!(worker.is_healthy());

        worker.lock_metrics().record(Duration::from_millis(1), Some("x"));
        // 4 of 5 succeeded: exactly 0.8 is not healthy.
        assert!(!worker.is_healthy());

        worker.reset_metrics();
        assert_eq!(worker.health().calls, 0);
    }

    #[tokio::test]
    async fn test_average_latency_is_running_mean() {
        let worker = RegisteredWorker::new(
            MockWorker::ok("a", 0.5, &[]),
            HealthThresholds::default(),
        );
        {
            let mut m = worker.lock_metrics();
            m.record(Duration::from_millis(100), None);
            m.record(Duration::from_millis(300), None);
        }
        let health = worker.health();
        assert!((health.avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_serialize_metrics() {
        let worker = Arc::new(RegisteredWorker::new(
            MockWorker::ok("shared", 0.9, &[]),
            HealthThresholds::default(),
        ));

        let runs = (0..32).map(|_| {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.invoke(&ctx()).await })
        });
        for handle in futures::future::join_all(runs).await {
            assert!(handle.unwrap().succeeded);
        }
        assert_eq!(worker.health().calls, 32);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = WorkerRegistry::new(HealthThresholds::default());
        registry.register(MockWorker::ok("a", 0.5, &[])).unwrap();
        registry.register(MockWorker::ok("b", 0.5, &[])).unwrap();
        assert!(registry.register(MockWorker::ok("a", 0.5, &[])).is_err());

        assert_eq!(registry.position("b"), Some(1));
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(registry.health().len(), 2);
    }
}
