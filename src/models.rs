//! Data models for the engine.
//!
//! This module contains the core data structures shared by the cache,
//! scheduler, worker wrapper, orchestrator and aggregator.

use crate::error::{OrchestratorFault, WorkerError};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Immutable configuration of one data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    /// Unique source name.
    pub name: String,
    /// Delay between successful refreshes.
    #[serde(serialize_with = "serialize_secs")]
    pub refresh_interval: Duration,
    /// Delay before retrying after a failed refresh.
    #[serde(serialize_with = "serialize_secs")]
    pub error_backoff_interval: Duration,
}

impl SourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        refresh_interval: Duration,
        error_backoff_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            refresh_interval,
            error_backoff_interval,
        }
    }

    /// Whether an entry of the given age is stale for this source.
    ///
    /// Stale means strictly older than 1.5 × `refresh_interval`; an age of
    /// exactly 1.5 × still counts as fresh.
    pub fn is_stale_age(&self, age: Duration) -> bool {
        age.as_nanos() * 2 > self.refresh_interval.as_nanos() * 3
    }
}

/// The latest successful payload of one source.
///
/// Entries are immutable once built; a refresh swaps in a new entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Source this payload came from.
    pub source_name: String,
    /// Opaque payload returned by the adapter.
    pub payload: Value,
    /// Wall-clock fetch time, for display.
    pub fetched_at: DateTime<Utc>,
    /// Monotonic fetch time, for age computation.
    pub fetched_instant: tokio::time::Instant,
}

impl CacheEntry {
    /// Age of the entry as of `now`. Never negative.
    pub fn age_at(&self, now: tokio::time::Instant) -> Duration {
        now.saturating_duration_since(self.fetched_instant)
    }
}

/// One inbound orchestration request.
#[derive(Debug, Clone, Serialize)]
pub struct WorkRequest {
    /// Request identity.
    pub request_id: String,
    /// Explicit category; classified from the query when absent.
    pub category: Option<String>,
    /// Free-text query.
    pub query: String,
    /// Additional named parameters for worker units.
    pub params: BTreeMap<String, String>,
}

impl WorkRequest {
    /// Creates a request with a fresh random id.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            category: None,
            query: query.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Immutable input handed to every worker unit of one stage.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub request_id: String,
    pub category: String,
    pub query: String,
    pub params: Arc<BTreeMap<String, String>>,
    /// Index of the stage being executed.
    pub stage: usize,
    /// Results of all earlier stages, read-only.
    completed: Arc<Vec<WorkResult>>,
}

impl WorkContext {
    pub fn new(
        request_id: String,
        category: String,
        query: String,
        params: Arc<BTreeMap<String, String>>,
        stage: usize,
        completed: Arc<Vec<WorkResult>>,
    ) -> Self {
        Self {
            request_id,
            category,
            query,
            params,
            stage,
            completed,
        }
    }

    /// Looks up a named request parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Looks up a context field by name: the identity fields or a parameter.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "request_id" => Some(self.request_id.as_str()),
            "category" => Some(self.category.as_str()),
            "query" => Some(self.query.as_str()),
            other => self.param(other),
        }
    }

    /// Results produced by stages that already finished.
    pub fn completed(&self) -> &[WorkResult] {
        &self.completed
    }

    /// The result a given worker produced in an earlier stage, if any.
    pub fn result_for(&self, worker_id: &str) -> Option<&WorkResult> {
        self.completed.iter().find(|r| r.worker_id == worker_id)
    }
}

/// What a worker unit's own logic produces.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOutput {
    pub payload: Value,
    pub confidence: f64,
    pub reasoning: String,
    pub evidence: Vec<String>,
}

impl WorkOutput {
    pub fn new(payload: Value, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            payload,
            confidence,
            reasoning: reasoning.into(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence<I, S>(mut self, evidence: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evidence.extend(evidence.into_iter().map(Into::into));
        self
    }
}

/// The wrapped outcome of one worker invocation.
#[derive(Debug, Clone, Serialize)]
pub struct WorkResult {
    pub worker_id: String,
    pub stage: usize,
    pub payload: Value,
    pub confidence: f64,
    pub reasoning: String,
    pub evidence: Vec<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkResult {
    /// Wraps a successful output. Confidence is clamped into [0, 1].
    pub fn success(worker_id: &str, stage: usize, output: WorkOutput, elapsed: Duration) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            stage,
            payload: output.payload,
            confidence: clamp_confidence(output.confidence),
            reasoning: output.reasoning,
            evidence: output.evidence,
            elapsed,
            succeeded: true,
            error: None,
        }
    }

    /// Captures a failure. Failed results always carry zero confidence.
    pub fn failure(worker_id: &str, stage: usize, err: &WorkerError, elapsed: Duration) -> Self {
        let message = err.to_string();
        Self {
            worker_id: worker_id.to_string(),
            stage,
            payload: json!({ "error": message }),
            confidence: 0.0,
            reasoning: format!("Worker execution failed: {}", message),
            evidence: Vec::new(),
            elapsed,
            succeeded: false,
            error: Some(message),
        }
    }
}

/// Clamps a confidence into [0, 1]; non-finite values become 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// One entry of a run's error log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorLogEntry {
    pub worker_id: String,
    pub stage: usize,
    pub message: String,
}

impl fmt::Display for ErrorLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[stage {}] {}: {}", self.stage, self.worker_id, self.message)
    }
}

/// Per-run accumulator. Only ever grows.
#[derive(Debug, Default)]
pub struct RunState {
    results: Vec<WorkResult>,
    by_worker: HashMap<String, usize>,
    errors: Vec<ErrorLogEntry>,
    current_stage: Option<usize>,
    stages_executed: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a stage. Stage indices must strictly increase.
    pub fn begin_stage(&mut self, stage: usize) -> Result<(), OrchestratorFault> {
        if let Some(current) = self.current_stage {
            if stage <= current {
                return Err(OrchestratorFault::StageOrder {
                    current,
                    attempted: stage,
                });
            }
        }
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Marks the current stage as having launched at least one unit.
    pub fn mark_executed(&mut self) {
        self.stages_executed += 1;
    }

    /// Appends a result; failures are also appended to the error log.
    pub fn record(&mut self, result: WorkResult) -> Result<(), OrchestratorFault> {
        if self.by_worker.contains_key(&result.worker_id) {
            return Err(OrchestratorFault::DuplicateResult(result.worker_id));
        }
        if !result.succeeded {
            self.errors.push(ErrorLogEntry {
                worker_id: result.worker_id.clone(),
                stage: result.stage,
                message: result.error.clone().unwrap_or_default(),
            });
        }
        self.by_worker
            .insert(result.worker_id.clone(), self.results.len());
        self.results.push(result);
        Ok(())
    }

    pub fn has_result(&self, worker_id: &str) -> bool {
        self.by_worker.contains_key(worker_id)
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkResult> {
        self.by_worker.get(worker_id).map(|&i| &self.results[i])
    }

    pub fn results(&self) -> &[WorkResult] {
        &self.results
    }

    pub fn errors(&self) -> &[ErrorLogEntry] {
        &self.errors
    }

    pub fn current_stage(&self) -> Option<usize> {
        self.current_stage
    }

    pub fn stages_executed(&self) -> usize {
        self.stages_executed
    }

    /// Read-only copy of the results so far, for the next stage's context.
    pub fn snapshot(&self) -> Arc<Vec<WorkResult>> {
        Arc::new(self.results.clone())
    }
}

/// Where the outcome's narrative came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    /// Built by the aggregator.
    Deterministic,
    /// Rewritten by an external narrative writer.
    PostProcessed,
}

/// The synthesized result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct FinalOutcome {
    pub request_id: String,
    pub category: String,
    /// Mean confidence over succeeded units; 0 when none succeeded.
    pub confidence: f64,
    pub narrative: String,
    pub narrative_source: NarrativeSource,
    /// Deduplicated evidence in first-seen order.
    pub evidence: Vec<String>,
    pub key_insights: Vec<String>,
    /// Every result of the run, failures included.
    pub breakdown: Vec<WorkResult>,
    pub errors: Vec<ErrorLogEntry>,
    pub succeeded: usize,
    pub failed: usize,
    pub stages_executed: usize,
    #[serde(rename = "total_elapsed_ms", serialize_with = "serialize_millis")]
    pub total_elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

/// Freshness snapshot of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub has_data: bool,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(rename = "age_seconds", serialize_with = "serialize_opt_secs")]
    pub age: Option<Duration>,
    pub is_stale: bool,
}

/// Freshness snapshot of every source plus loop bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_sources: usize,
    pub active_loops: usize,
    pub sources: Vec<SourceStatus>,
}

impl SchedulerStatus {
    pub fn stale_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_stale).count()
    }

    pub fn source(&self, name: &str) -> Option<&SourceStatus> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Payload plus age for one source, as returned by a bulk freshness read.
#[derive(Debug, Clone, Serialize)]
pub struct FreshData {
    pub data: Option<Value>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(rename = "age_seconds", serialize_with = "serialize_opt_secs")]
    pub age: Option<Duration>,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}
