//! Stage orchestrator.
//!
//! Runs the stages a router picks for a request, one after another. Units
//! inside a stage run concurrently and never affect each other; only a
//! routing or sequencing fault aborts the run.

pub mod routing;

pub use routing::{
    ClassifierRule, KeywordClassifier, Router, StagePlan, TableRouter, FALLBACK_CATEGORY,
};

use crate::analysis::{self, NarrativeWriter};
use crate::error::{panic_message, OrchestratorFault, RunError, ValidationError, WorkerError};
use crate::models::{FinalOutcome, RunState, WorkContext, WorkRequest, WorkResult};
use crate::worker::{RegisteredWorker, WorkerRegistry};
use futures::future::join_all;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Drives one request through its stages and aggregates the results.
pub struct StageOrchestrator {
    registry: Arc<WorkerRegistry>,
    router: Arc<dyn Router>,
    classifier: KeywordClassifier,
    worker_timeout: Option<Duration>,
    narrator: Option<Arc<dyn NarrativeWriter>>,
}

impl StageOrchestrator {
    pub fn new(registry: Arc<WorkerRegistry>, router: Arc<dyn Router>) -> Self {
        Self {
            registry,
            router,
            classifier: KeywordClassifier::default(),
            worker_timeout: None,
            narrator: None,
        }
    }

    pub fn with_classifier(mut self, classifier: KeywordClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Fail any unit that has not reported within `timeout`.
    pub fn with_worker_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn NarrativeWriter>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Category a request will be routed under.
    pub fn resolve_category(&self, request: &WorkRequest) -> String {
        match request.category.as_deref().map(str::trim) {
            Some(category) if !category.is_empty() => category.to_string(),
            _ => self.classifier.classify(&request.query).to_string(),
        }
    }

    /// Execute a request end to end.
    pub async fn run(&self, request: WorkRequest) -> Result<FinalOutcome, RunError> {
        let start = Instant::now();
        let category = self.resolve_category(&request);
        validate_request(&request, &category)?;

        let plan = self.route(&category)?;
        info!(
            request_id = %request.request_id,
            category = %category,
            stages = plan.len(),
            "Starting run"
        );

        let params = Arc::new(request.params);
        let mut state = RunState::new();

        for (stage, ids) in plan.iter().enumerate() {
            state.begin_stage(stage)?;

            let eligible = self.eligible_units(ids, &state);
            if eligible.is_empty() {
                debug!(stage, "No eligible workers, skipping stage");
                continue;
            }
            state.mark_executed();

            let ctx = WorkContext::new(
                request.request_id.clone(),
                category.clone(),
                request.query.clone(),
                Arc::clone(&params),
                stage,
                state.snapshot(),
            );

            debug!(stage, workers = eligible.len(), "Launching stage");
            let results = self.run_stage(eligible, ctx).await;

            let failed = results.iter().filter(|r| !r.succeeded).count();
            for result in results {
                state.record(result)?;
            }
            if failed > 0 {
                warn!(stage, failed, "Stage finished with failures");
            }
        }

        let mut outcome =
            analysis::aggregate(&request.request_id, &category, &state, start.elapsed());

        if let Some(narrator) = &self.narrator {
            analysis::apply_narrative(&mut outcome, narrator.as_ref()).await;
        }

        info!(
            request_id = %outcome.request_id,
            confidence = outcome.confidence,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Run complete"
        );
        Ok(outcome)
    }

    fn route(&self, category: &str) -> Result<StagePlan, OrchestratorFault> {
        let router = Arc::clone(&self.router);
        match catch_unwind(AssertUnwindSafe(|| router.route(category))) {
            Ok(Ok(plan)) => Ok(plan),
            Ok(Err(e)) => Err(OrchestratorFault::Routing {
                category: category.to_string(),
                message: e.to_string(),
            }),
            Err(panic) => Err(OrchestratorFault::RouterPanicked {
                category: category.to_string(),
                message: panic_message(&*panic),
            }),
        }
    }

    /// Registered units of a stage that have not run yet, in registration order.
    fn eligible_units(&self, ids: &[String], state: &RunState) -> Vec<Arc<RegisteredWorker>> {
        let mut seen = HashSet::new();
        let mut eligible: Vec<(usize, Arc<RegisteredWorker>)> = Vec::new();

        for id in ids {
            if !seen.insert(id.as_str()) || state.has_result(id) {
                continue;
            }
            match (self.registry.position(id), self.registry.get(id)) {
                (Some(position), Some(worker)) => eligible.push((position, Arc::clone(worker))),
                _ => warn!(worker = %id, "Route names an unregistered worker, skipping"),
            }
        }

        eligible.sort_by_key(|(position, _)| *position);
        eligible.into_iter().map(|(_, worker)| worker).collect()
    }

    /// Fan out one task per unit and collect every outcome.
    async fn run_stage(
        &self,
        workers: Vec<Arc<RegisteredWorker>>,
        ctx: WorkContext,
    ) -> Vec<WorkResult> {
        let ctx = Arc::new(ctx);
        let stage = ctx.stage;

        let tasks = workers.into_iter().map(|worker| {
            let ctx = Arc::clone(&ctx);
            let id = worker.id().to_string();
            let limit = self.worker_timeout;
            let handle =
                tokio::spawn(async move { worker.invoke_with_timeout(&ctx, limit).await });

            async move {
                let started = Instant::now();
                handle.await.unwrap_or_else(|e| {
                    warn!(worker = %id, stage, "Worker task ended abnormally: {}", e);
                    WorkResult::failure(
                        &id,
                        stage,
                        &WorkerError::Aborted(e.to_string()),
                        started.elapsed(),
                    )
                })
            }
        });

        join_all(tasks).await
    }
}

impl std::fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("workers", &self.registry.len())
            .field("worker_timeout", &self.worker_timeout)
            .field("narrator", &self.narrator.is_some())
            .finish()
    }
}

/// Reject requests no unit could work with.
fn validate_request(request: &WorkRequest, category: &str) -> Result<(), ValidationError> {
    if request.request_id.trim().is_empty() {
        return Err(ValidationError::MissingField("request_id".to_string()));
    }
    if request.query.trim().is_empty() {
        return Err(ValidationError::MissingField("query".to_string()));
    }
    if category.is_empty() {
        return Err(ValidationError::MissingField("category".to_string()));
    }
    if category.chars().any(char::is_control) {
        return Err(ValidationError::InvalidField {
            field: "category".to_string(),
            reason: "contains control characters".to_string(),
        });
    }
    Ok(())
}
