//! Error taxonomy for the engine.
//!
//! Fetch and worker failures are normally converted into data (a stale flag,
//! a failed [`WorkResult`](crate::models::WorkResult)). Only
//! [`ValidationError`] and [`OrchestratorFault`] terminate a run.

use thiserror::Error;

/// A malformed request or work context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or blank.
    #[error("Missing required context field: {0}")]
    MissingField(String),

    /// A field is present but unusable.
    #[error("Invalid context field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// A source adapter failed to produce a payload.
#[derive(Debug, Clone, Error)]
#[error("Fetch from source '{source_name}' failed: {message}")]
pub struct SourceFetchError {
    pub source_name: String,
    pub message: String,
}

/// A worker unit failed. Always captured into that unit's result.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The context did not carry what the unit needs.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unit logic returned an error.
    #[error("{0}")]
    Failed(String),

    /// Unit logic panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// Unit did not finish within the stage timeout.
    #[error("timed out after {0:.1}s")]
    TimedOut(f64),

    /// The task running the unit was cancelled before it reported.
    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// The routing function or stage sequencing itself faulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorFault {
    /// The router returned an error.
    #[error("routing failed for category '{category}': {message}")]
    Routing { category: String, message: String },

    /// The router panicked.
    #[error("router panicked for category '{category}': {message}")]
    RouterPanicked { category: String, message: String },

    /// Stages were sequenced out of order.
    #[error("stage {attempted} started after stage {current}")]
    StageOrder { current: usize, attempted: usize },

    /// A worker produced a second result in the same run.
    #[error("worker '{0}' produced more than one result")]
    DuplicateResult(String),
}

/// Error a router may return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RoutingError(pub String);

/// The two ways a run terminates without a [`FinalOutcome`](crate::models::FinalOutcome).
#[derive(Debug, Clone, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("orchestrator fault: {0}")]
    Fault(#[from] OrchestratorFault),
}

impl RunError {
    /// A failed run always reports zero confidence.
    pub fn confidence(&self) -> f64 {
        0.0
    }
}

/// Errors returned by the freshness cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
}

/// Errors returned by an out-of-band refresh.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Fetch(#[from] SourceFetchError),
}

impl From<CacheError> for RefreshError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::UnknownSource(name) => RefreshError::UnknownSource(name),
        }
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_reports_zero_confidence() {
        let err = RunError::from(OrchestratorFault::Routing {
            category: "urgent".to_string(),
            message: "no route".to_string(),
        });
        assert_eq!(err.confidence(), 0.0);
        assert!(err.to_string().contains("urgent"));
    }

    #[test]
    fn test_worker_error_messages() {
        let err = WorkerError::from(ValidationError::MissingField("league_id".to_string()));
        assert_eq!(err.to_string(), "Missing required context field: league_id");
        assert_eq!(WorkerError::TimedOut(2.0).to_string(), "timed out after 2.0s");
    }
}
