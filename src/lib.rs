//! Cadence - freshness scheduler and staged fan-out orchestration engine.
//!
//! Two halves share one [`cache::FreshnessCache`]:
//!
//! - the [`scheduler::RefreshScheduler`] keeps every configured source
//!   fresh with one independent loop per source;
//! - the [`orchestrator::StageOrchestrator`] routes a request to ordered
//!   stages of [`worker::WorkerUnit`]s, runs each stage concurrently and
//!   folds the results into a [`models::FinalOutcome`].
//!
//! [`engine::Engine`] wires both halves from a [`config::Config`].

pub mod analysis;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod scheduler;
pub mod worker;

pub use engine::Engine;
pub use error::{RunError, ValidationError, WorkerError};
pub use models::{FinalOutcome, WorkRequest};
