//! Optional narrative post-processing.
//!
//! A [`NarrativeWriter`] turns the structured outcome into prose. The
//! aggregator's own narrative is kept whenever the writer errors, panics or
//! returns blank text.

use crate::error::panic_message;
use crate::models::{FinalOutcome, NarrativeSource};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

/// External prose generator consuming an outcome's structured fields.
#[async_trait]
pub trait NarrativeWriter: Send + Sync {
    async fn compose(&self, outcome: &FinalOutcome) -> Result<String>;
}

/// Replace the outcome's narrative with the writer's prose when it succeeds.
pub async fn apply_narrative(outcome: &mut FinalOutcome, writer: &dyn NarrativeWriter) {
    let composed = AssertUnwindSafe(writer.compose(outcome)).catch_unwind().await;

    match composed {
        Ok(Ok(text)) if !text.trim().is_empty() => {
            debug!(request_id = %outcome.request_id, "Narrative post-processed");
            outcome.narrative = text;
            outcome.narrative_source = NarrativeSource::PostProcessed;
        }
        Ok(Ok(_)) => {
            warn!(request_id = %outcome.request_id, "Narrative writer returned blank text, keeping deterministic narrative");
        }
        Ok(Err(e)) => {
            warn!(request_id = %outcome.request_id, "Narrative writer failed, keeping deterministic narrative: {:#}", e);
        }
        Err(panic) => {
            warn!(
                request_id = %outcome.request_id,
                "Narrative writer panicked, keeping deterministic narrative: {}",
                panic_message(&*panic)
            );
        }
    }
}
