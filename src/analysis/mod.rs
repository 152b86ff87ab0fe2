//! Analysis modules.
//!
//! Aggregation of a run's results and optional narrative post-processing.

pub mod aggregator;
pub mod narrative;

pub use aggregator::*;
pub use narrative::{apply_narrative, NarrativeWriter};
