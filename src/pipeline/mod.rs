//! Orchestration of the finalization run.

mod metrics;
mod orchestrator;


pub use metrics::{peak_rss_kb, MetricsSnapshot, StitchMetrics};
pub use orchestrator::{RunContext, StitchOutcome, Stitcher};
