//! Multi-phase investigation pipeline for CaseGraph.
//!
//! An investigation is a DAG of phases, each of which drives one analysis
//! request through the engine. The pipeline schedules phases sequentially
//! or in parallel rounds, weaves discovered context into later phases, can
//! inject adaptive follow-up phases at runtime, and supports snapshot /
//! restore of investigation state.

pub mod explore;
pub mod investigation;
pub mod pipeline;

pub use explore::{
    BreadthFirstStrategy, DepthFirstStrategy, ExplorationState, ExplorationStrategy,
    HypothesisDrivenStrategy, PlannedPhase,
};
pub use investigation::{
    Investigation, InvestigationPhase, InvestigationStatus, PhaseSpec, PhaseStatus,
};
pub use pipeline::{InvestigationPipeline, PipelineMetrics, PipelineMetricsSnapshot};
