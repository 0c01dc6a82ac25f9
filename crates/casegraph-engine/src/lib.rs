//! Analysis engine and strategy implementations for CaseGraph.
//!
//! The engine routes `AnalysisRequest`s to the first registered strategy
//! whose `can_handle` accepts the request kind, with optional result
//! caching, deadlines, and metrics. The six bundled strategies cover the
//! LLM-driven extractors and the pure-graph algorithms.

pub mod engine;
pub mod metrics;
pub mod strategies;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{AnalysisEngine, PostProcessHook, PreProcessHook};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot};
pub use strategies::{
    AnomalyDetectionStrategy, CentralityAnalysisStrategy, CommunityDetectionStrategy,
    EntityExtractionStrategy, PathFindingStrategy, RelationshipMappingStrategy,
};

use casegraph_core::AnalysisStrategy;
use std::sync::Arc;

/// The full bundled strategy set, in registration order.
pub fn default_strategies() -> Vec<Arc<dyn AnalysisStrategy>> {
    vec![
        Arc::new(EntityExtractionStrategy::new()),
        Arc::new(RelationshipMappingStrategy::new()),
        Arc::new(CommunityDetectionStrategy::new()),
        Arc::new(AnomalyDetectionStrategy::new()),
        Arc::new(PathFindingStrategy::new()),
        Arc::new(CentralityAnalysisStrategy::new()),
    ]
}
