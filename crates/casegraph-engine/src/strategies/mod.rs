//! The six analysis strategies.
//!
//! Each strategy is stateless and reentrant; it receives the LLM and graph
//! capabilities per call and encodes every failure inside the returned
//! result.

pub mod anomaly_detection;
pub mod centrality;
pub mod community_detection;
pub mod entity_extraction;
pub mod path_finding;
pub mod relationship_mapping;

pub use anomaly_detection::AnomalyDetectionStrategy;
pub use centrality::CentralityAnalysisStrategy;
pub use community_detection::CommunityDetectionStrategy;
pub use entity_extraction::EntityExtractionStrategy;
pub use path_finding::PathFindingStrategy;
pub use relationship_mapping::RelationshipMappingStrategy;

use casegraph_core::{AnalysisRequest, AnalysisResult};
use std::time::Instant;

pub(crate) fn finished(result: AnalysisResult, start: Instant) -> AnalysisResult {
    result.with_duration_ms(start.elapsed().as_secs_f64() * 1000.0)
}

pub(crate) fn failed(
    request: &AnalysisRequest,
    errors: Vec<String>,
    start: Instant,
) -> AnalysisResult {
    finished(AnalysisResult::failure(request.clone(), errors), start)
}
