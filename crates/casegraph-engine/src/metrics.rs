use casegraph_core::AnalysisType;
use serde::Serialize;
use std::collections::HashMap;

/// Mutable engine counters, kept behind the engine's metrics mutex.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration_ms: f64,
    pub requests_by_type: HashMap<AnalysisType, u64>,
    pub errors: Vec<String>,
}

impl EngineMetrics {
    pub fn record_request(&mut self, analysis_type: AnalysisType) {
        self.total_requests += 1;
        *self.requests_by_type.entry(analysis_type).or_insert(0) += 1;
    }

    pub fn record_outcome(&mut self, success: bool, duration_ms: f64, errors: &[String]) {
        self.total_duration_ms += duration_ms;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
            self.errors.extend_from_slice(errors);
        }
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        let average_duration_ms = if self.total_requests > 0 {
            self.total_duration_ms / self.total_requests as f64
        } else {
            0.0
        };
        EngineMetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            total_duration_ms: self.total_duration_ms,
            average_duration_ms,
            requests_by_type: self
                .requests_by_type
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            errors: self.errors.clone(),
        }
    }
}

/// Read-only view of engine metrics with derived averages.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration_ms: f64,
    pub average_duration_ms: f64,
    pub requests_by_type: HashMap<String, u64>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_average() {
        let mut metrics = EngineMetrics::default();
        metrics.record_request(AnalysisType::PathFinding);
        metrics.record_outcome(true, 10.0, &[]);
        metrics.record_request(AnalysisType::PathFinding);
        metrics.record_outcome(false, 30.0, &["boom".to_string()]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.average_duration_ms, 20.0);
        assert_eq!(snapshot.requests_by_type["path_finding"], 2);
        assert_eq!(snapshot.errors, vec!["boom".to_string()]);
    }
}
