use crate::explore::ExplorationStrategy;
use crate::investigation::{
    Investigation, InvestigationPhase, InvestigationStatus, PhaseSpec, PhaseStatus,
};
use casegraph_core::{AnalysisRequest, AnalysisResult, AnalysisType, JsonMap, PipelineConfig};
use casegraph_engine::AnalysisEngine;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};

/// Pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub total_investigations: u64,
    pub completed_investigations: u64,
    pub failed_investigations: u64,
    pub total_phases_executed: u64,
    pub total_duration_ms: f64,
    pub entities_discovered: u64,
    pub relationships_discovered: u64,
    pub errors: Vec<String>,
}

/// Read-only metrics view with derived averages.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub total_investigations: u64,
    pub completed_investigations: u64,
    pub failed_investigations: u64,
    pub total_phases_executed: u64,
    pub total_duration_ms: f64,
    pub average_duration_ms: f64,
    pub average_phases_per_investigation: f64,
    pub entities_discovered: u64,
    pub relationships_discovered: u64,
    pub errors: Vec<String>,
}

type SharedInvestigation = Arc<AsyncMutex<Investigation>>;

/// Executes a DAG of phases against the analysis engine, accumulating
/// discovered entities and relationships into an `Investigation`.
///
/// Investigation mutation is confined to this pipeline; the per-investigation
/// async mutex is never held across an engine call.
pub struct InvestigationPipeline {
    engine: Arc<AnalysisEngine>,
    config: PipelineConfig,
    explorer: Option<Arc<dyn ExplorationStrategy>>,
    investigations: DashMap<String, SharedInvestigation>,
    metrics: Mutex<PipelineMetrics>,
}

impl InvestigationPipeline {
    pub fn new(engine: Arc<AnalysisEngine>, config: PipelineConfig) -> Self {
        Self {
            engine,
            config,
            explorer: None,
            investigations: DashMap::new(),
            metrics: Mutex::new(PipelineMetrics::default()),
        }
    }

    pub fn with_explorer(mut self, explorer: Arc<dyn ExplorationStrategy>) -> Self {
        self.explorer = Some(explorer);
        self
    }

    /// Run a multi-phase investigation and return its view. Omitting
    /// `phases` installs the default extract → map → analyze plan.
    pub async fn investigate(
        &self,
        initial_context: JsonMap,
        objectives: Vec<String>,
        phases: Option<Vec<PhaseSpec>>,
    ) -> Value {
        let start = Instant::now();
        let investigation_id = uuid::Uuid::new_v4().to_string();

        let investigation = Arc::new(AsyncMutex::new(Investigation::new(
            investigation_id.clone(),
            initial_context,
            objectives,
        )));
        self.investigations
            .insert(investigation_id.clone(), investigation.clone());

        if self.config.collect_metrics {
            self.metrics.lock().total_investigations += 1;
        }

        match self.config.timeout_seconds {
            Some(seconds) => {
                let run = self.run_investigation(&investigation, phases);
                if tokio::time::timeout(Duration::from_secs(seconds), run)
                    .await
                    .is_err()
                {
                    let mut inv = investigation.lock().await;
                    inv.status = InvestigationStatus::Timeout;
                    inv.errors
                        .push(format!("Investigation timed out after {seconds} seconds"));
                    for phase in &mut inv.phases {
                        if !phase.is_terminal() {
                            phase.status = PhaseStatus::Cancelled;
                        }
                    }
                    inv.completed_at = Some(Utc::now());
                }
            }
            None => self.run_investigation(&investigation, phases).await,
        }

        let inv = investigation.lock().await;

        if self.config.collect_metrics {
            let mut metrics = self.metrics.lock();
            metrics.total_duration_ms += start.elapsed().as_secs_f64() * 1000.0;
            if inv.status == InvestigationStatus::Completed {
                metrics.completed_investigations += 1;
            } else {
                metrics.failed_investigations += 1;
            }
            metrics.entities_discovered += inv.entities.len() as u64;
            metrics.relationships_discovered += inv.relationships.len() as u64;
        }

        self.decorated_view(&inv)
    }

    /// Appends evidence to an investigation; in adaptive mode a running
    /// investigation gets a follow-up extraction phase over the evidence.
    pub async fn add_evidence(&self, investigation_id: &str, mut evidence: Value) -> bool {
        let Some(investigation) = self
            .investigations
            .get(investigation_id)
            .map(|entry| entry.value().clone())
        else {
            error!(investigation_id, "investigation not found");
            return false;
        };

        if let Some(object) = evidence.as_object_mut() {
            object
                .entry("timestamp".to_string())
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        }

        let adaptive_phase = {
            let mut inv = investigation.lock().await;
            inv.evidence.push(evidence.clone());

            if self.config.adaptive && inv.status == InvestigationStatus::Running {
                let mut parameters = JsonMap::new();
                parameters.insert(
                    "text".into(),
                    evidence.get("content").cloned().unwrap_or(json!("")),
                );
                parameters.insert(
                    "evidence_type".into(),
                    evidence.get("type").cloned().unwrap_or(json!("unknown")),
                );

                let spec = PhaseSpec::new(
                    format!("evidence_analysis_{}", inv.evidence.len()),
                    AnalysisType::EntityExtraction,
                )
                .with_parameters(parameters);
                inv.phases.push(InvestigationPhase::from_spec(spec));
                Some(inv.phases.len() - 1)
            } else {
                None
            }
        };

        if let Some(index) = adaptive_phase {
            self.execute_phase(&investigation, index).await;
        }
        true
    }

    pub async fn get_investigation(&self, investigation_id: &str) -> Option<Value> {
        let investigation = self
            .investigations
            .get(investigation_id)
            .map(|entry| entry.value().clone())?;
        let inv = investigation.lock().await;

        let mut view = self.decorated_view(&inv);
        if let Some(object) = view.as_object_mut() {
            object.insert("evidence".into(), json!(inv.evidence));
        }
        Some(view)
    }

    /// Serialize the full investigation state. Persistence is opt-in.
    pub async fn save_state(&self, investigation_id: &str) -> Option<Value> {
        if !self.config.enable_persistence {
            return None;
        }
        let investigation = self
            .investigations
            .get(investigation_id)
            .map(|entry| entry.value().clone())?;
        let inv = investigation.lock().await;
        match inv.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(error = %e, "failed to snapshot investigation");
                None
            }
        }
    }

    /// Restore an investigation from a snapshot taken by `save_state`.
    pub async fn load_state(&self, investigation_id: &str, state: &Value) -> bool {
        if !self.config.enable_persistence {
            return false;
        }
        match Investigation::from_snapshot(state) {
            Ok(investigation) => {
                self.investigations.insert(
                    investigation_id.to_string(),
                    Arc::new(AsyncMutex::new(investigation)),
                );
                true
            }
            Err(e) => {
                error!(error = %e, "failed to load investigation state");
                false
            }
        }
    }

    pub fn get_metrics(&self) -> PipelineMetricsSnapshot {
        let metrics = self.metrics.lock().clone();
        let investigations = metrics.total_investigations.max(1) as f64;
        PipelineMetricsSnapshot {
            average_duration_ms: metrics.total_duration_ms / investigations,
            average_phases_per_investigation: metrics.total_phases_executed as f64
                / investigations,
            total_investigations: metrics.total_investigations,
            completed_investigations: metrics.completed_investigations,
            failed_investigations: metrics.failed_investigations,
            total_phases_executed: metrics.total_phases_executed,
            total_duration_ms: metrics.total_duration_ms,
            entities_discovered: metrics.entities_discovered,
            relationships_discovered: metrics.relationships_discovered,
            errors: metrics.errors,
        }
    }

    async fn run_investigation(
        &self,
        investigation: &SharedInvestigation,
        phases: Option<Vec<PhaseSpec>>,
    ) {
        {
            let mut inv = investigation.lock().await;
            let specs = phases.unwrap_or_else(Investigation::default_phase_specs);
            inv.phases = specs.into_iter().map(InvestigationPhase::from_spec).collect();

            if let Err(e) = inv.validate_phases() {
                error!(error = %e, "phase graph rejected");
                inv.status = InvestigationStatus::Failed;
                inv.errors.push(e.to_string());
                inv.completed_at = Some(Utc::now());
                return;
            }
        }

        if self.config.enable_parallel {
            self.run_parallel(investigation).await;
        } else {
            self.run_sequential(investigation).await;
        }

        let mut inv = investigation.lock().await;
        let any_failed = inv
            .phases
            .iter()
            .any(|phase| phase.status == PhaseStatus::Failed);
        inv.status = if any_failed && !self.config.continue_on_error {
            InvestigationStatus::Failed
        } else if any_failed {
            InvestigationStatus::CompletedWithErrors
        } else {
            InvestigationStatus::Completed
        };
        inv.completed_at = Some(Utc::now());
    }

    async fn run_sequential(&self, investigation: &SharedInvestigation) {
        enum Step {
            Execute(usize),
            Advance,
            Done,
        }

        let mut completed: HashSet<String> = HashSet::new();
        let mut index = 0usize;

        loop {
            let step = {
                let mut inv = investigation.lock().await;
                if index >= inv.phases.len() {
                    Step::Done
                } else if inv.phases[index].status != PhaseStatus::Pending {
                    // Adaptive phases appended mid-run were already executed;
                    // never re-run a terminal phase.
                    Step::Advance
                } else if !inv.phases[index]
                    .depends_on
                    .iter()
                    .all(|dep| completed.contains(dep))
                {
                    let request = AnalysisRequest::new(inv.phases[index].analysis_type)
                        .with_parameters(inv.phases[index].parameters.clone());
                    inv.phases[index].status = PhaseStatus::Skipped;
                    inv.phases[index].result = Some(AnalysisResult::failure(
                        request,
                        vec!["Dependencies not met".to_string()],
                    ));
                    Step::Advance
                } else {
                    Step::Execute(index)
                }
            };

            match step {
                Step::Done => break,
                Step::Advance => {
                    index += 1;
                }
                Step::Execute(phase_index) => {
                    self.execute_phase(investigation, phase_index).await;

                    let (name, status, anomaly) = {
                        let inv = investigation.lock().await;
                        let phase = &inv.phases[phase_index];
                        (
                            phase.name.clone(),
                            phase.status,
                            Self::anomaly_detected(phase),
                        )
                    };

                    if status == PhaseStatus::Completed {
                        completed.insert(name);
                    } else if !self.config.continue_on_error {
                        break;
                    }

                    if self.config.adaptive && anomaly {
                        self.trigger_adaptive(investigation, phase_index).await;
                    }
                    index += 1;
                }
            }
        }
    }

    async fn run_parallel(&self, investigation: &SharedInvestigation) {
        let mut completed: HashSet<String> = HashSet::new();

        loop {
            // Snapshot the ready set before launching; the phase list is
            // never mutated while being iterated.
            let ready: Vec<usize> = {
                let mut inv = investigation.lock().await;
                let pending: Vec<usize> = inv
                    .phases
                    .iter()
                    .enumerate()
                    .filter(|(_, phase)| phase.status == PhaseStatus::Pending)
                    .map(|(index, _)| index)
                    .collect();
                if pending.is_empty() {
                    return;
                }

                let ready: Vec<usize> = pending
                    .into_iter()
                    .filter(|&index| {
                        inv.phases[index]
                            .depends_on
                            .iter()
                            .all(|dep| completed.contains(dep))
                    })
                    .collect();

                if ready.is_empty() {
                    let message =
                        "No phases ready to execute - possible circular dependency".to_string();
                    error!("{message}");
                    inv.errors.push(message);
                    return;
                }
                ready
            };

            join_all(
                ready
                    .iter()
                    .map(|&index| self.execute_phase(investigation, index)),
            )
            .await;

            let mut round_failed = false;
            let mut anomalies: Vec<usize> = Vec::new();
            {
                let inv = investigation.lock().await;
                for &index in &ready {
                    let phase = &inv.phases[index];
                    match phase.status {
                        PhaseStatus::Completed => {
                            completed.insert(phase.name.clone());
                            if Self::anomaly_detected(phase) {
                                anomalies.push(index);
                            }
                        }
                        PhaseStatus::Failed => round_failed = true,
                        _ => {}
                    }
                }
            }

            if round_failed && !self.config.continue_on_error {
                let mut inv = investigation.lock().await;
                for phase in &mut inv.phases {
                    if phase.status == PhaseStatus::Pending {
                        phase.status = PhaseStatus::Cancelled;
                    }
                }
                return;
            }

            if self.config.adaptive {
                for index in anomalies {
                    self.trigger_adaptive(investigation, index).await;
                }
            }
        }
    }

    async fn execute_phase(&self, investigation: &SharedInvestigation, phase_index: usize) {
        let request = {
            let mut inv = investigation.lock().await;
            let Some(phase) = inv.phases.get(phase_index) else {
                return;
            };
            let request = inv.phase_request(phase);
            let phase = &mut inv.phases[phase_index];
            phase.status = PhaseStatus::Running;
            phase.started_at = Some(Utc::now());
            request
        };

        let result = self.engine.analyze(request).await;

        {
            let mut inv = investigation.lock().await;
            if result.success {
                inv.phases[phase_index].status = PhaseStatus::Completed;
                let name = inv.phases[phase_index].name.clone();
                inv.absorb_result(&name, &result);
            } else {
                inv.phases[phase_index].status = PhaseStatus::Failed;
                inv.errors.extend(result.errors.iter().cloned());
                warn!(
                    phase = %inv.phases[phase_index].name,
                    errors = ?result.errors,
                    "phase failed"
                );
            }
            inv.phases[phase_index].result = Some(result);
            inv.phases[phase_index].completed_at = Some(Utc::now());
        }

        if self.config.collect_metrics {
            self.metrics.lock().total_phases_executed += 1;
        }
    }

    /// Appends and immediately runs a follow-up anomaly phase triggered by
    /// an earlier phase's signal.
    async fn trigger_adaptive(&self, investigation: &SharedInvestigation, trigger_index: usize) {
        let adaptive_index = {
            let mut inv = investigation.lock().await;
            inv.adaptive_actions += 1;

            let trigger = &inv.phases[trigger_index];
            let mut parameters = JsonMap::new();
            parameters.insert("triggered_by".into(), json!(trigger.name));
            parameters.insert(
                "context".into(),
                trigger
                    .result
                    .as_ref()
                    .and_then(|result| result.data.clone())
                    .unwrap_or_else(|| json!({})),
            );

            let spec = PhaseSpec::new(
                format!("adaptive_{}", trigger.name),
                AnalysisType::AnomalyDetection,
            )
            .with_parameters(parameters);
            inv.phases.push(InvestigationPhase::from_spec(spec));
            inv.phases.len() - 1
        };

        self.execute_phase(investigation, adaptive_index).await;
    }

    fn anomaly_detected(phase: &InvestigationPhase) -> bool {
        phase
            .result
            .as_ref()
            .and_then(|result| result.metadata.get("anomaly_detected"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// View plus exploration-planner decorations.
    fn decorated_view(&self, investigation: &Investigation) -> Value {
        let mut view = investigation.build_view();
        if let (Some(explorer), Some(object)) = (&self.explorer, view.as_object_mut()) {
            object.insert("strategy".into(), json!(explorer.name()));
            if let Some(hypotheses) = explorer.hypotheses() {
                object.insert("hypotheses".into(), hypotheses);
            }
            if let Some(depth) = explorer.max_depth_reached() {
                object.insert("max_depth_reached".into(), json!(depth));
            }
        }
        view
    }
}
