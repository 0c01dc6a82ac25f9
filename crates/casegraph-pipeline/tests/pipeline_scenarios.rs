//! End-to-end pipeline scenarios: default phase plans, parallel scheduling,
//! adaptive injection, timeouts, and state snapshot/restore.

use async_trait::async_trait;
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, CaseGraphError,
    CompletionRequest, EngineConfig, FunctionCall, GraphBackend, JsonMap, LlmProvider,
    PipelineConfig, Result,
};
use casegraph_engine::{default_strategies, AnalysisEngine, AnomalyDetectionStrategy};
use casegraph_graph::MemoryGraph;
use casegraph_pipeline::{InvestigationPipeline, PhaseSpec};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CaseGraphError::Llm("no scripted response left".to_string()))
    }

    async fn complete_with_functions(
        &self,
        _prompt: &str,
        _functions: &[Value],
        _system_prompt: Option<&str>,
        _temperature: f64,
    ) -> Result<FunctionCall> {
        Err(CaseGraphError::Llm("not scripted".to_string()))
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn pipeline_with(
    llm: Arc<dyn LlmProvider>,
    config: PipelineConfig,
    extra: Vec<Arc<dyn AnalysisStrategy>>,
) -> InvestigationPipeline {
    init_tracing();
    let engine = AnalysisEngine::new(
        llm,
        Arc::new(MemoryGraph::new()),
        EngineConfig::default(),
    );
    for strategy in extra {
        engine.add_strategy(strategy);
    }
    for strategy in default_strategies() {
        engine.add_strategy(strategy);
    }
    InvestigationPipeline::new(Arc::new(engine), config)
}

fn context(text: &str) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("text".into(), json!(text));
    map
}

fn extraction_spec(name: &str, text: &str) -> PhaseSpec {
    let mut params = JsonMap::new();
    params.insert("text".into(), json!(text));
    PhaseSpec::new(name, AnalysisType::EntityExtraction).with_parameters(params)
}

const ALICE_BOB: &str = r#"{"entities": [
    {"name": "Alice", "type": "person", "properties": {}, "confidence": 0.9},
    {"name": "Bob", "type": "person", "properties": {}, "confidence": 0.9}
]}"#;
const ALICE_MANAGES_BOB: &str = r#"{"relationships": [
    {"source": "Alice", "target": "Bob", "type": "manages", "properties": {}, "confidence": 0.9}
]}"#;

/// The default extract → map → analyze plan with the text parameter the
/// extraction strategy requires.
fn standard_phases(text: &str) -> Vec<PhaseSpec> {
    vec![
        extraction_spec("extract", text),
        PhaseSpec::new("map", AnalysisType::RelationshipMapping).depends_on(&["extract"]),
        PhaseSpec::new("analyze", AnalysisType::CommunityDetection)
            .depends_on(&["extract", "map"]),
    ]
}

#[tokio::test]
async fn default_plan_runs_extract_map_analyze() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
    let pipeline = pipeline_with(llm, PipelineConfig::default(), vec![]);

    let view = pipeline
        .investigate(
            context("Alice manages Bob"),
            vec!["map the network".to_string()],
            Some(standard_phases("Alice manages Bob")),
        )
        .await;

    assert_eq!(view["status"], "completed");
    let phases = view["phases"].as_array().unwrap();
    assert_eq!(phases.len(), 3);
    for phase in phases {
        assert_eq!(phase["status"], "completed", "phase: {phase}");
        assert_eq!(phase["success"], json!(true));
    }
    assert_eq!(phases[0]["type"], "entity_extraction");
    assert_eq!(view["total_entities"], json!(2));
    assert_eq!(view["total_relationships"], json!(1));
    assert_eq!(view["errors"], json!([]));
}

#[tokio::test]
async fn repeated_investigations_share_structure() {
    let build = || {
        let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
        pipeline_with(llm, PipelineConfig::default(), vec![])
    };

    let mut structures = Vec::new();
    for _ in 0..2 {
        let pipeline = build();
        // Omitted phases install the default extract -> map -> analyze plan.
        let view = pipeline
            .investigate(context("Alice manages Bob"), vec![], None)
            .await;
        assert_eq!(view["phases"][0]["name"], "extract");
        assert_eq!(view["phases"][1]["name"], "map");
        assert_eq!(view["phases"][2]["name"], "analyze");
        let structure: Vec<(String, String, String, Value)> = view["phases"]
            .as_array()
            .unwrap()
            .iter()
            .map(|phase| {
                (
                    phase["name"].as_str().unwrap().to_string(),
                    phase["type"].as_str().unwrap().to_string(),
                    phase["status"].as_str().unwrap().to_string(),
                    phase["success"].clone(),
                )
            })
            .collect();
        structures.push(structure);
    }
    assert_eq!(structures[0], structures[1]);
}

struct RecordingStrategy {
    windows: Mutex<Vec<(String, Instant, Instant)>>,
    delay: Duration,
}

impl RecordingStrategy {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            windows: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn window(&self, kind: &str) -> (Instant, Instant) {
        self.windows
            .lock()
            .iter()
            .find(|(k, _, _)| k == kind)
            .map(|(_, start, end)| (*start, *end))
            .expect("window recorded")
    }
}

#[async_trait]
impl AnalysisStrategy for RecordingStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        matches!(
            analysis_type,
            AnalysisType::EntityExtraction | AnalysisType::RelationshipMapping
        )
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        _graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let label = request
            .parameters
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("unlabelled")
            .to_string();
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.windows.lock().push((label, start, Instant::now()));
        AnalysisResult::success(request.clone(), json!({}))
    }
}

#[tokio::test]
async fn parallel_mode_overlaps_independent_phases() {
    let recorder = RecordingStrategy::new(Duration::from_millis(100));
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let pipeline = pipeline_with(
        llm,
        PipelineConfig {
            enable_parallel: true,
            ..PipelineConfig::default()
        },
        vec![recorder.clone()],
    );

    let labelled = |name: &str, kind: AnalysisType, deps: &[&str]| {
        let mut params = JsonMap::new();
        params.insert("label".into(), json!(name));
        PhaseSpec::new(name, kind).depends_on(deps).with_parameters(params)
    };

    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![
                labelled("extract_a", AnalysisType::EntityExtraction, &[]),
                labelled("extract_b", AnalysisType::EntityExtraction, &[]),
                labelled(
                    "map",
                    AnalysisType::RelationshipMapping,
                    &["extract_a", "extract_b"],
                ),
            ]),
        )
        .await;

    assert_eq!(view["status"], "completed");

    let (start_a, end_a) = recorder.window("extract_a");
    let (start_b, end_b) = recorder.window("extract_b");
    let (start_map, _) = recorder.window("map");

    // The two extraction windows overlap, and both close before mapping opens.
    assert!(start_a < end_b && start_b < end_a, "extractions did not overlap");
    assert!(end_a <= start_map && end_b <= start_map, "mapping started early");
}

struct AnomalyFlagStrategy;

#[async_trait]
impl AnalysisStrategy for AnomalyFlagStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::EntityExtraction
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        _graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let mut metadata = JsonMap::new();
        metadata.insert("anomaly_detected".into(), json!(true));
        AnalysisResult::success(request.clone(), json!({"entities": []}))
            .with_metadata(metadata)
    }
}

#[tokio::test]
async fn anomaly_signal_injects_adaptive_phase() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let engine = AnalysisEngine::new(
        llm,
        Arc::new(MemoryGraph::new()),
        EngineConfig::default(),
    );
    engine.add_strategy(Arc::new(AnomalyFlagStrategy));
    engine.add_strategy(Arc::new(AnomalyDetectionStrategy::new()));
    let pipeline = InvestigationPipeline::new(
        Arc::new(engine),
        PipelineConfig {
            adaptive: true,
            ..PipelineConfig::default()
        },
    );

    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![extraction_spec("suspicious_scan", "irrelevant")]),
        )
        .await;

    assert_eq!(view["adaptive_actions"], json!(1));
    let phases = view["phases"].as_array().unwrap();
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[1]["name"], "adaptive_suspicious_scan");
    assert_eq!(phases[1]["type"], "anomaly_detection");
    assert_eq!(phases[1]["status"], "completed");
}

struct SlowStrategy;

#[async_trait]
impl AnalysisStrategy for SlowStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::EntityExtraction
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        _graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        tokio::time::sleep(Duration::from_secs(5)).await;
        AnalysisResult::success(request.clone(), json!({}))
    }
}

#[tokio::test(start_paused = true)]
async fn investigation_timeout_cancels_in_flight_phases() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let engine = AnalysisEngine::new(
        llm,
        Arc::new(MemoryGraph::new()),
        EngineConfig::default(),
    );
    engine.add_strategy(Arc::new(SlowStrategy));
    let pipeline = InvestigationPipeline::new(
        Arc::new(engine),
        PipelineConfig {
            timeout_seconds: Some(1),
            ..PipelineConfig::default()
        },
    );

    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![extraction_spec("slow", "text")]),
        )
        .await;

    assert_eq!(view["status"], "timeout");
    assert!(view["errors"][0]
        .as_str()
        .unwrap()
        .contains("timed out after 1 seconds"));
    assert_eq!(view["phases"][0]["status"], "cancelled");
}

struct FailingStrategy;

#[async_trait]
impl AnalysisStrategy for FailingStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::EntityExtraction
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        _graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        AnalysisResult::failure(request.clone(), vec!["deliberate failure".to_string()])
    }
}

#[tokio::test]
async fn sequential_failure_stops_the_run() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let engine = AnalysisEngine::new(
        llm,
        Arc::new(MemoryGraph::new()),
        EngineConfig::default(),
    );
    engine.add_strategy(Arc::new(FailingStrategy));
    let pipeline = InvestigationPipeline::new(Arc::new(engine), PipelineConfig::default());

    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![
                extraction_spec("first", "text"),
                extraction_spec("second", "text"),
            ]),
        )
        .await;

    assert_eq!(view["status"], "failed");
    assert_eq!(view["phases"][0]["status"], "failed");
    assert_eq!(view["phases"][1]["status"], "pending");
    assert_eq!(view["errors"][0], "deliberate failure");
}

#[tokio::test]
async fn unmet_dependencies_skip_the_phase() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB]));
    let pipeline = pipeline_with(
        llm,
        PipelineConfig {
            continue_on_error: true,
            ..PipelineConfig::default()
        },
        vec![],
    );

    // "late" depends on a phase declared after it: acyclic, but unmet at
    // its turn in sequential order.
    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![
                PhaseSpec::new("late", AnalysisType::CommunityDetection).depends_on(&["extract"]),
                extraction_spec("extract", "Alice and Bob"),
            ]),
        )
        .await;

    assert_eq!(view["phases"][0]["status"], "skipped");
    assert_eq!(
        view["phases"][0]["errors"][0],
        json!("Dependencies not met")
    );
    assert_eq!(view["phases"][1]["status"], "completed");
}

#[tokio::test]
async fn cyclic_phases_abort_with_structural_error() {
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let pipeline = pipeline_with(llm, PipelineConfig::default(), vec![]);

    let view = pipeline
        .investigate(
            JsonMap::new(),
            vec![],
            Some(vec![
                PhaseSpec::new("a", AnalysisType::EntityExtraction).depends_on(&["b"]),
                PhaseSpec::new("b", AnalysisType::RelationshipMapping).depends_on(&["a"]),
            ]),
        )
        .await;

    assert_eq!(view["status"], "failed");
    assert!(view["errors"][0].as_str().unwrap().contains("Cyclic"));
    // Nothing ran.
    for phase in view["phases"].as_array().unwrap() {
        assert_eq!(phase["status"], "pending");
    }
}

#[tokio::test]
async fn save_and_load_round_trip_restores_the_view() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
    let pipeline = pipeline_with(
        llm,
        PipelineConfig {
            enable_persistence: true,
            ..PipelineConfig::default()
        },
        vec![],
    );

    let view = pipeline
        .investigate(
            context("Alice manages Bob"),
            vec!["objective".to_string()],
            Some(standard_phases("Alice manages Bob")),
        )
        .await;
    assert_eq!(view["status"], "completed");
    let investigation_id = view["investigation_id"].as_str().unwrap();

    let snapshot = pipeline.save_state(investigation_id).await.unwrap();

    let fresh = pipeline_with(
        Arc::new(ScriptedLlm::new(vec![])),
        PipelineConfig {
            enable_persistence: true,
            ..PipelineConfig::default()
        },
        vec![],
    );
    assert!(fresh.load_state(investigation_id, &snapshot).await);

    let original = pipeline.get_investigation(investigation_id).await.unwrap();
    let restored = fresh.get_investigation(investigation_id).await.unwrap();
    assert_eq!(original, restored);
}

#[tokio::test]
async fn persistence_disabled_refuses_snapshots() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
    let pipeline = pipeline_with(llm, PipelineConfig::default(), vec![]);

    let view = pipeline
        .investigate(context("Alice"), vec![], Some(standard_phases("Alice")))
        .await;
    let investigation_id = view["investigation_id"].as_str().unwrap();

    assert!(pipeline.save_state(investigation_id).await.is_none());
    assert!(!pipeline.load_state(investigation_id, &json!({})).await);
}

#[tokio::test]
async fn evidence_appends_and_triggers_followup_on_running_investigations() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB, ALICE_BOB]));
    let pipeline = pipeline_with(
        llm,
        PipelineConfig {
            adaptive: true,
            enable_persistence: true,
            ..PipelineConfig::default()
        },
        vec![],
    );

    let view = pipeline
        .investigate(
            context("Alice manages Bob"),
            vec![],
            Some(standard_phases("Alice manages Bob")),
        )
        .await;
    let investigation_id = view["investigation_id"].as_str().unwrap();

    // Terminal investigation: evidence is appended but no phase runs.
    assert!(
        pipeline
            .add_evidence(investigation_id, json!({"content": "a note", "type": "memo"}))
            .await
    );
    let after = pipeline.get_investigation(investigation_id).await.unwrap();
    assert_eq!(after["evidence"].as_array().unwrap().len(), 1);
    assert!(after["evidence"][0]["timestamp"].is_string());
    assert_eq!(after["phases"].as_array().unwrap().len(), 3);

    // Force the restored copy back to running; now evidence spawns an
    // extraction phase over the evidence body.
    let mut snapshot = pipeline.save_state(investigation_id).await.unwrap();
    snapshot["status"] = json!("running");
    assert!(pipeline.load_state(investigation_id, &snapshot).await);

    assert!(
        pipeline
            .add_evidence(
                investigation_id,
                json!({"content": "Alice met Bob", "type": "transcript"})
            )
            .await
    );
    let final_view = pipeline.get_investigation(investigation_id).await.unwrap();
    let phases = final_view["phases"].as_array().unwrap();
    assert_eq!(phases.len(), 4);
    assert_eq!(phases[3]["name"], "evidence_analysis_2");
    assert_eq!(phases[3]["type"], "entity_extraction");

    assert!(
        !pipeline
            .add_evidence("missing-id", json!({"content": "x"}))
            .await
    );
}

#[tokio::test]
async fn explorer_decorations_appear_in_views() {
    use casegraph_pipeline::{BreadthFirstStrategy, HypothesisDrivenStrategy};

    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
    let pipeline = pipeline_with(llm, PipelineConfig::default(), vec![])
        .with_explorer(Arc::new(HypothesisDrivenStrategy::new()));

    let view = pipeline
        .investigate(
            context("Alice manages Bob"),
            vec![],
            Some(standard_phases("Alice manages Bob")),
        )
        .await;
    assert_eq!(view["strategy"], "hypothesis_driven");
    assert_eq!(view["hypotheses"], json!([]));

    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let pipeline = pipeline_with(llm, PipelineConfig::default(), vec![])
        .with_explorer(Arc::new(BreadthFirstStrategy::default()));
    let view = pipeline.investigate(JsonMap::new(), vec![], Some(vec![])).await;
    assert_eq!(view["strategy"], "breadth_first");
    assert_eq!(view["max_depth_reached"], json!(0));
}

#[tokio::test]
async fn metrics_track_investigations_and_phases() {
    let llm = Arc::new(ScriptedLlm::new(vec![ALICE_BOB, ALICE_MANAGES_BOB]));
    let pipeline = pipeline_with(
        llm,
        PipelineConfig {
            collect_metrics: true,
            ..PipelineConfig::default()
        },
        vec![],
    );

    pipeline
        .investigate(
            context("Alice manages Bob"),
            vec![],
            Some(standard_phases("Alice manages Bob")),
        )
        .await;

    let metrics = pipeline.get_metrics();
    assert_eq!(metrics.total_investigations, 1);
    assert_eq!(metrics.completed_investigations, 1);
    assert_eq!(metrics.total_phases_executed, 3);
    assert_eq!(metrics.entities_discovered, 2);
    assert_eq!(metrics.relationships_discovered, 1);
    assert!(metrics.average_phases_per_investigation >= 3.0);
}
