use crate::investigation::PhaseSpec;
use casegraph_core::{
    AnalysisType, CompletionRequest, JsonMap, LlmProvider, ResponseFormat,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// The slice of investigation state planners reason over.
#[derive(Debug, Clone, Default)]
pub struct ExplorationState {
    pub initial_context: JsonMap,
    /// Discovered entities keyed by id.
    pub entities: JsonMap,
}

impl ExplorationState {
    fn to_value(&self) -> Value {
        json!({
            "initial_context": self.initial_context,
            "entities": self.entities,
        })
    }

    fn entity_name(&self, entity_id: &str) -> String {
        self.entities
            .get(entity_id)
            .and_then(|entity| entity.get("name"))
            .and_then(Value::as_str)
            .unwrap_or(entity_id)
            .to_string()
    }
}

/// What a planner wants to happen next.
#[derive(Debug, Clone)]
pub enum PlannedPhase {
    /// Run an analysis phase.
    Analysis(PhaseSpec),
    /// Ask the LLM for hypotheses first (hypothesis-driven planner only);
    /// drive it through `HypothesisDrivenStrategy::generate_hypotheses`.
    GenerateHypotheses { name: String },
}

/// Advisory next-phase planner. The pipeline reports planner state in
/// investigation views; callers may also drive planners directly.
pub trait ExplorationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn plan_next_phase(
        &self,
        state: &ExplorationState,
        completed_phases: &HashSet<String>,
    ) -> Option<PlannedPhase>;

    fn hypotheses(&self) -> Option<Value> {
        None
    }

    fn max_depth_reached(&self) -> Option<usize> {
        None
    }
}

#[derive(Default)]
struct BreadthFirstState {
    current_depth: usize,
    entities_by_depth: HashMap<usize, Vec<String>>,
}

/// Explores every known entity at the current depth before advancing.
pub struct BreadthFirstStrategy {
    max_depth: usize,
    state: Mutex<BreadthFirstState>,
}

impl BreadthFirstStrategy {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            state: Mutex::new(BreadthFirstState::default()),
        }
    }
}

impl Default for BreadthFirstStrategy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ExplorationStrategy for BreadthFirstStrategy {
    fn name(&self) -> &'static str {
        "breadth_first"
    }

    fn plan_next_phase(
        &self,
        state: &ExplorationState,
        completed_phases: &HashSet<String>,
    ) -> Option<PlannedPhase> {
        let mut inner = self.state.lock();

        if state.entities.is_empty() && inner.current_depth == 0 {
            return Some(PlannedPhase::Analysis(
                PhaseSpec::new("initial_extraction", AnalysisType::EntityExtraction)
                    .with_parameters(state.initial_context.clone()),
            ));
        }

        for (entity_id, entity) in &state.entities {
            let depth = entity
                .get("depth")
                .and_then(Value::as_u64)
                .map(|d| d as usize)
                .unwrap_or(inner.current_depth);
            let bucket = inner.entities_by_depth.entry(depth).or_default();
            if !bucket.contains(entity_id) {
                bucket.push(entity_id.clone());
            }
        }

        loop {
            let current = inner
                .entities_by_depth
                .get(&inner.current_depth)
                .cloned()
                .unwrap_or_default();

            for entity_id in current {
                let phase_name = format!("explore_{entity_id}_depth_{}", inner.current_depth);
                if !completed_phases.contains(&phase_name) {
                    let mut parameters = JsonMap::new();
                    parameters.insert("entity_id".into(), json!(entity_id));
                    parameters.insert(
                        "context".into(),
                        json!(format!(
                            "Explore connections of {}",
                            state.entity_name(&entity_id)
                        )),
                    );
                    return Some(PlannedPhase::Analysis(
                        PhaseSpec::new(phase_name, AnalysisType::EntityExtraction)
                            .with_parameters(parameters),
                    ));
                }
            }

            inner.current_depth += 1;
            if inner.current_depth >= self.max_depth {
                return None;
            }
        }
    }

    fn max_depth_reached(&self) -> Option<usize> {
        Some(self.state.lock().current_depth)
    }
}

#[derive(Default)]
struct DepthFirstState {
    stack: Vec<(String, usize)>,
    explored: HashSet<String>,
    max_depth_seen: usize,
}

/// Follows one branch to its leaf before backtracking (LIFO stack).
pub struct DepthFirstStrategy {
    max_depth: usize,
    state: Mutex<DepthFirstState>,
}

impl DepthFirstStrategy {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            state: Mutex::new(DepthFirstState::default()),
        }
    }
}

impl Default for DepthFirstStrategy {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ExplorationStrategy for DepthFirstStrategy {
    fn name(&self) -> &'static str {
        "depth_first"
    }

    fn plan_next_phase(
        &self,
        state: &ExplorationState,
        completed_phases: &HashSet<String>,
    ) -> Option<PlannedPhase> {
        let mut inner = self.state.lock();

        if state.entities.is_empty() && inner.stack.is_empty() {
            return Some(PlannedPhase::Analysis(
                PhaseSpec::new("initial_extraction", AnalysisType::EntityExtraction)
                    .with_parameters(state.initial_context.clone()),
            ));
        }

        for (entity_id, entity) in &state.entities {
            if inner.explored.contains(entity_id) {
                continue;
            }
            let depth = entity
                .get("depth")
                .and_then(Value::as_u64)
                .map(|d| d as usize)
                .unwrap_or(0);
            if depth < self.max_depth {
                inner.stack.push((entity_id.clone(), depth));
                inner.explored.insert(entity_id.clone());
            }
        }

        while let Some((entity_id, depth)) = inner.stack.pop() {
            inner.max_depth_seen = inner.max_depth_seen.max(depth);
            let phase_name = format!("explore_{entity_id}_depth_{depth}");
            if completed_phases.contains(&phase_name) {
                continue;
            }
            let mut parameters = JsonMap::new();
            parameters.insert("entity_id".into(), json!(entity_id));
            parameters.insert("depth".into(), json!(depth + 1));
            parameters.insert(
                "context".into(),
                json!(format!(
                    "Deep exploration of {}",
                    state.entity_name(&entity_id)
                )),
            );
            return Some(PlannedPhase::Analysis(
                PhaseSpec::new(phase_name, AnalysisType::EntityExtraction)
                    .with_parameters(parameters),
            ));
        }

        None
    }

    fn max_depth_reached(&self) -> Option<usize> {
        Some(self.state.lock().max_depth_seen)
    }
}

#[derive(Default)]
struct HypothesisState {
    hypotheses: Vec<Value>,
    tested: HashSet<String>,
}

/// Generates testable hypotheses via the LLM, then maps each one to the
/// analysis kind its wording calls for.
#[derive(Default)]
pub struct HypothesisDrivenStrategy {
    state: Mutex<HypothesisState>,
}

impl HypothesisDrivenStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the LLM for 2-3 testable hypotheses and stores them. Failures
    /// and malformed responses yield an empty set.
    pub async fn generate_hypotheses(
        &self,
        llm: &dyn LlmProvider,
        context: &JsonMap,
    ) -> Vec<Value> {
        let prompt = format!(
            "Based on the following investigation context, generate hypotheses to test:\n\n\
             Context: {}\n\n\
             Generate 2-3 specific, testable hypotheses about the entities and their relationships.\n\n\
             Return as JSON:\n\
             {{\n\
                 \"hypotheses\": [\n\
                     {{\n\
                         \"id\": \"h1\",\n\
                         \"description\": \"hypothesis description\",\n\
                         \"confidence\": 0.0-1.0,\n\
                         \"required_evidence\": [\"type of evidence needed\"]\n\
                     }}\n\
                 ]\n\
             }}",
            serde_json::to_string_pretty(context).unwrap_or_default(),
        );

        let completion = CompletionRequest::new(prompt)
            .with_system_prompt(
                "You are an investigation assistant generating testable hypotheses.",
            )
            .with_temperature(0.7)
            .with_response_format(ResponseFormat::JsonObject);

        let hypotheses = match llm.complete(completion).await {
            Ok(response) => match serde_json::from_str::<Value>(&response) {
                Ok(parsed) => parsed
                    .get("hypotheses")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "failed to parse hypothesis response");
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to generate hypotheses");
                Vec::new()
            }
        };

        self.state.lock().hypotheses = hypotheses.clone();
        hypotheses
    }

    /// Marks a hypothesis confirmed or refuted from a test result.
    pub fn update_hypotheses(&self, hypothesis_id: &str, result: &Value) {
        let mut inner = self.state.lock();
        for hypothesis in &mut inner.hypotheses {
            if hypothesis.get("id").and_then(Value::as_str) == Some(hypothesis_id) {
                let confirmed = Self::evaluate(hypothesis, result);
                if let Some(object) = hypothesis.as_object_mut() {
                    object.insert("confirmed".into(), json!(confirmed));
                }
                break;
            }
        }
    }

    fn evaluate(hypothesis: &Value, result: &Value) -> bool {
        let required = hypothesis
            .get("required_evidence")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for evidence_type in required.iter().filter_map(Value::as_str) {
            let lowered = evidence_type.to_lowercase();
            if lowered.contains("relationship") {
                if result
                    .get("relationships")
                    .and_then(Value::as_array)
                    .is_some_and(|r| !r.is_empty())
                {
                    return true;
                }
            } else if lowered.contains("anomaly")
                && result
                    .get("anomalies")
                    .and_then(Value::as_array)
                    .is_some_and(|a| !a.is_empty())
            {
                // Evidence of an anomaly refutes a no-anomaly hypothesis.
                return false;
            }
        }

        let has = |key: &str| {
            result
                .get(key)
                .and_then(Value::as_array)
                .is_some_and(|values| !values.is_empty())
        };
        has("entities") || has("relationships")
    }

    fn analysis_type_for(description: &str) -> AnalysisType {
        let lowered = description.to_lowercase();
        if lowered.contains("relationship") {
            AnalysisType::RelationshipMapping
        } else if lowered.contains("anomaly") {
            AnalysisType::AnomalyDetection
        } else if lowered.contains("community") {
            AnalysisType::CommunityDetection
        } else {
            AnalysisType::EntityExtraction
        }
    }
}

impl ExplorationStrategy for HypothesisDrivenStrategy {
    fn name(&self) -> &'static str {
        "hypothesis_driven"
    }

    fn plan_next_phase(
        &self,
        state: &ExplorationState,
        completed_phases: &HashSet<String>,
    ) -> Option<PlannedPhase> {
        let mut inner = self.state.lock();

        if inner.hypotheses.is_empty() && !completed_phases.contains("hypothesis_generation") {
            return Some(PlannedPhase::GenerateHypotheses {
                name: "hypothesis_generation".to_string(),
            });
        }

        let untested = inner.hypotheses.iter().find_map(|hypothesis| {
            let id = hypothesis.get("id").and_then(Value::as_str)?;
            (!inner.tested.contains(id)).then(|| (id.to_string(), hypothesis.clone()))
        });

        let (id, hypothesis) = untested?;
        inner.tested.insert(id.clone());

        let description = hypothesis
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let analysis_type = Self::analysis_type_for(description);

        let mut parameters = JsonMap::new();
        parameters.insert("hypothesis".into(), hypothesis);
        parameters.insert("context".into(), state.to_value());

        Some(PlannedPhase::Analysis(
            PhaseSpec::new(format!("test_hypothesis_{id}"), analysis_type)
                .with_parameters(parameters),
        ))
    }

    fn hypotheses(&self) -> Option<Value> {
        Some(json!(self.state.lock().hypotheses))
    }
}
