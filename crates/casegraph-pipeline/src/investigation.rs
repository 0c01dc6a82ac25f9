use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisType, CaseGraphError, JsonMap, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Cancelled => "cancelled",
        };
        write!(f, "{tag}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Timeout,
}

impl fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            InvestigationStatus::Running => "running",
            InvestigationStatus::Completed => "completed",
            InvestigationStatus::CompletedWithErrors => "completed_with_errors",
            InvestigationStatus::Failed => "failed",
            InvestigationStatus::Timeout => "timeout",
        };
        write!(f, "{tag}")
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Declarative description of one phase, as supplied to `investigate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parameters: JsonMap,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, analysis_type: AnalysisType) -> Self {
        Self {
            name: name.into(),
            analysis_type,
            depends_on: Vec::new(),
            parameters: JsonMap::new(),
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: JsonMap) -> Self {
        self.parameters = parameters;
        self
    }
}

/// One node in an investigation's phase DAG.
#[derive(Debug, Clone)]
pub struct InvestigationPhase {
    pub name: String,
    pub analysis_type: AnalysisType,
    pub depends_on: Vec<String>,
    pub parameters: JsonMap,
    pub status: PhaseStatus,
    pub result: Option<AnalysisResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InvestigationPhase {
    pub fn from_spec(spec: PhaseSpec) -> Self {
        Self {
            name: spec.name,
            analysis_type: spec.analysis_type,
            depends_on: spec.depends_on,
            parameters: spec.parameters,
            status: PhaseStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            PhaseStatus::Completed
                | PhaseStatus::Failed
                | PhaseStatus::Skipped
                | PhaseStatus::Cancelled
        )
    }
}

/// An ongoing or finished investigation: its phase DAG plus everything the
/// phases discovered. Mutation is confined to the owning pipeline.
#[derive(Debug)]
pub struct Investigation {
    pub id: String,
    pub initial_context: JsonMap,
    pub objectives: Vec<String>,
    pub phases: Vec<InvestigationPhase>,
    pub evidence: Vec<Value>,
    pub status: InvestigationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub adaptive_actions: u64,
    /// Discovered entities keyed by id; duplicate extractions collapse here.
    pub entities: JsonMap,
    pub relationships: Vec<Value>,
    /// Raw result data per phase name.
    pub findings: JsonMap,
}

impl Investigation {
    pub fn new(id: impl Into<String>, initial_context: JsonMap, objectives: Vec<String>) -> Self {
        Self {
            id: id.into(),
            initial_context,
            objectives,
            phases: Vec::new(),
            evidence: Vec::new(),
            status: InvestigationStatus::Running,
            created_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            adaptive_actions: 0,
            entities: JsonMap::new(),
            relationships: Vec::new(),
            findings: JsonMap::new(),
        }
    }

    /// Structural validation of the declared phase DAG: unique names, known
    /// dependencies, and no cycles (Kahn's algorithm).
    pub fn validate_phases(&self) -> Result<()> {
        let mut names = HashSet::new();
        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                return Err(CaseGraphError::Structural(format!(
                    "Duplicate phase name: {}",
                    phase.name
                )));
            }
        }

        for phase in &self.phases {
            for dep in &phase.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(CaseGraphError::Structural(format!(
                        "Phase {} depends on unknown phase {dep}",
                        phase.name
                    )));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = self
            .phases
            .iter()
            .map(|phase| (phase.name.as_str(), phase.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for phase in &self.phases {
            for dep in &phase.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(phase.name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut resolved = 0usize;
        while let Some(name) = queue.pop_front() {
            resolved += 1;
            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        if resolved != self.phases.len() {
            return Err(CaseGraphError::Structural(
                "Cyclic phase dependencies".to_string(),
            ));
        }
        Ok(())
    }

    /// Folds a successful phase result into the accumulated state.
    pub fn absorb_result(&mut self, phase_name: &str, result: &AnalysisResult) {
        let Some(data) = &result.data else {
            return;
        };

        if let Some(entities) = data.get("entities").and_then(Value::as_array) {
            for entity in entities {
                let entity_id = entity
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                self.entities.insert(entity_id, entity.clone());
            }
        }

        if let Some(relationships) = data.get("relationships").and_then(Value::as_array) {
            self.relationships.extend(relationships.iter().cloned());
        }

        self.findings.insert(phase_name.to_string(), data.clone());
    }

    /// The stable external view shape shared by `investigate` and
    /// `get_investigation`.
    pub fn build_view(&self) -> Value {
        let phases: Vec<Value> = self
            .phases
            .iter()
            .map(|phase| {
                let mut entry = json!({
                    "name": phase.name,
                    "type": phase.analysis_type.as_str(),
                    "status": phase.status.to_string(),
                    "success": phase.status == PhaseStatus::Completed,
                    "started_at": phase.started_at.map(|t| t.to_rfc3339()),
                    "completed_at": phase.completed_at.map(|t| t.to_rfc3339()),
                });
                if let (Some(result), Some(object)) = (&phase.result, entry.as_object_mut()) {
                    object.insert("data".into(), result.data.clone().unwrap_or(Value::Null));
                    object.insert("errors".into(), json!(result.errors));
                }
                entry
            })
            .collect();

        json!({
            "investigation_id": self.id,
            "status": self.status.to_string(),
            "created_at": self.created_at.to_rfc3339(),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "objectives": self.objectives,
            "phases": phases,
            "total_entities": self.entities.len(),
            "total_relationships": self.relationships.len(),
            "errors": self.errors,
            "adaptive_actions": self.adaptive_actions,
        })
    }

    /// Full serialized state for persistence, phase history included.
    pub fn snapshot(&self) -> Result<Value> {
        let mut phases = Vec::new();
        for phase in &self.phases {
            let mut entry = json!({
                "name": phase.name,
                "analysis_type": phase.analysis_type.as_str(),
                "depends_on": phase.depends_on,
                "parameters": phase.parameters,
                "status": phase.status,
                "started_at": phase.started_at.map(|t| t.to_rfc3339()),
                "completed_at": phase.completed_at.map(|t| t.to_rfc3339()),
            });
            if let (Some(result), Some(object)) = (&phase.result, entry.as_object_mut()) {
                object.insert("result".into(), result.to_value()?);
            }
            phases.push(entry);
        }

        Ok(json!({
            "id": self.id,
            "initial_context": self.initial_context,
            "objectives": self.objectives,
            "status": self.status,
            "created_at": self.created_at.to_rfc3339(),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "entities": self.entities,
            "relationships": self.relationships,
            "findings": self.findings,
            "evidence": self.evidence,
            "errors": self.errors,
            "adaptive_actions": self.adaptive_actions,
            "phases": phases,
        }))
    }

    /// Rebuilds an investigation from a snapshot. Tolerates the legacy
    /// `AnalysisType.*` tag form in `analysis_type` fields.
    pub fn from_snapshot(state: &Value) -> Result<Self> {
        let corrupt = |field: &str| {
            CaseGraphError::Structural(format!("Corrupt snapshot: missing or invalid {field}"))
        };

        let id = state
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| corrupt("id"))?;
        let initial_context = state
            .get("initial_context")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| corrupt("initial_context"))?;
        let objectives: Vec<String> = state
            .get("objectives")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| corrupt("objectives"))?;

        let mut investigation = Investigation::new(id, initial_context, objectives);

        investigation.status = serde_json::from_value(
            state.get("status").cloned().ok_or_else(|| corrupt("status"))?,
        )
        .map_err(|_| corrupt("status"))?;
        investigation.created_at = state
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| corrupt("created_at"))?;
        investigation.completed_at = parse_timestamp(state.get("completed_at"));

        investigation.entities = state
            .get("entities")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        investigation.relationships = state
            .get("relationships")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        investigation.findings = state
            .get("findings")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        investigation.evidence = state
            .get("evidence")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        investigation.errors = state
            .get("errors")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        investigation.adaptive_actions = state
            .get("adaptive_actions")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        for entry in state
            .get("phases")
            .and_then(Value::as_array)
            .ok_or_else(|| corrupt("phases"))?
        {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| corrupt("phase name"))?;
            let analysis_type: AnalysisType = entry
                .get("analysis_type")
                .and_then(Value::as_str)
                .ok_or_else(|| corrupt("phase analysis_type"))?
                .parse()
                .map_err(|_| corrupt("phase analysis_type"))?;

            let mut phase = InvestigationPhase::from_spec(PhaseSpec {
                name: name.to_string(),
                analysis_type,
                depends_on: entry
                    .get("depends_on")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                parameters: entry
                    .get("parameters")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            });
            phase.status = serde_json::from_value(
                entry
                    .get("status")
                    .cloned()
                    .ok_or_else(|| corrupt("phase status"))?,
            )
            .map_err(|_| corrupt("phase status"))?;
            phase.started_at = parse_timestamp(entry.get("started_at"));
            phase.completed_at = parse_timestamp(entry.get("completed_at"));
            if let Some(result) = entry.get("result") {
                phase.result = Some(AnalysisResult::from_value(result.clone())?);
            }
            investigation.phases.push(phase);
        }

        Ok(investigation)
    }

    /// Default phase plan: extract, then map, then analyze communities.
    pub fn default_phase_specs() -> Vec<PhaseSpec> {
        vec![
            PhaseSpec::new("extract", AnalysisType::EntityExtraction),
            PhaseSpec::new("map", AnalysisType::RelationshipMapping).depends_on(&["extract"]),
            PhaseSpec::new("analyze", AnalysisType::CommunityDetection)
                .depends_on(&["extract", "map"]),
        ]
    }

    /// Builds the analysis request for a phase, weaving in context from
    /// earlier phases: relationship mapping inherits the accumulated entity
    /// ids, anomaly detection infers a target entity type.
    pub fn phase_request(&self, phase: &InvestigationPhase) -> AnalysisRequest {
        let mut parameters = phase.parameters.clone();

        if phase.analysis_type == AnalysisType::RelationshipMapping
            && !parameters.contains_key("entity_ids")
        {
            let entity_ids: Vec<&String> = self.entities.keys().collect();
            parameters.insert("entity_ids".into(), json!(entity_ids));
        }

        if phase.analysis_type == AnalysisType::AnomalyDetection
            && !parameters.contains_key("entity_type")
        {
            if let Some(entity_type) = self
                .entities
                .values()
                .find_map(|entity| entity.get("type").and_then(Value::as_str))
            {
                parameters.insert("entity_type".into(), json!(entity_type));
            }
        }

        AnalysisRequest::new(phase.analysis_type)
            .with_parameters(parameters)
            .with_context(self.initial_context.clone())
    }
}
