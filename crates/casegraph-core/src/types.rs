use crate::{CaseGraphError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Free-form JSON property bag used throughout the domain model.
///
/// `serde_json::Map` is BTree-backed, so serializing one always produces
/// sorted keys. Cache-key hashing relies on that.
pub type JsonMap = serde_json::Map<String, Value>;

/// Kinds of analysis supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    EntityExtraction,
    RelationshipMapping,
    CommunityDetection,
    AnomalyDetection,
    PathFinding,
    CentralityAnalysis,
    PatternRecognition,
    RiskScoring,
    TemporalAnalysis,
    FinancialAnalysis,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::EntityExtraction => "entity_extraction",
            AnalysisType::RelationshipMapping => "relationship_mapping",
            AnalysisType::CommunityDetection => "community_detection",
            AnalysisType::AnomalyDetection => "anomaly_detection",
            AnalysisType::PathFinding => "path_finding",
            AnalysisType::CentralityAnalysis => "centrality_analysis",
            AnalysisType::PatternRecognition => "pattern_recognition",
            AnalysisType::RiskScoring => "risk_scoring",
            AnalysisType::TemporalAnalysis => "temporal_analysis",
            AnalysisType::FinancialAnalysis => "financial_analysis",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = CaseGraphError;

    fn from_str(s: &str) -> Result<Self> {
        // Legacy snapshots carry tags like "AnalysisType.ENTITY_EXTRACTION";
        // accept both forms.
        let tag = s
            .strip_prefix("AnalysisType.")
            .map(|rest| rest.to_ascii_lowercase())
            .unwrap_or_else(|| s.to_string());

        match tag.as_str() {
            "entity_extraction" => Ok(AnalysisType::EntityExtraction),
            "relationship_mapping" => Ok(AnalysisType::RelationshipMapping),
            "community_detection" => Ok(AnalysisType::CommunityDetection),
            "anomaly_detection" => Ok(AnalysisType::AnomalyDetection),
            "path_finding" => Ok(AnalysisType::PathFinding),
            "centrality_analysis" => Ok(AnalysisType::CentralityAnalysis),
            "pattern_recognition" => Ok(AnalysisType::PatternRecognition),
            "risk_scoring" => Ok(AnalysisType::RiskScoring),
            "temporal_analysis" => Ok(AnalysisType::TemporalAnalysis),
            "financial_analysis" => Ok(AnalysisType::FinancialAnalysis),
            other => Err(CaseGraphError::Configuration(format!(
                "Unknown analysis type: {other}"
            ))),
        }
    }
}

/// An entity in the intelligence graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub properties: JsonMap,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_confidence() -> f64 {
    1.0
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            properties: JsonMap::new(),
            confidence: 1.0,
            source: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_properties(mut self, properties: JsonMap) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A directed relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: JsonMap,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            rel_type: rel_type.into(),
            properties: JsonMap::new(),
            confidence: 1.0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_properties(mut self, properties: JsonMap) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A request for one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(rename = "type")]
    pub analysis_type: AnalysisType,
    #[serde(default)]
    pub parameters: JsonMap,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub constraints: JsonMap,
}

impl AnalysisRequest {
    pub fn new(analysis_type: AnalysisType) -> Self {
        Self {
            analysis_type,
            parameters: JsonMap::new(),
            context: JsonMap::new(),
            constraints: JsonMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: JsonMap) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    pub fn with_constraints(mut self, constraints: JsonMap) -> Self {
        self.constraints = constraints;
        self
    }

    /// JSON rendering of the request for inclusion in LLM prompts.
    pub fn to_prompt_context(&self) -> String {
        let value = serde_json::json!({
            "analysis_type": self.analysis_type.as_str(),
            "parameters": self.parameters,
            "context": self.context,
            "constraints": self.constraints,
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

/// The outcome of one analysis run.
///
/// Failures are encoded here, never raised: `success == false` with
/// human-readable `errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request: AnalysisRequest,
    pub success: bool,
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: JsonMap,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn success(request: AnalysisRequest, data: Value) -> Self {
        Self {
            request,
            success: true,
            data: Some(data),
            metadata: JsonMap::new(),
            errors: Vec::new(),
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(request: AnalysisRequest, errors: Vec<String>) -> Self {
        Self {
            request,
            success: false,
            data: None,
            metadata: JsonMap::new(),
            errors,
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
