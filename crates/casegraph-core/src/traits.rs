use crate::{AnalysisRequest, AnalysisResult, AnalysisType, Entity, JsonMap, Relationship, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Response format hint for LLM completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// A single completion request against an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Model override; providers with a single model may ignore it. Used by
    /// the client wrapper for per-model rate limiting and cache keys.
    #[serde(default)]
    pub model: Option<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: None,
            response_format: None,
            model: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = Some(response_format);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A function call selected by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub function: Option<String>,
    pub arguments: Value,
}

/// Contract for LLM oracles.
///
/// When `response_format` is `JsonObject` the returned text must parse as
/// JSON; callers surface parse failures as strategy errors.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    async fn complete_with_functions(
        &self,
        prompt: &str,
        functions: &[Value],
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<FunctionCall>;

    fn estimate_tokens(&self, text: &str) -> usize;
}

/// Edge direction selector for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Both,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Both => write!(f, "both"),
        }
    }
}

impl FromStr for Direction {
    type Err = crate::CaseGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "both" => Ok(Direction::Both),
            other => Err(crate::CaseGraphError::InvalidRequest(format!(
                "Unknown direction: {other}"
            ))),
        }
    }
}

/// A slice of the graph around a set of seed entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

/// Contract for graph storage backends.
///
/// All operations may fail; failures surface as typed errors, never panics
/// that cross strategy boundaries.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Returns false when the backend refused the entity.
    async fn add_entity(&self, entity: Entity) -> Result<bool>;

    /// Returns false when either endpoint is unknown to the graph.
    async fn add_relationship(&self, relationship: Relationship) -> Result<bool>;

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>>;

    async fn get_entities(
        &self,
        filters: Option<&JsonMap>,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>>;

    async fn get_relationships(
        &self,
        entity_id: Option<&str>,
        rel_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>>;

    /// Criteria match top-level entity fields; dotted `properties.X` keys
    /// match nested property values.
    async fn search_entities(&self, criteria: &JsonMap) -> Result<Vec<Entity>>;

    async fn get_neighbors(
        &self,
        entity_id: &str,
        rel_type: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Entity>>;

    /// Shortest path following outgoing edges, or None. `max_length` bounds
    /// the number of edges in the returned path.
    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_length: Option<usize>,
    ) -> Result<Option<Vec<Entity>>>;

    /// Deletes the entity and cascades to its relationships.
    async fn delete_entity(&self, entity_id: &str) -> Result<bool>;

    async fn get_subgraph(&self, entity_ids: &[String], max_depth: usize) -> Result<Subgraph>;

    /// Backend-specific query escape hatch; backends without a query
    /// language return an empty list.
    async fn execute_query(&self, _query: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Contract for result caches. TTL absence means "until evicted".
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

/// Contract for analysis strategies.
///
/// Strategies are stateless and reentrant; concurrent `analyze` calls must
/// be safe. Failures are returned inside the result, never raised.
#[async_trait]
pub trait AnalysisStrategy: Send + Sync {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool;

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_lowercase_tags() {
        assert_eq!("both".parse::<Direction>().unwrap(), Direction::Both);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn completion_request_builder_defaults() {
        let request = CompletionRequest::new("hello")
            .with_temperature(0.3)
            .with_response_format(ResponseFormat::JsonObject);
        assert_eq!(request.temperature, 0.3);
        assert!(request.system_prompt.is_none());
        assert_eq!(request.response_format, Some(ResponseFormat::JsonObject));
    }
}
