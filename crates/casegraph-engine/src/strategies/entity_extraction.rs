use super::{failed, finished};
use async_trait::async_trait;
use casegraph_core::params::{bool_param, str_param, string_list_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, CompletionRequest, Entity,
    GraphBackend, JsonMap, LlmProvider, ResponseFormat,
};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::warn;

const DEFAULT_ENTITY_TYPES: [&str; 8] = [
    "person",
    "organization",
    "location",
    "project",
    "event",
    "product",
    "technology",
    "concept",
];

const SYSTEM_PROMPT: &str = "You are an expert at extracting structured entities from unstructured text.
Focus on identifying key entities and their properties accurately.
Be conservative - only extract entities that are clearly mentioned in the text.
Provide confidence scores that reflect the clarity of the entity reference.";

/// Extracts entities from unstructured text via the LLM and persists them
/// into the graph, merging duplicates by `(type, normalized name)`.
#[derive(Default)]
pub struct EntityExtractionStrategy;

impl EntityExtractionStrategy {
    pub fn new() -> Self {
        Self
    }

    fn build_prompt(text: &str, entity_types: &[String], context: &JsonMap) -> String {
        let type_list = entity_types.join(", ");
        let context_str = if context.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nAdditional context:\n{}",
                serde_json::to_string_pretty(context).unwrap_or_default()
            )
        };

        format!(
            "Extract entities from the following text. Focus on identifying {type_list}.\n\n\
             Text:\n{text}\n{context_str}\n\n\
             For each entity, provide:\n\
             - name: The entity's name as it appears in the text\n\
             - type: One of {type_list}\n\
             - properties: A dictionary of relevant attributes\n\
             - confidence: A confidence score between 0 and 1\n\n\
             Return the result as a JSON object with an \"entities\" array."
        )
    }

    /// Deterministic id from the coarse class and normalized name.
    fn entity_id(entity_type: &str, name: &str) -> String {
        format!(
            "{}_{}",
            entity_type,
            name.to_lowercase().replace(' ', "_")
        )
    }

    fn entity_from_record(record: &Value, source: Option<&str>) -> Option<Entity> {
        let name = record.get("name")?.as_str()?;
        let entity_type = record.get("type")?.as_str()?;

        let mut entity = Entity::new(Self::entity_id(entity_type, name), name, entity_type)
            .with_confidence(record.get("confidence").and_then(Value::as_f64).unwrap_or(1.0));
        if let Some(properties) = record.get("properties").and_then(Value::as_object) {
            entity.properties = properties.clone();
        }
        if let Some(source) = source {
            entity.source = Some(source.to_string());
        }
        Some(entity)
    }

    async fn find_existing(
        &self,
        entity: &Entity,
        graph: &dyn GraphBackend,
    ) -> Option<Entity> {
        let mut criteria = JsonMap::new();
        criteria.insert("name".into(), json!(entity.name));
        criteria.insert("type".into(), json!(entity.entity_type));
        match graph.search_entities(&criteria).await {
            Ok(matches) => matches.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "entity search failed during deduplication");
                None
            }
        }
    }

    /// Union of properties (new wins on conflict); confidence is a weighted
    /// blend capped at 1.0; original id and source survive.
    fn merge(existing: Entity, new: Entity) -> Entity {
        let mut properties = existing.properties.clone();
        for (key, value) in new.properties {
            properties.insert(key, value);
        }
        let confidence = (existing.confidence * 0.7 + new.confidence * 0.3).min(1.0);

        Entity {
            id: existing.id,
            name: existing.name,
            entity_type: existing.entity_type,
            properties,
            confidence,
            source: existing.source.or(new.source),
            timestamp: existing.timestamp,
        }
    }
}

#[async_trait]
impl AnalysisStrategy for EntityExtractionStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::EntityExtraction
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let text = str_param(&request.parameters, "text").unwrap_or_default();
        if text.is_empty() {
            return failed(
                request,
                vec!["No text provided for entity extraction".to_string()],
                start,
            );
        }

        let entity_types = string_list_param(&request.parameters, "entity_types")
            .unwrap_or_else(|| DEFAULT_ENTITY_TYPES.iter().map(|s| s.to_string()).collect());
        let deduplicate = bool_param(&request.parameters, "deduplicate", true);
        let source = str_param(&request.context, "source");

        let prompt = Self::build_prompt(text, &entity_types, &request.context);
        let completion = CompletionRequest::new(prompt)
            .with_system_prompt(SYSTEM_PROMPT)
            .with_temperature(0.3)
            .with_response_format(ResponseFormat::JsonObject);

        let response = match llm.complete(completion).await {
            Ok(response) => response,
            Err(e) => return failed(request, vec![format!("LLM completion failed: {e}")], start),
        };

        let parsed: Value = match serde_json::from_str(&response) {
            Ok(parsed) => parsed,
            Err(e) => {
                return failed(
                    request,
                    vec![format!("Failed to parse LLM response: {e}")],
                    start,
                )
            }
        };
        let records = parsed
            .get("entities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut stored = Vec::new();
        let mut merged_count = 0usize;

        for record in &records {
            let Some(mut entity) = Self::entity_from_record(record, source) else {
                warn!("skipping malformed entity record");
                continue;
            };

            if deduplicate {
                if let Some(existing) = self.find_existing(&entity, graph).await {
                    entity = Self::merge(existing, entity);
                    merged_count += 1;
                }
            }

            match graph.add_entity(entity.clone()).await {
                Ok(true) => match entity.to_value() {
                    Ok(value) => stored.push(value),
                    Err(e) => warn!(error = %e, "failed to serialize stored entity"),
                },
                Ok(false) => warn!(name = %entity.name, "failed to store entity"),
                Err(e) => warn!(name = %entity.name, error = %e, "graph rejected entity"),
            }
        }

        let mut metadata = JsonMap::new();
        metadata.insert("entities_extracted".into(), json!(records.len()));
        metadata.insert("entities_stored".into(), json!(stored.len()));
        metadata.insert("merged_count".into(), json!(merged_count));
        metadata.insert("entity_types".into(), json!(entity_types));

        finished(
            AnalysisResult::success(request.clone(), json!({ "entities": stored }))
                .with_metadata(metadata),
            start,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use casegraph_graph::MemoryGraph;

    fn extraction_request(text: &str) -> AnalysisRequest {
        let mut params = JsonMap::new();
        params.insert("text".into(), json!(text));
        AnalysisRequest::new(AnalysisType::EntityExtraction).with_parameters(params)
    }

    const TWO_PEOPLE: &str = r#"{"entities": [
        {"name": "Alice", "type": "person", "properties": {"role": "manager"}, "confidence": 0.9},
        {"name": "Bob", "type": "person", "properties": {}, "confidence": 0.8}
    ]}"#;

    #[tokio::test]
    async fn extracts_and_stores_entities() {
        let llm = ScriptedLlm::new(vec![TWO_PEOPLE]);
        let graph = MemoryGraph::new();
        let strategy = EntityExtractionStrategy::new();

        let result = strategy
            .analyze(&extraction_request("Alice manages Bob"), &llm, &graph)
            .await;

        assert!(result.success, "errors: {:?}", result.errors);
        let entities = result.data.unwrap()["entities"].as_array().unwrap().clone();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0]["id"], "person_alice");
        assert_eq!(graph.entity_count(), 2);
        assert_eq!(result.metadata["entities_stored"], json!(2));
    }

    #[tokio::test]
    async fn empty_text_is_a_contract_failure() {
        let llm = ScriptedLlm::new(vec![]);
        let graph = MemoryGraph::new();
        let result = EntityExtractionStrategy::new()
            .analyze(&extraction_request(""), &llm, &graph)
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("No text provided"));
    }

    #[tokio::test]
    async fn malformed_json_surfaces_parse_error() {
        let llm = ScriptedLlm::new(vec!["not json at all"]);
        let graph = MemoryGraph::new();
        let result = EntityExtractionStrategy::new()
            .analyze(&extraction_request("some text"), &llm, &graph)
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("Failed to parse LLM response"));
    }

    #[tokio::test]
    async fn duplicate_extraction_merges_instead_of_duplicating() {
        let first = r#"{"entities": [
            {"name": "Alice", "type": "person", "properties": {"role": "manager"}, "confidence": 1.0}
        ]}"#;
        let second = r#"{"entities": [
            {"name": "Alice", "type": "person", "properties": {"ward": "north"}, "confidence": 0.5}
        ]}"#;
        let llm = ScriptedLlm::new(vec![first, second]);
        let graph = MemoryGraph::new();
        let strategy = EntityExtractionStrategy::new();

        strategy
            .analyze(&extraction_request("Alice appears"), &llm, &graph)
            .await;
        let result = strategy
            .analyze(&extraction_request("Alice appears again"), &llm, &graph)
            .await;

        assert_eq!(result.metadata["merged_count"], json!(1));
        assert_eq!(graph.entity_count(), 1);

        let alice = graph.get_entity("person_alice").await.unwrap().unwrap();
        assert_eq!(alice.properties["role"], json!("manager"));
        assert_eq!(alice.properties["ward"], json!("north"));
        let expected = 1.0 * 0.7 + 0.5 * 0.3;
        assert!((alice.confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let mixed = r#"{"entities": [
            {"type": "person"},
            {"name": "Bob", "type": "person"}
        ]}"#;
        let llm = ScriptedLlm::new(vec![mixed]);
        let graph = MemoryGraph::new();
        let result = EntityExtractionStrategy::new()
            .analyze(&extraction_request("Bob only"), &llm, &graph)
            .await;

        assert!(result.success);
        assert_eq!(result.metadata["entities_extracted"], json!(2));
        assert_eq!(result.metadata["entities_stored"], json!(1));
    }
}
