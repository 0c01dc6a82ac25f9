use super::{failed, finished};
use async_trait::async_trait;
use casegraph_core::params::{bool_param, string_list_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, CompletionRequest, Entity,
    GraphBackend, JsonMap, LlmProvider, Relationship, ResponseFormat,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_RELATIONSHIP_TYPES: [&str; 11] = [
    "works_for",
    "manages",
    "owns",
    "partners_with",
    "related_to",
    "knows",
    "located_in",
    "part_of",
    "connected_to",
    "influences",
    "depends_on",
];

const SYSTEM_PROMPT: &str = "You are an expert at identifying relationships between entities.
Analyze the entities carefully and identify meaningful connections.
Consider both explicit relationships and implicit connections based on shared attributes.
Be thoughtful about directionality - ensure source and target are correctly assigned.";

/// Maps relationships between known entities via the LLM and persists them.
#[derive(Default)]
pub struct RelationshipMappingStrategy;

impl RelationshipMappingStrategy {
    pub fn new() -> Self {
        Self
    }

    fn build_prompt(
        entities: &[Entity],
        relationship_types: &[String],
        infer_implicit: bool,
        context: &JsonMap,
    ) -> String {
        let entities_info: Vec<String> = entities
            .iter()
            .map(|entity| {
                let mut info = format!("- {} ({})", entity.name, entity.entity_type);
                if !entity.properties.is_empty() {
                    info.push_str(&format!(
                        " - Properties: {}",
                        serde_json::to_string(&entity.properties).unwrap_or_default()
                    ));
                }
                info
            })
            .collect();

        let implicit_instruction = if infer_implicit {
            "\nAlso infer implicit relationships based on:\n\
             - Shared properties or attributes\n\
             - Common patterns or behaviors\n\
             - Logical connections that may not be explicitly stated"
        } else {
            ""
        };

        let context_str = if context.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nAdditional context:\n{}",
                serde_json::to_string_pretty(context).unwrap_or_default()
            )
        };

        format!(
            "Analyze the following entities and identify relationships between them.\n\n\
             Entities:\n{}\n{context_str}\n\n\
             Focus on these relationship types: {}\n{implicit_instruction}\n\n\
             For each relationship, provide:\n\
             - source: The source entity name\n\
             - target: The target entity name\n\
             - type: The relationship type\n\
             - properties: A dictionary of relationship properties\n\
             - confidence: A confidence score between 0 and 1\n\n\
             Return the result as a JSON object with a \"relationships\" array.",
            entities_info.join("\n"),
            relationship_types.join(", "),
        )
    }

    fn relationship_from_record(
        record: &Value,
        source_id: &str,
        target_id: &str,
    ) -> Option<Relationship> {
        let rel_type = record.get("type")?.as_str()?;
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{source_id}_{target_id}_{rel_type}_{}", &suffix[..8]);

        let mut relationship = Relationship::new(id, source_id, target_id, rel_type)
            .with_confidence(record.get("confidence").and_then(Value::as_f64).unwrap_or(1.0));
        if let Some(properties) = record.get("properties").and_then(Value::as_object) {
            relationship.properties = properties.clone();
        }
        Some(relationship)
    }
}

#[async_trait]
impl AnalysisStrategy for RelationshipMappingStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::RelationshipMapping
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let entity_ids =
            string_list_param(&request.parameters, "entity_ids").unwrap_or_default();
        let infer_implicit = bool_param(&request.parameters, "infer_implicit", false);
        let relationship_types = string_list_param(&request.constraints, "relationship_types")
            .unwrap_or_else(|| {
                DEFAULT_RELATIONSHIP_TYPES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let mut entities = Vec::new();
        if entity_ids.is_empty() {
            match graph.get_entities(None, Some(100)).await {
                Ok(loaded) => entities = loaded,
                Err(e) => {
                    return failed(request, vec![format!("Failed to load entities: {e}")], start)
                }
            }
        } else {
            for entity_id in &entity_ids {
                match graph.get_entity(entity_id).await {
                    Ok(Some(entity)) => entities.push(entity),
                    Ok(None) => warn!(entity_id, "entity not found, skipping"),
                    Err(e) => warn!(entity_id, error = %e, "entity lookup failed"),
                }
            }
        }

        if entities.len() < 2 {
            return failed(
                request,
                vec!["Need at least 2 entities to map relationships".to_string()],
                start,
            );
        }

        let prompt =
            Self::build_prompt(&entities, &relationship_types, infer_implicit, &request.context);
        let completion = CompletionRequest::new(prompt)
            .with_system_prompt(SYSTEM_PROMPT)
            .with_temperature(0.4)
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
            .get("relationships")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let entity_lookup: HashMap<&str, &Entity> = entities
            .iter()
            .map(|entity| (entity.name.as_str(), entity))
            .collect();

        let mut stored = Vec::new();
        for record in &records {
            let source_name = record.get("source").and_then(Value::as_str);
            let target_name = record.get("target").and_then(Value::as_str);
            let (Some(source_name), Some(target_name)) = (source_name, target_name) else {
                warn!("skipping relationship record without source/target");
                continue;
            };

            let (Some(source), Some(target)) = (
                entity_lookup.get(source_name),
                entity_lookup.get(target_name),
            ) else {
                warn!(
                    source_name,
                    target_name, "could not resolve entities for relationship"
                );
                continue;
            };

            let Some(relationship) = Self::relationship_from_record(record, &source.id, &target.id)
            else {
                warn!("skipping relationship record without type");
                continue;
            };

            match graph.add_relationship(relationship.clone()).await {
                Ok(true) => match relationship.to_value() {
                    Ok(value) => stored.push(value),
                    Err(e) => warn!(error = %e, "failed to serialize stored relationship"),
                },
                Ok(false) => warn!(
                    source = %source.name,
                    target = %target.name,
                    "failed to store relationship"
                ),
                Err(e) => warn!(error = %e, "graph rejected relationship"),
            }
        }

        let mut metadata = JsonMap::new();
        metadata.insert("relationships_found".into(), json!(records.len()));
        metadata.insert("relationships_stored".into(), json!(stored.len()));
        metadata.insert("entities_analyzed".into(), json!(entities.len()));
        metadata.insert("inferred_implicit".into(), json!(infer_implicit));

        finished(
            AnalysisResult::success(request.clone(), json!({ "relationships": stored }))
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

    async fn seeded_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        graph
            .add_entity(Entity::new("person_alice", "Alice", "person"))
            .await
            .unwrap();
        graph
            .add_entity(Entity::new("person_bob", "Bob", "person"))
            .await
            .unwrap();
        graph
    }

    fn mapping_request(entity_ids: &[&str]) -> AnalysisRequest {
        let mut params = JsonMap::new();
        params.insert("entity_ids".into(), json!(entity_ids));
        AnalysisRequest::new(AnalysisType::RelationshipMapping).with_parameters(params)
    }

    #[tokio::test]
    async fn maps_and_persists_relationships() {
        let graph = seeded_graph().await;
        let llm = ScriptedLlm::new(vec![
            r#"{"relationships": [
                {"source": "Alice", "target": "Bob", "type": "manages", "properties": {}, "confidence": 0.9}
            ]}"#,
        ]);

        let result = RelationshipMappingStrategy::new()
            .analyze(
                &mapping_request(&["person_alice", "person_bob"]),
                &llm,
                &graph,
            )
            .await;

        assert!(result.success, "errors: {:?}", result.errors);
        let relationships = result.data.unwrap()["relationships"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0]["source_id"], "person_alice");
        assert_eq!(relationships[0]["target_id"], "person_bob");
        assert_eq!(graph.relationship_count(), 1);
    }

    #[tokio::test]
    async fn fewer_than_two_entities_is_a_failure() {
        let graph = MemoryGraph::new();
        graph
            .add_entity(Entity::new("person_alice", "Alice", "person"))
            .await
            .unwrap();
        let llm = ScriptedLlm::new(vec![]);

        let result = RelationshipMappingStrategy::new()
            .analyze(&mapping_request(&["person_alice"]), &llm, &graph)
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("at least 2 entities"));
    }

    #[tokio::test]
    async fn unresolvable_names_are_skipped_with_warning() {
        let graph = seeded_graph().await;
        let llm = ScriptedLlm::new(vec![
            r#"{"relationships": [
                {"source": "Alice", "target": "Mallory", "type": "knows"},
                {"source": "Bob", "target": "Alice", "type": "knows"}
            ]}"#,
        ]);

        let result = RelationshipMappingStrategy::new()
            .analyze(
                &mapping_request(&["person_alice", "person_bob"]),
                &llm,
                &graph,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.metadata["relationships_found"], json!(2));
        assert_eq!(result.metadata["relationships_stored"], json!(1));
    }

    #[tokio::test]
    async fn loads_entities_from_graph_when_ids_absent() {
        let graph = seeded_graph().await;
        let llm = ScriptedLlm::new(vec![r#"{"relationships": []}"#]);

        let result = RelationshipMappingStrategy::new()
            .analyze(
                &AnalysisRequest::new(AnalysisType::RelationshipMapping),
                &llm,
                &graph,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.metadata["entities_analyzed"], json!(2));
    }
}
