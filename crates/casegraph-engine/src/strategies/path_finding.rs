use super::{failed, finished};
use async_trait::async_trait;
use casegraph_core::params::{bool_param, str_param, string_list_param, usize_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, Entity, GraphBackend,
    JsonMap, LlmProvider,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Instant;

/// Finds connection paths between two entities.
///
/// Multi-path mode is an approximation: it re-queries the backend with
/// increasing length bounds and deduplicates by node-id tuple rather than
/// running a true k-shortest-paths algorithm.
#[derive(Default)]
pub struct PathFindingStrategy;

impl PathFindingStrategy {
    pub fn new() -> Self {
        Self
    }

    fn format_path(path: &[Entity]) -> Vec<Value> {
        path.iter()
            .map(|entity| {
                json!({
                    "id": entity.id,
                    "name": entity.name,
                    "type": entity.entity_type,
                    "properties": entity.properties,
                })
            })
            .collect()
    }

    fn path_avoids(path: &[Entity], avoid_entity_types: &[String]) -> bool {
        avoid_entity_types.is_empty()
            || path
                .iter()
                .all(|entity| !avoid_entity_types.contains(&entity.entity_type))
    }

    async fn find_multiple(
        graph: &dyn GraphBackend,
        source_id: &str,
        target_id: &str,
        max_length: usize,
        max_paths: usize,
        avoid_entity_types: &[String],
    ) -> casegraph_core::Result<Vec<Vec<Entity>>> {
        let mut paths: Vec<Vec<Entity>> = Vec::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();

        for length in 2..=max_length.max(2) {
            let Some(path) = graph.find_path(source_id, target_id, Some(length)).await? else {
                continue;
            };

            let key: Vec<String> = path.iter().map(|e| e.id.clone()).collect();
            if !seen.insert(key) {
                continue;
            }
            if Self::path_avoids(&path, avoid_entity_types) {
                paths.push(path);
                if paths.len() >= max_paths {
                    break;
                }
            }
        }

        Ok(paths)
    }
}

#[async_trait]
impl AnalysisStrategy for PathFindingStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::PathFinding
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let source_id = str_param(&request.parameters, "source_id");
        let target_id = str_param(&request.parameters, "target_id");
        let (Some(source_id), Some(target_id)) = (source_id, target_id) else {
            return failed(
                request,
                vec!["Both source_id and target_id are required".to_string()],
                start,
            );
        };

        let max_length = usize_param(&request.parameters, "max_length", 10);
        let find_all = bool_param(&request.parameters, "find_all", false);
        let max_paths = usize_param(&request.parameters, "max_paths", 5);
        let avoid_entity_types =
            string_list_param(&request.constraints, "avoid_entity_types").unwrap_or_default();

        let data = if find_all {
            let paths = match Self::find_multiple(
                graph,
                source_id,
                target_id,
                max_length,
                max_paths,
                &avoid_entity_types,
            )
            .await
            {
                Ok(paths) => paths,
                Err(e) => {
                    return failed(request, vec![format!("Path finding failed: {e}")], start)
                }
            };

            let formatted: Vec<Value> = paths
                .iter()
                .map(|path| {
                    json!({
                        "path": Self::format_path(path),
                        "length": path.len().saturating_sub(1),
                    })
                })
                .collect();
            json!({
                "paths": formatted,
                "num_paths": formatted.len(),
            })
        } else {
            let path = match graph.find_path(source_id, target_id, Some(max_length)).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    return failed(
                        request,
                        vec![format!("No path found from {source_id} to {target_id}")],
                        start,
                    )
                }
                Err(e) => {
                    return failed(request, vec![format!("Path finding failed: {e}")], start)
                }
            };

            let path: Vec<Entity> = if avoid_entity_types.is_empty() {
                path
            } else {
                path.into_iter()
                    .filter(|entity| !avoid_entity_types.contains(&entity.entity_type))
                    .collect()
            };

            json!({
                "path": Self::format_path(&path),
                "path_length": path.len().saturating_sub(1),
            })
        };

        let mut metadata = JsonMap::new();
        metadata.insert("source_id".into(), json!(source_id));
        metadata.insert("target_id".into(), json!(target_id));
        metadata.insert("max_length".into(), json!(max_length));
        metadata.insert(
            "constraints_applied".into(),
            json!(!avoid_entity_types.is_empty()),
        );

        finished(
            AnalysisResult::success(request.clone(), data).with_metadata(metadata),
            start,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;
    use casegraph_core::Relationship;
    use casegraph_graph::MemoryGraph;

    async fn chain_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        for id in ["a", "b", "c"] {
            graph
                .add_entity(Entity::new(id, id.to_uppercase(), "person"))
                .await
                .unwrap();
        }
        graph
            .add_relationship(Relationship::new("r1", "a", "b", "knows"))
            .await
            .unwrap();
        graph
            .add_relationship(Relationship::new("r2", "b", "c", "knows"))
            .await
            .unwrap();
        graph
    }

    fn path_request(source: &str, target: &str) -> AnalysisRequest {
        let mut params = JsonMap::new();
        params.insert("source_id".into(), json!(source));
        params.insert("target_id".into(), json!(target));
        AnalysisRequest::new(AnalysisType::PathFinding).with_parameters(params)
    }

    #[tokio::test]
    async fn finds_shortest_path() {
        let graph = chain_graph().await;
        let llm = ScriptedLlm::new(vec![]);

        let result = PathFindingStrategy::new()
            .analyze(&path_request("a", "c"), &llm, &graph)
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["path_length"], json!(2));
        assert_eq!(data["path"][0]["id"], "a");
        assert_eq!(data["path"][2]["id"], "c");
    }

    #[tokio::test]
    async fn missing_endpoint_parameter_is_a_contract_failure() {
        let graph = chain_graph().await;
        let llm = ScriptedLlm::new(vec![]);

        let mut params = JsonMap::new();
        params.insert("source_id".into(), json!("a"));
        let request = AnalysisRequest::new(AnalysisType::PathFinding).with_parameters(params);

        let result = PathFindingStrategy::new().analyze(&request, &llm, &graph).await;
        assert!(!result.success);
        assert!(result.errors[0].contains("source_id and target_id"));
    }

    #[tokio::test]
    async fn identical_endpoints_yield_single_element_path() {
        let graph = chain_graph().await;
        let llm = ScriptedLlm::new(vec![]);

        let result = PathFindingStrategy::new()
            .analyze(&path_request("a", "a"), &llm, &graph)
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["path"].as_array().unwrap().len(), 1);
        assert_eq!(data["path_length"], json!(0));
    }

    #[tokio::test]
    async fn disconnected_endpoints_fail_with_message() {
        let graph = chain_graph().await;
        graph
            .add_entity(Entity::new("z", "Z", "person"))
            .await
            .unwrap();
        let llm = ScriptedLlm::new(vec![]);

        let result = PathFindingStrategy::new()
            .analyze(&path_request("a", "z"), &llm, &graph)
            .await;
        assert!(!result.success);
        assert!(result.errors[0].contains("No path found"));
    }

    #[tokio::test]
    async fn multi_path_mode_deduplicates() {
        let graph = chain_graph().await;
        let llm = ScriptedLlm::new(vec![]);

        let mut request = path_request("a", "c");
        request.parameters.insert("find_all".into(), json!(true));

        let result = PathFindingStrategy::new().analyze(&request, &llm, &graph).await;
        assert!(result.success);
        let data = result.data.unwrap();
        // Every length bound resolves to the same shortest path.
        assert_eq!(data["num_paths"], json!(1));
        assert_eq!(data["paths"][0]["length"], json!(2));
    }

    #[tokio::test]
    async fn avoid_constraint_filters_paths() {
        let graph = chain_graph().await;
        let llm = ScriptedLlm::new(vec![]);

        let mut request = path_request("a", "c");
        request.parameters.insert("find_all".into(), json!(true));
        request
            .constraints
            .insert("avoid_entity_types".into(), json!(["person"]));

        let result = PathFindingStrategy::new().analyze(&request, &llm, &graph).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["num_paths"], json!(0));
    }
}
