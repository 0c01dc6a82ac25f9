use super::{failed, finished};
use async_trait::async_trait;
use casegraph_core::params::{f64_param, str_param, string_list_param, usize_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, CompletionRequest, Entity,
    GraphBackend, JsonMap, LlmProvider, Relationship, ResponseFormat,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::warn;

const PATTERN_SYSTEM_PROMPT: &str = "You are an expert at detecting anomalies and unusual patterns in data.
Focus on identifying entities that deviate from normal patterns or expected behavior.
Be thorough but avoid false positives - only flag clear anomalies.
Consider the context and entity type when determining what constitutes normal behavior.";

/// Number of nodes sampled for the betweenness approximation.
const CENTRALITY_SAMPLE: usize = 20;

/// Flags anomalous entities by statistical outliers on numeric properties,
/// LLM-judged behavioral patterns, or graph connectivity metrics.
#[derive(Default)]
pub struct AnomalyDetectionStrategy;

struct Stats {
    mean: f64,
    stdev: f64,
}

/// Sample mean and standard deviation; None below three samples or at zero
/// variance.
fn sample_stats(values: &[f64]) -> Option<Stats> {
    if values.len() < 3 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        return None;
    }
    Some(Stats { mean, stdev })
}

impl AnomalyDetectionStrategy {
    pub fn new() -> Self {
        Self
    }

    async fn statistical(
        graph: &dyn GraphBackend,
        entity_type: Option<&str>,
        threshold: f64,
    ) -> casegraph_core::Result<Vec<Value>> {
        let mut entities = graph.get_entities(None, None).await?;
        if let Some(entity_type) = entity_type {
            entities.retain(|e| e.entity_type == entity_type);
        }

        let mut numeric_properties: HashMap<String, Vec<(&Entity, f64)>> = HashMap::new();
        for entity in &entities {
            for (name, value) in &entity.properties {
                if let Some(number) = value.as_f64() {
                    numeric_properties
                        .entry(name.clone())
                        .or_default()
                        .push((entity, number));
                }
            }
        }

        let mut property_names: Vec<&String> = numeric_properties.keys().collect();
        property_names.sort();

        let mut anomalies = Vec::new();
        for name in property_names {
            let entity_values = &numeric_properties[name];
            let values: Vec<f64> = entity_values.iter().map(|(_, v)| *v).collect();
            let Some(stats) = sample_stats(&values) else {
                continue;
            };

            for (entity, value) in entity_values {
                let z_score = ((value - stats.mean) / stats.stdev).abs();
                if z_score > threshold {
                    anomalies.push(json!({
                        "entity_id": entity.id,
                        "entity_name": entity.name,
                        "entity_type": entity.entity_type,
                        "property": name,
                        "value": value,
                        "z_score": z_score,
                        "mean": stats.mean,
                        "stdev": stats.stdev,
                        "type": "statistical_outlier",
                    }));
                }
            }
        }
        Ok(anomalies)
    }

    async fn pattern(
        graph: &dyn GraphBackend,
        llm: &dyn LlmProvider,
        entity_type: Option<&str>,
        context_window: usize,
    ) -> casegraph_core::Result<Vec<Value>> {
        let mut entities = graph.get_entities(None, Some(context_window)).await?;
        if let Some(entity_type) = entity_type {
            entities.retain(|e| e.entity_type == entity_type);
        }
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = Self::build_pattern_prompt(&entities);
        let completion = CompletionRequest::new(prompt)
            .with_system_prompt(PATTERN_SYSTEM_PROMPT)
            .with_temperature(0.4)
            .with_response_format(ResponseFormat::JsonObject);

        let response = llm.complete(completion).await?;
        match serde_json::from_str::<Value>(&response) {
            Ok(parsed) => Ok(parsed
                .get("anomalies")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, "failed to parse pattern anomaly response");
                Ok(Vec::new())
            }
        }
    }

    fn build_pattern_prompt(entities: &[Entity]) -> String {
        let entities_info: Vec<String> = entities
            .iter()
            .take(50)
            .filter_map(|entity| {
                serde_json::to_string(&json!({
                    "id": entity.id,
                    "name": entity.name,
                    "type": entity.entity_type,
                    "properties": entity.properties,
                }))
                .ok()
            })
            .collect();

        format!(
            "Analyze the following entities and identify any that exhibit anomalous patterns:\n\n\
             Entities:\n{}\n\n\
             Look for:\n\
             - Entities with unusual property combinations\n\
             - Behavioral anomalies based on entity type\n\
             - Entities that don't fit expected patterns\n\
             - Suspicious or outlier characteristics\n\n\
             For each anomaly found, provide:\n\
             - entity_id: The ID of the anomalous entity\n\
             - type: The type of anomaly (e.g., \"behavioral\", \"property_mismatch\", \"suspicious_pattern\")\n\
             - description: A clear description of why this is anomalous\n\
             - confidence: Confidence score (0-1)\n\n\
             Return the result as a JSON object with an \"anomalies\" array.",
            entities_info.join("\n"),
        )
    }

    async fn graph_metrics(
        graph: &dyn GraphBackend,
        metrics: &[String],
        threshold: f64,
    ) -> casegraph_core::Result<Vec<Value>> {
        let entities = graph.get_entities(None, None).await?;
        let relationships = graph.get_relationships(None, None, None).await?;
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let mut anomalies = Vec::new();
        if metrics.iter().any(|m| m == "degree") {
            anomalies.extend(Self::degree_anomalies(&entities, &relationships, threshold));
        }
        if metrics.iter().any(|m| m == "centrality") {
            anomalies.extend(Self::centrality_anomalies(
                &entities,
                &relationships,
                threshold,
            ));
        }
        Ok(anomalies)
    }

    fn degree_anomalies(
        entities: &[Entity],
        relationships: &[Relationship],
        threshold: f64,
    ) -> Vec<Value> {
        let mut degree_map: HashMap<&str, usize> =
            entities.iter().map(|e| (e.id.as_str(), 0)).collect();
        for rel in relationships {
            if let Some(d) = degree_map.get_mut(rel.source_id.as_str()) {
                *d += 1;
            }
            if let Some(d) = degree_map.get_mut(rel.target_id.as_str()) {
                *d += 1;
            }
        }

        let values: Vec<f64> = degree_map.values().map(|d| *d as f64).collect();
        let Some(stats) = sample_stats(&values) else {
            return Vec::new();
        };

        let entity_lookup: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut flagged: Vec<(&str, usize, f64)> = degree_map
            .iter()
            .filter_map(|(id, degree)| {
                let z_score = ((*degree as f64 - stats.mean) / stats.stdev).abs();
                (z_score > threshold).then_some((*id, *degree, z_score))
            })
            .collect();
        flagged.sort_by(|a, b| a.0.cmp(b.0));

        flagged
            .into_iter()
            .filter_map(|(id, degree, z_score)| {
                entity_lookup.get(id).map(|entity| {
                    json!({
                        "entity_id": entity.id,
                        "entity_name": entity.name,
                        "entity_type": entity.entity_type,
                        "metric": "degree",
                        "value": degree,
                        "z_score": z_score,
                        "mean": stats.mean,
                        "stdev": stats.stdev,
                        "type": "graph_anomaly",
                    })
                })
            })
            .collect()
    }

    /// Approximate betweenness: count intermediate nodes on BFS shortest
    /// paths between up to `CENTRALITY_SAMPLE` sampled nodes, then z-score
    /// the counts.
    fn centrality_anomalies(
        entities: &[Entity],
        relationships: &[Relationship],
        threshold: f64,
    ) -> Vec<Value> {
        let mut adjacency: HashMap<&str, HashSet<&str>> = HashMap::new();
        for rel in relationships {
            adjacency
                .entry(rel.source_id.as_str())
                .or_default()
                .insert(rel.target_id.as_str());
            adjacency
                .entry(rel.target_id.as_str())
                .or_default()
                .insert(rel.source_id.as_str());
        }

        let mut entity_ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        entity_ids.sort();
        if entity_ids.len() > CENTRALITY_SAMPLE {
            fastrand::shuffle(&mut entity_ids);
            entity_ids.truncate(CENTRALITY_SAMPLE);
        }

        let mut betweenness: HashMap<&str, usize> = HashMap::new();
        for (i, source) in entity_ids.iter().enumerate() {
            for target in &entity_ids[i + 1..] {
                if let Some(path) = Self::bfs_path(source, target, &adjacency) {
                    if path.len() > 2 {
                        for node in &path[1..path.len() - 1] {
                            *betweenness.entry(node).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        if betweenness.len() < 3 {
            return Vec::new();
        }
        let values: Vec<f64> = betweenness.values().map(|v| *v as f64).collect();
        let Some(stats) = sample_stats(&values) else {
            return Vec::new();
        };

        let entity_lookup: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut flagged: Vec<(&str, usize, f64)> = betweenness
            .iter()
            .filter_map(|(id, count)| {
                let z_score = ((*count as f64 - stats.mean) / stats.stdev).abs();
                (z_score > threshold).then_some((*id, *count, z_score))
            })
            .collect();
        flagged.sort_by(|a, b| a.0.cmp(b.0));

        flagged
            .into_iter()
            .filter_map(|(id, count, z_score)| {
                entity_lookup.get(id).map(|entity| {
                    json!({
                        "entity_id": entity.id,
                        "entity_name": entity.name,
                        "entity_type": entity.entity_type,
                        "metric": "betweenness_centrality",
                        "value": count,
                        "z_score": z_score,
                        "mean": stats.mean,
                        "stdev": stats.stdev,
                        "type": "graph_anomaly",
                    })
                })
            })
            .collect()
    }

    fn bfs_path<'a>(
        source: &'a str,
        target: &'a str,
        adjacency: &HashMap<&'a str, HashSet<&'a str>>,
    ) -> Option<Vec<&'a str>> {
        if source == target {
            return Some(vec![source]);
        }
        let mut visited = HashSet::from([source]);
        let mut queue = VecDeque::from([(source, vec![source])]);

        while let Some((node, path)) = queue.pop_front() {
            if let Some(neighbors) = adjacency.get(node) {
                let mut sorted: Vec<&str> = neighbors.iter().copied().collect();
                sorted.sort();
                for neighbor in sorted {
                    if visited.insert(neighbor) {
                        let mut next_path = path.clone();
                        next_path.push(neighbor);
                        if neighbor == target {
                            return Some(next_path);
                        }
                        queue.push_back((neighbor, next_path));
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl AnalysisStrategy for AnomalyDetectionStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::AnomalyDetection
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let entity_type = str_param(&request.parameters, "entity_type");
        let method = str_param(&request.parameters, "method").unwrap_or("statistical");
        let threshold = f64_param(&request.parameters, "threshold", 2.0);
        let context_window = usize_param(&request.parameters, "context_window", 100);
        let metrics = string_list_param(&request.parameters, "metrics")
            .unwrap_or_else(|| vec!["degree".to_string()]);

        let outcome = match method {
            "pattern" => Self::pattern(graph, llm, entity_type, context_window).await,
            "graph" => Self::graph_metrics(graph, &metrics, threshold).await,
            _ => Self::statistical(graph, entity_type, threshold).await,
        };

        let anomalies = match outcome {
            Ok(anomalies) => anomalies,
            Err(e) => {
                return failed(request, vec![format!("Anomaly detection failed: {e}")], start)
            }
        };

        let mut metadata = JsonMap::new();
        metadata.insert("method".into(), json!(method));
        metadata.insert("entity_type".into(), json!(entity_type));
        metadata.insert("anomalies_found".into(), json!(anomalies.len()));
        metadata.insert("threshold".into(), json!(threshold));

        finished(
            AnalysisResult::success(request.clone(), json!({ "anomalies": anomalies }))
                .with_metadata(metadata),
            start,
        )
    }
}
