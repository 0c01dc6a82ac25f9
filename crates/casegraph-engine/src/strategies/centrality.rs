use super::{failed, finished};
use async_trait::async_trait;
use casegraph_core::params::{bool_param, string_list_param, usize_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, Entity, GraphBackend,
    JsonMap, LlmProvider, Relationship,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

type AdjacencySets<'a> = HashMap<&'a str, HashSet<&'a str>>;

/// Scores entity centrality: degree, Brandes betweenness, and closeness,
/// with optional normalization and composite key-player ranking.
#[derive(Default)]
pub struct CentralityAnalysisStrategy;

impl CentralityAnalysisStrategy {
    pub fn new() -> Self {
        Self
    }

    fn build_adjacency<'a>(
        relationships: &'a [Relationship],
        directed: bool,
    ) -> AdjacencySets<'a> {
        let mut adjacency: AdjacencySets<'a> = HashMap::new();
        for rel in relationships {
            adjacency
                .entry(rel.source_id.as_str())
                .or_default()
                .insert(rel.target_id.as_str());
            if !directed {
                adjacency
                    .entry(rel.target_id.as_str())
                    .or_default()
                    .insert(rel.source_id.as_str());
            }
        }
        adjacency
    }

    fn degree_centrality(
        entities: &[Entity],
        relationships: &[Relationship],
        directed: bool,
        normalize: bool,
    ) -> HashMap<String, f64> {
        let mut degree: HashMap<&str, f64> =
            entities.iter().map(|e| (e.id.as_str(), 0.0)).collect();

        for rel in relationships {
            // Directed mode sums in-degree and out-degree.
            if let Some(d) = degree.get_mut(rel.source_id.as_str()) {
                *d += 1.0;
            }
            if let Some(d) = degree.get_mut(rel.target_id.as_str()) {
                *d += 1.0;
            }
        }

        let n = entities.len();
        let scale = if normalize && n > 1 {
            let max_possible = if directed {
                2.0 * (n as f64 - 1.0)
            } else {
                n as f64 - 1.0
            };
            1.0 / max_possible
        } else {
            1.0
        };

        degree
            .into_iter()
            .map(|(id, d)| (id.to_string(), d * scale))
            .collect()
    }

    /// Brandes betweenness: per-source BFS builds shortest-path counts and
    /// predecessor lists, then dependencies accumulate off the pop stack.
    fn betweenness_centrality(
        entities: &[Entity],
        relationships: &[Relationship],
        directed: bool,
        normalize: bool,
    ) -> HashMap<String, f64> {
        let adjacency = Self::build_adjacency(relationships, directed);
        let mut entity_ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        entity_ids.sort();

        let mut betweenness: HashMap<&str, f64> =
            entity_ids.iter().map(|id| (*id, 0.0)).collect();

        for source in &entity_ids {
            let mut stack: Vec<&str> = Vec::new();
            let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
            let mut sigma: HashMap<&str, f64> = HashMap::from([(*source, 1.0)]);
            let mut dist: HashMap<&str, usize> = HashMap::from([(*source, 0)]);
            let mut queue = VecDeque::from([*source]);

            while let Some(v) = queue.pop_front() {
                stack.push(v);
                let Some(neighbors) = adjacency.get(v) else {
                    continue;
                };
                let mut sorted: Vec<&str> = neighbors.iter().copied().collect();
                sorted.sort();
                for w in sorted {
                    if !dist.contains_key(w) {
                        dist.insert(w, dist[v] + 1);
                        queue.push_back(w);
                    }
                    if dist[w] == dist[v] + 1 {
                        let sigma_v = sigma.get(v).copied().unwrap_or(0.0);
                        *sigma.entry(w).or_insert(0.0) += sigma_v;
                        predecessors.entry(w).or_default().push(v);
                    }
                }
            }

            let mut delta: HashMap<&str, f64> = HashMap::new();
            while let Some(w) = stack.pop() {
                let delta_w = delta.get(w).copied().unwrap_or(0.0);
                let sigma_w = sigma.get(w).copied().unwrap_or(1.0);
                if let Some(preds) = predecessors.get(w) {
                    for v in preds {
                        let sigma_v = sigma.get(v).copied().unwrap_or(0.0);
                        *delta.entry(v).or_insert(0.0) += (sigma_v / sigma_w) * (1.0 + delta_w);
                    }
                }
                if w != *source {
                    if let Some(b) = betweenness.get_mut(w) {
                        *b += delta_w;
                    }
                }
            }
        }

        let n = entities.len();
        let norm = if normalize && n > 2 {
            if directed {
                1.0 / ((n as f64 - 1.0) * (n as f64 - 2.0))
            } else {
                0.5 / ((n as f64 - 1.0) * (n as f64 - 2.0))
            }
        } else {
            1.0
        };

        betweenness
            .into_iter()
            .map(|(id, b)| (id.to_string(), b * norm))
            .collect()
    }

    /// Closeness = reachable / sum-of-distances, optionally scaled by the
    /// reachable fraction.
    fn closeness_centrality(
        entities: &[Entity],
        relationships: &[Relationship],
        directed: bool,
        normalize: bool,
    ) -> HashMap<String, f64> {
        let adjacency = Self::build_adjacency(relationships, directed);
        let entity_ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let n = entity_ids.len();

        let mut closeness = HashMap::new();
        for &source in &entity_ids {
            let distances = Self::bfs_distances(source, &adjacency, &entity_ids);
            let total_distance: usize = distances.values().sum();
            let reachable = distances.values().filter(|d| **d > 0).count();

            let score = if total_distance > 0 {
                let mut score = reachable as f64 / total_distance as f64;
                if normalize && n > 1 {
                    score *= reachable as f64 / (n as f64 - 1.0);
                }
                score
            } else {
                0.0
            };
            closeness.insert(source.to_string(), score);
        }
        closeness
    }

    /// BFS distances from `source`; unreachable nodes count as the maximum
    /// possible distance.
    fn bfs_distances<'a>(
        source: &'a str,
        adjacency: &AdjacencySets<'a>,
        all_nodes: &[&'a str],
    ) -> HashMap<&'a str, usize> {
        let mut distances: HashMap<&str, usize> = HashMap::from([(source, 0)]);
        let mut queue = VecDeque::from([source]);

        while let Some(node) = queue.pop_front() {
            if let Some(neighbors) = adjacency.get(node) {
                for &neighbor in neighbors {
                    if !distances.contains_key(neighbor) {
                        distances.insert(neighbor, distances[node] + 1);
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        for &node in all_nodes {
            distances.entry(node).or_insert(all_nodes.len());
        }
        distances
    }

    /// Composite score is the mean of the requested metrics; top-k ranked
    /// descending with per-metric breakdown.
    fn identify_key_players(
        centrality_scores: &[Value],
        metrics: &[String],
        top_k: usize,
    ) -> Vec<Value> {
        if centrality_scores.is_empty() || metrics.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &Value)> = centrality_scores
            .iter()
            .map(|entry| {
                let composite: f64 = metrics
                    .iter()
                    .filter_map(|metric| entry.get(metric).and_then(Value::as_f64))
                    .sum::<f64>()
                    / metrics.len() as f64;
                (composite, entry)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(rank, (composite, entry))| {
                let mut key_player = json!({
                    "rank": rank + 1,
                    "entity_id": entry["entity_id"],
                    "entity_name": entry["entity_name"],
                    "entity_type": entry["entity_type"],
                    "composite_score": composite,
                });
                if let Some(object) = key_player.as_object_mut() {
                    for metric in metrics {
                        if let Some(score) = entry.get(metric) {
                            object.insert(format!("{metric}_score"), score.clone());
                        }
                    }
                }
                key_player
            })
            .collect()
    }
}

#[async_trait]
impl AnalysisStrategy for CentralityAnalysisStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::CentralityAnalysis
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let metrics = string_list_param(&request.parameters, "metrics")
            .unwrap_or_else(|| vec!["degree".to_string()]);
        let normalize = bool_param(&request.parameters, "normalize", false);
        let directed = bool_param(&request.parameters, "directed", true);
        let identify_key_players =
            bool_param(&request.parameters, "identify_key_players", false);
        let top_k = usize_param(&request.parameters, "top_k", 10);

        let entities = match graph.get_entities(None, None).await {
            Ok(entities) => entities,
            Err(e) => {
                return failed(request, vec![format!("Failed to load entities: {e}")], start)
            }
        };
        let relationships = match graph.get_relationships(None, None, None).await {
            Ok(relationships) => relationships,
            Err(e) => {
                return failed(
                    request,
                    vec![format!("Failed to load relationships: {e}")],
                    start,
                )
            }
        };

        if entities.is_empty() {
            return failed(request, vec!["No entities found in graph".to_string()], start);
        }

        let mut scores_by_entity: HashMap<String, JsonMap> = HashMap::new();
        let mut record = |scores: HashMap<String, f64>, metric: &str| {
            for (entity_id, score) in scores {
                scores_by_entity
                    .entry(entity_id)
                    .or_default()
                    .insert(metric.to_string(), json!(score));
            }
        };

        if metrics.iter().any(|m| m == "degree") {
            record(
                Self::degree_centrality(&entities, &relationships, directed, normalize),
                "degree",
            );
        }
        if metrics.iter().any(|m| m == "betweenness") {
            record(
                Self::betweenness_centrality(&entities, &relationships, directed, normalize),
                "betweenness",
            );
        }
        if metrics.iter().any(|m| m == "closeness") {
            record(
                Self::closeness_centrality(&entities, &relationships, directed, normalize),
                "closeness",
            );
        }

        let entity_lookup: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut centrality_scores: Vec<Value> = scores_by_entity
            .into_iter()
            .filter_map(|(entity_id, scores)| {
                entity_lookup.get(entity_id.as_str()).map(|entity| {
                    let mut entry = json!({
                        "entity_id": entity.id,
                        "entity_name": entity.name,
                        "entity_type": entity.entity_type,
                    });
                    if let Some(object) = entry.as_object_mut() {
                        object.extend(scores);
                    }
                    entry
                })
            })
            .collect();

        if let Some(first_metric) = metrics.first() {
            centrality_scores.sort_by(|a, b| {
                let score_a = a.get(first_metric).and_then(Value::as_f64).unwrap_or(0.0);
                let score_b = b.get(first_metric).and_then(Value::as_f64).unwrap_or(0.0);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a["entity_id"].as_str().cmp(&b["entity_id"].as_str()))
            });
        }

        let mut data = JsonMap::new();
        if identify_key_players {
            data.insert(
                "key_players".into(),
                json!(Self::identify_key_players(&centrality_scores, &metrics, top_k)),
            );
        }
        data.insert("centrality_scores".into(), json!(centrality_scores));

        let mut metadata = JsonMap::new();
        metadata.insert("metrics".into(), json!(metrics));
        metadata.insert("num_entities".into(), json!(entities.len()));
        metadata.insert("num_relationships".into(), json!(relationships.len()));
        metadata.insert("normalized".into(), json!(normalize));
        metadata.insert("directed".into(), json!(directed));

        finished(
            AnalysisResult::success(request.clone(), Value::Object(data)).with_metadata(metadata),
            start,
        )
    }
}
