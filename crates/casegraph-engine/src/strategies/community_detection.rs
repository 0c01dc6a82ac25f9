use super::finished;
use async_trait::async_trait;
use casegraph_core::params::{bool_param, str_param, usize_param};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, Entity, GraphBackend,
    JsonMap, LlmProvider, Relationship,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

const MAX_LOUVAIN_SWEEPS: usize = 100;

type Adjacency = HashMap<String, HashMap<String, f64>>;

/// Detects communities in the entity network.
///
/// Supported algorithms: simplified Louvain (default), hierarchical Louvain
/// with supernode contraction, and connected components as the fallback for
/// unknown algorithm names.
#[derive(Default)]
pub struct CommunityDetectionStrategy;

impl CommunityDetectionStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Undirected adjacency; every entity appears even when isolated.
    fn build_adjacency(
        entities: &[Entity],
        relationships: &[Relationship],
        use_weights: bool,
        weight_property: &str,
    ) -> Adjacency {
        let mut adjacency: Adjacency = HashMap::new();

        for rel in relationships {
            let weight = if use_weights {
                rel.properties
                    .get(weight_property)
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0)
            } else {
                1.0
            };
            adjacency
                .entry(rel.source_id.clone())
                .or_default()
                .insert(rel.target_id.clone(), weight);
            adjacency
                .entry(rel.target_id.clone())
                .or_default()
                .insert(rel.source_id.clone(), weight);
        }

        for entity in entities {
            adjacency.entry(entity.id.clone()).or_default();
        }

        adjacency
    }

    fn sorted_nodes(adjacency: &Adjacency) -> Vec<String> {
        let mut nodes: Vec<String> = adjacency.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    fn total_weight(adjacency: &Adjacency) -> f64 {
        adjacency
            .values()
            .map(|weights| weights.values().sum::<f64>())
            .sum::<f64>()
            / 2.0
    }

    fn degree(adjacency: &Adjacency, node: &str) -> f64 {
        adjacency
            .get(node)
            .map(|weights| weights.values().sum())
            .unwrap_or(0.0)
    }

    /// Modularity gain of moving `node` into `target_community`. Zero when
    /// the graph has no edge weight, so all moves are refused.
    fn modularity_gain(
        adjacency: &Adjacency,
        node_community: &HashMap<String, String>,
        node: &str,
        target_community: &str,
        total_weight: f64,
    ) -> f64 {
        if total_weight == 0.0 {
            return 0.0;
        }

        let internal_weight: f64 = adjacency
            .get(node)
            .map(|neighbors| {
                neighbors
                    .iter()
                    .filter(|(neighbor, _)| {
                        node_community.get(*neighbor).map(String::as_str)
                            == Some(target_community)
                    })
                    .map(|(_, weight)| weight)
                    .sum()
            })
            .unwrap_or(0.0);

        let node_degree = Self::degree(adjacency, node);
        let community_degree: f64 = node_community
            .iter()
            .filter(|(_, community)| community.as_str() == target_community)
            .map(|(member, _)| Self::degree(adjacency, member))
            .sum();

        internal_weight / total_weight
            - node_degree * community_degree / (2.0 * total_weight * total_weight)
    }

    /// Simplified Louvain: local moving only, sequential renumbering.
    fn louvain(adjacency: &Adjacency) -> Vec<(String, Vec<String>)> {
        let nodes = Self::sorted_nodes(adjacency);
        let mut node_community: HashMap<String, String> =
            nodes.iter().map(|n| (n.clone(), n.clone())).collect();
        let total_weight = Self::total_weight(adjacency);

        let mut improved = true;
        let mut sweeps = 0;
        while improved && sweeps < MAX_LOUVAIN_SWEEPS {
            improved = false;
            sweeps += 1;

            for node in &nodes {
                let current = node_community[node].clone();

                let mut neighbor_communities: Vec<String> = adjacency
                    .get(node)
                    .map(|neighbors| {
                        neighbors
                            .keys()
                            .filter_map(|neighbor| node_community.get(neighbor).cloned())
                            .collect::<HashSet<_>>()
                            .into_iter()
                            .collect()
                    })
                    .unwrap_or_default();
                neighbor_communities.sort();

                let mut best_community = current.clone();
                let mut best_gain = 0.0;
                for community in neighbor_communities {
                    if community == current {
                        continue;
                    }
                    let gain = Self::modularity_gain(
                        adjacency,
                        &node_community,
                        node,
                        &community,
                        total_weight,
                    );
                    if gain > best_gain {
                        best_gain = gain;
                        best_community = community;
                    }
                }

                if best_community != current {
                    node_community.insert(node.clone(), best_community);
                    improved = true;
                }
            }
        }

        Self::renumber(&node_community)
    }

    fn renumber(node_community: &HashMap<String, String>) -> Vec<(String, Vec<String>)> {
        let mut groups: HashMap<&str, Vec<String>> = HashMap::new();
        for (node, community) in node_community {
            groups.entry(community.as_str()).or_default().push(node.clone());
        }

        let mut labels: Vec<&str> = groups.keys().copied().collect();
        labels.sort();

        labels
            .into_iter()
            .enumerate()
            .map(|(i, label)| {
                let mut members = groups.remove(label).unwrap_or_default();
                members.sort();
                (format!("community_{i}"), members)
            })
            .collect()
    }

    fn connected_components(adjacency: &Adjacency) -> Vec<(String, Vec<String>)> {
        let nodes = Self::sorted_nodes(adjacency);
        let mut visited = HashSet::new();
        let mut components = Vec::new();

        for node in &nodes {
            if visited.contains(node) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([node.clone()]);
            while let Some(current) = queue.pop_front() {
                if !visited.insert(current.clone()) {
                    continue;
                }
                component.push(current.clone());
                if let Some(neighbors) = adjacency.get(&current) {
                    for neighbor in neighbors.keys() {
                        if !visited.contains(neighbor) {
                            queue.push_back(neighbor.clone());
                        }
                    }
                }
            }
            component.sort();
            components.push((format!("community_{}", components.len()), component));
        }

        components
    }

    /// Louvain per level, contracting communities to supernodes between
    /// levels, until `max_levels` or a single community remains.
    fn hierarchical(adjacency: &Adjacency, max_levels: usize) -> Value {
        let mut levels = Vec::new();
        let mut current = adjacency.clone();

        for level in 0..max_levels {
            let communities = Self::louvain(&current);
            if communities.len() == 1 {
                break;
            }

            levels.push(json!({
                "level": level,
                "communities": communities
                    .iter()
                    .map(|(id, members)| json!({
                        "id": id,
                        "members": members,
                        "size": members.len(),
                    }))
                    .collect::<Vec<_>>(),
            }));

            if level + 1 < max_levels {
                current = Self::contract(&communities, &current);
                if current.len() <= 1 {
                    break;
                }
            }
        }

        json!({
            "hierarchy": {
                "levels": levels,
                "num_levels": levels.len(),
            }
        })
    }

    /// Supergraph where communities become nodes; edge weights between
    /// supernodes sum the inter-community edges.
    fn contract(communities: &[(String, Vec<String>)], adjacency: &Adjacency) -> Adjacency {
        let mut node_to_community: HashMap<&str, &str> = HashMap::new();
        for (community, members) in communities {
            for member in members {
                node_to_community.insert(member.as_str(), community.as_str());
            }
        }

        let mut contracted: Adjacency = HashMap::new();
        for (node, neighbors) in adjacency {
            let Some(node_comm) = node_to_community.get(node.as_str()) else {
                continue;
            };
            for (neighbor, weight) in neighbors {
                let Some(neighbor_comm) = node_to_community.get(neighbor.as_str()) else {
                    continue;
                };
                if node_comm != neighbor_comm {
                    *contracted
                        .entry(node_comm.to_string())
                        .or_default()
                        .entry(neighbor_comm.to_string())
                        .or_insert(0.0) += weight;
                }
            }
        }

        contracted
    }

    /// internal_edges / (n(n-1)/2); singleton communities count as dense.
    fn density(members: &[String], adjacency: &Adjacency) -> f64 {
        if members.len() <= 1 {
            return 1.0;
        }
        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

        let mut internal_edges = 0usize;
        for member in members {
            if let Some(neighbors) = adjacency.get(member) {
                internal_edges += neighbors
                    .keys()
                    .filter(|neighbor| member_set.contains(neighbor.as_str()))
                    .count();
            }
        }
        internal_edges /= 2;

        let max_edges = members.len() * (members.len() - 1) / 2;
        internal_edges as f64 / max_edges as f64
    }

    fn modularity(communities: &[(String, Vec<String>)], adjacency: &Adjacency) -> f64 {
        let total_weight = Self::total_weight(adjacency);
        if total_weight == 0.0 {
            return 0.0;
        }

        let mut node_community: HashMap<&str, &str> = HashMap::new();
        for (community, members) in communities {
            for member in members {
                node_community.insert(member.as_str(), community.as_str());
            }
        }

        let mut modularity = 0.0;
        for (node, neighbors) in adjacency {
            for (neighbor, weight) in neighbors {
                if node_community.get(node.as_str()) == node_community.get(neighbor.as_str()) {
                    let expected = Self::degree(adjacency, node) * Self::degree(adjacency, neighbor)
                        / (2.0 * total_weight);
                    modularity += (weight - expected) / (2.0 * total_weight);
                }
            }
        }
        modularity
    }
}

#[async_trait]
impl AnalysisStrategy for CommunityDetectionStrategy {
    fn can_handle(&self, analysis_type: AnalysisType) -> bool {
        analysis_type == AnalysisType::CommunityDetection
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        _llm: &dyn LlmProvider,
        graph: &dyn GraphBackend,
    ) -> AnalysisResult {
        let start = Instant::now();

        let algorithm = str_param(&request.parameters, "algorithm").unwrap_or("louvain");
        let use_weights = bool_param(&request.parameters, "use_weights", false);
        let weight_property =
            str_param(&request.parameters, "weight_property").unwrap_or("weight");
        let max_levels = usize_param(&request.parameters, "max_levels", 3);

        let entities = match graph.get_entities(None, None).await {
            Ok(entities) => entities,
            Err(e) => {
                return super::failed(
                    request,
                    vec![format!("Failed to load entities: {e}")],
                    start,
                )
            }
        };
        let relationships = match graph.get_relationships(None, None, None).await {
            Ok(relationships) => relationships,
            Err(e) => {
                return super::failed(
                    request,
                    vec![format!("Failed to load relationships: {e}")],
                    start,
                )
            }
        };

        let adjacency =
            Self::build_adjacency(&entities, &relationships, use_weights, weight_property);

        if algorithm == "hierarchical" {
            let data = Self::hierarchical(&adjacency, max_levels);
            let mut metadata = JsonMap::new();
            metadata.insert("algorithm".into(), json!(algorithm));
            metadata.insert("num_entities".into(), json!(entities.len()));
            metadata.insert("num_relationships".into(), json!(relationships.len()));
            return finished(
                AnalysisResult::success(request.clone(), data).with_metadata(metadata),
                start,
            );
        }

        let communities = match algorithm {
            "louvain" => Self::louvain(&adjacency),
            _ => Self::connected_components(&adjacency),
        };

        let entity_lookup: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut community_data: Vec<Value> = communities
            .iter()
            .map(|(id, members)| {
                let member_records: Vec<Value> = members
                    .iter()
                    .filter_map(|member| entity_lookup.get(member.as_str()))
                    .map(|entity| {
                        json!({
                            "id": entity.id,
                            "name": entity.name,
                            "type": entity.entity_type,
                        })
                    })
                    .collect();
                json!({
                    "id": id,
                    "members": member_records,
                    "size": member_records.len(),
                    "density": Self::density(members, &adjacency),
                })
            })
            .collect();

        community_data.sort_by(|a, b| {
            let size_a = a["size"].as_u64().unwrap_or(0);
            let size_b = b["size"].as_u64().unwrap_or(0);
            size_b
                .cmp(&size_a)
                .then_with(|| a["id"].as_str().cmp(&b["id"].as_str()))
        });

        let mut metadata = JsonMap::new();
        metadata.insert("algorithm".into(), json!(algorithm));
        metadata.insert("num_communities".into(), json!(community_data.len()));
        metadata.insert("num_entities".into(), json!(entities.len()));
        metadata.insert("num_relationships".into(), json!(relationships.len()));
        metadata.insert(
            "modularity".into(),
            json!(Self::modularity(&communities, &adjacency)),
        );

        finished(
            AnalysisResult::success(request.clone(), json!({ "communities": community_data }))
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

    fn request_with(algorithm: Option<&str>) -> AnalysisRequest {
        let mut params = JsonMap::new();
        if let Some(algorithm) = algorithm {
            params.insert("algorithm".into(), json!(algorithm));
        }
        AnalysisRequest::new(AnalysisType::CommunityDetection).with_parameters(params)
    }

    async fn hub_and_spoke() -> MemoryGraph {
        let graph = MemoryGraph::new();
        for id in ["hub", "n1", "n2", "n3", "n4"] {
            graph
                .add_entity(Entity::new(id, id.to_uppercase(), "person"))
                .await
                .unwrap();
        }
        for (i, spoke) in ["n1", "n2", "n3", "n4"].iter().enumerate() {
            graph
                .add_relationship(Relationship::new(
                    format!("r{i}"),
                    "hub",
                    *spoke,
                    "knows",
                ))
                .await
                .unwrap();
        }
        graph
            .add_relationship(Relationship::new("r_extra", "n1", "n2", "knows"))
            .await
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn louvain_groups_hub_and_spoke_into_one_community() {
        let graph = hub_and_spoke().await;
        let llm = ScriptedLlm::new(vec![]);

        let result = CommunityDetectionStrategy::new()
            .analyze(&request_with(None), &llm, &graph)
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        let communities = data["communities"].as_array().unwrap();
        assert!(!communities.is_empty());
        assert_eq!(communities[0]["size"], json!(5));
        assert!(communities[0]["density"].as_f64().unwrap() >= 0.5);
        assert!(result.metadata["modularity"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn empty_graph_yields_no_communities_and_zero_modularity() {
        let graph = MemoryGraph::new();
        let llm = ScriptedLlm::new(vec![]);

        let result = CommunityDetectionStrategy::new()
            .analyze(&request_with(None), &llm, &graph)
            .await;

        assert!(result.success);
        assert_eq!(result.data.unwrap()["communities"], json!([]));
        assert_eq!(result.metadata["modularity"], json!(0.0));
    }

    #[tokio::test]
    async fn unknown_algorithm_falls_back_to_connected_components() {
        let graph = MemoryGraph::new();
        for id in ["a", "b", "c", "d"] {
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
            .add_relationship(Relationship::new("r2", "c", "d", "knows"))
            .await
            .unwrap();
        let llm = ScriptedLlm::new(vec![]);

        let result = CommunityDetectionStrategy::new()
            .analyze(&request_with(Some("voronoi")), &llm, &graph)
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["communities"].as_array().unwrap().len(), 2);
        assert_eq!(result.metadata["algorithm"], json!("voronoi"));
    }

    #[tokio::test]
    async fn hierarchical_returns_level_structure() {
        let graph = hub_and_spoke().await;
        let llm = ScriptedLlm::new(vec![]);

        let mut params = JsonMap::new();
        params.insert("algorithm".into(), json!("hierarchical"));
        params.insert("max_levels".into(), json!(2));
        let request =
            AnalysisRequest::new(AnalysisType::CommunityDetection).with_parameters(params);

        let result = CommunityDetectionStrategy::new()
            .analyze(&request, &llm, &graph)
            .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert!(data["hierarchy"]["num_levels"].is_u64());
    }

    #[tokio::test]
    async fn weighted_edges_respect_weight_property() {
        let graph = MemoryGraph::new();
        for id in ["a", "b"] {
            graph
                .add_entity(Entity::new(id, id.to_uppercase(), "person"))
                .await
                .unwrap();
        }
        let mut props = JsonMap::new();
        props.insert("weight".into(), json!(3.5));
        graph
            .add_relationship(
                Relationship::new("r1", "a", "b", "knows").with_properties(props),
            )
            .await
            .unwrap();

        let entities = graph.get_entities(None, None).await.unwrap();
        let relationships = graph.get_relationships(None, None, None).await.unwrap();
        let adjacency = CommunityDetectionStrategy::build_adjacency(
            &entities,
            &relationships,
            true,
            "weight",
        );
        assert_eq!(adjacency["a"]["b"], 3.5);

        let unweighted = CommunityDetectionStrategy::build_adjacency(
            &entities,
            &relationships,
            false,
            "weight",
        );
        assert_eq!(unweighted["a"]["b"], 1.0);
    }
}
