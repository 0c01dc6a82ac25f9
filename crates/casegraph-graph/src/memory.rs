use async_trait::async_trait;
use casegraph_core::{
    Direction, Entity, GraphBackend, JsonMap, Relationship, Result, Subgraph,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

#[derive(Default)]
struct GraphInner {
    entities: HashMap<String, Entity>,
    /// Insertion order, for deterministic listing.
    entity_order: Vec<String>,
    relationships: HashMap<String, Relationship>,
    rel_order: Vec<String>,
    /// Entity id -> relationship ids leaving / entering it.
    outgoing: HashMap<String, Vec<String>>,
    incoming: HashMap<String, Vec<String>>,
}

impl GraphInner {
    fn out_neighbors(&self, entity_id: &str) -> Vec<&Relationship> {
        self.outgoing
            .get(entity_id)
            .map(|ids| ids.iter().filter_map(|id| self.relationships.get(id)).collect())
            .unwrap_or_default()
    }

    fn in_neighbors(&self, entity_id: &str) -> Vec<&Relationship> {
        self.incoming
            .get(entity_id)
            .map(|ids| ids.iter().filter_map(|id| self.relationships.get(id)).collect())
            .unwrap_or_default()
    }

    fn matches(&self, entity: &Entity, criteria: &JsonMap) -> bool {
        criteria.iter().all(|(key, expected)| {
            if let Some(prop_key) = key.strip_prefix("properties.") {
                return entity.properties.get(prop_key) == Some(expected);
            }
            match key.as_str() {
                "id" => expected.as_str() == Some(entity.id.as_str()),
                "name" => expected.as_str() == Some(entity.name.as_str()),
                "type" => expected.as_str() == Some(entity.entity_type.as_str()),
                "source" => match (&entity.source, expected.as_str()) {
                    (Some(source), Some(wanted)) => source == wanted,
                    (None, _) => expected.is_null(),
                    _ => false,
                },
                "confidence" => expected.as_f64() == Some(entity.confidence),
                _ => false,
            }
        })
    }

    fn remove_relationship(&mut self, rel_id: &str) {
        if let Some(rel) = self.relationships.remove(rel_id) {
            self.rel_order.retain(|id| id != rel_id);
            if let Some(ids) = self.outgoing.get_mut(&rel.source_id) {
                ids.retain(|id| id != rel_id);
            }
            if let Some(ids) = self.incoming.get_mut(&rel.target_id) {
                ids.retain(|id| id != rel_id);
            }
        }
    }
}

/// In-memory directed property graph.
///
/// The single `RwLock` serializes mutations; every trait call is one atomic
/// unit and no lock is held across an await point.
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.inner.read().relationships.len()
    }

    pub fn clear(&self) {
        *self.inner.write() = GraphInner::default();
    }
}

#[async_trait]
impl GraphBackend for MemoryGraph {
    async fn add_entity(&self, entity: Entity) -> Result<bool> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&entity.id) {
            inner.entity_order.push(entity.id.clone());
        }
        inner.entities.insert(entity.id.clone(), entity);
        Ok(true)
    }

    async fn add_relationship(&self, relationship: Relationship) -> Result<bool> {
        let mut inner = self.inner.write();
        if !inner.entities.contains_key(&relationship.source_id) {
            warn!(source_id = %relationship.source_id, "source entity not found");
            return Ok(false);
        }
        if !inner.entities.contains_key(&relationship.target_id) {
            warn!(target_id = %relationship.target_id, "target entity not found");
            return Ok(false);
        }

        let rel_id = relationship.id.clone();
        if inner.relationships.contains_key(&rel_id) {
            // Same id, refreshed record; indexes already point at it.
            inner.remove_relationship(&rel_id);
        }
        inner.rel_order.push(rel_id.clone());
        inner
            .outgoing
            .entry(relationship.source_id.clone())
            .or_default()
            .push(rel_id.clone());
        inner
            .incoming
            .entry(relationship.target_id.clone())
            .or_default()
            .push(rel_id.clone());
        inner.relationships.insert(rel_id, relationship);
        Ok(true)
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self.inner.read().entities.get(entity_id).cloned())
    }

    async fn get_entities(
        &self,
        filters: Option<&JsonMap>,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        let mut results = Vec::new();
        for id in &inner.entity_order {
            if let Some(entity) = inner.entities.get(id) {
                if filters.map_or(true, |criteria| inner.matches(entity, criteria)) {
                    results.push(entity.clone());
                    if limit.is_some_and(|limit| results.len() >= limit) {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

    async fn get_relationships(
        &self,
        entity_id: Option<&str>,
        rel_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>> {
        let inner = self.inner.read();
        let candidate_ids: Vec<String> = match entity_id {
            Some(entity_id) => {
                let mut seen = HashSet::new();
                inner
                    .outgoing
                    .get(entity_id)
                    .into_iter()
                    .chain(inner.incoming.get(entity_id))
                    .flatten()
                    .filter(|id| seen.insert((*id).clone()))
                    .cloned()
                    .collect()
            }
            None => inner.rel_order.clone(),
        };

        let mut results = Vec::new();
        for id in candidate_ids {
            if let Some(rel) = inner.relationships.get(&id) {
                if rel_type.map_or(true, |wanted| rel.rel_type == wanted) {
                    results.push(rel.clone());
                    if limit.is_some_and(|limit| results.len() >= limit) {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

    async fn search_entities(&self, criteria: &JsonMap) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        let mut results = Vec::new();
        for id in &inner.entity_order {
            if let Some(entity) = inner.entities.get(id) {
                if inner.matches(entity, criteria) {
                    results.push(entity.clone());
                }
            }
        }
        Ok(results)
    }

    async fn get_neighbors(
        &self,
        entity_id: &str,
        rel_type: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        if !inner.entities.contains_key(entity_id) {
            return Ok(Vec::new());
        }

        let mut neighbor_ids = Vec::new();
        let mut seen = HashSet::new();

        if matches!(direction, Direction::Out | Direction::Both) {
            for rel in inner.out_neighbors(entity_id) {
                if rel_type.map_or(true, |wanted| rel.rel_type == wanted)
                    && seen.insert(rel.target_id.clone())
                {
                    neighbor_ids.push(rel.target_id.clone());
                }
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            for rel in inner.in_neighbors(entity_id) {
                if rel_type.map_or(true, |wanted| rel.rel_type == wanted)
                    && seen.insert(rel.source_id.clone())
                {
                    neighbor_ids.push(rel.source_id.clone());
                }
            }
        }

        Ok(neighbor_ids
            .into_iter()
            .filter_map(|id| inner.entities.get(&id).cloned())
            .collect())
    }

    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_length: Option<usize>,
    ) -> Result<Option<Vec<Entity>>> {
        let inner = self.inner.read();
        if !inner.entities.contains_key(from_id) || !inner.entities.contains_key(to_id) {
            return Ok(None);
        }
        if from_id == to_id {
            return Ok(inner.entities.get(from_id).cloned().map(|e| vec![e]));
        }

        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        let mut parent: HashMap<String, String> = HashMap::new();

        queue.push_back((from_id.to_string(), 0usize));
        visited.insert(from_id.to_string());

        while let Some((current, depth)) = queue.pop_front() {
            if max_length.is_some_and(|max| depth >= max) {
                continue;
            }
            for rel in inner.out_neighbors(&current) {
                let next = &rel.target_id;
                if visited.contains(next) {
                    continue;
                }
                visited.insert(next.clone());
                parent.insert(next.clone(), current.clone());

                if next == to_id {
                    let mut path_ids = vec![to_id.to_string()];
                    let mut node = to_id.to_string();
                    while let Some(prev) = parent.get(&node) {
                        path_ids.push(prev.clone());
                        node = prev.clone();
                    }
                    path_ids.reverse();
                    let path = path_ids
                        .iter()
                        .filter_map(|id| inner.entities.get(id).cloned())
                        .collect();
                    return Ok(Some(path));
                }
                queue.push_back((next.clone(), depth + 1));
            }
        }

        Ok(None)
    }

    async fn delete_entity(&self, entity_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.entities.remove(entity_id).is_none() {
            return Ok(false);
        }
        inner.entity_order.retain(|id| id != entity_id);

        let incident: Vec<String> = inner
            .outgoing
            .remove(entity_id)
            .into_iter()
            .chain(inner.incoming.remove(entity_id))
            .flatten()
            .collect();
        for rel_id in incident {
            inner.remove_relationship(&rel_id);
        }
        Ok(true)
    }

    async fn get_subgraph(&self, entity_ids: &[String], max_depth: usize) -> Result<Subgraph> {
        let inner = self.inner.read();
        let mut result = Subgraph::default();
        let mut visited_entities = HashSet::new();
        let mut visited_edges: HashSet<String> = HashSet::new();

        let mut queue: VecDeque<(String, usize)> = entity_ids
            .iter()
            .filter(|id| inner.entities.contains_key(*id))
            .map(|id| (id.clone(), 0usize))
            .collect();

        while let Some((current, depth)) = queue.pop_front() {
            if !visited_entities.insert(current.clone()) {
                continue;
            }
            if let Some(entity) = inner.entities.get(&current) {
                result.entities.push(entity.clone());
            }

            if depth >= max_depth {
                continue;
            }
            for rel in inner
                .out_neighbors(&current)
                .into_iter()
                .chain(inner.in_neighbors(&current))
            {
                if visited_edges.insert(rel.id.clone()) {
                    result.relationships.push(rel.clone());
                }
                let other = if rel.source_id == current {
                    rel.target_id.clone()
                } else {
                    rel.source_id.clone()
                };
                if !visited_entities.contains(&other) {
                    queue.push_back((other, depth + 1));
                }
            }
        }

        Ok(result)
    }

    async fn execute_query(&self, _query: &str) -> Result<Vec<Value>> {
        warn!("query execution not supported by the in-memory backend");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seed(graph: &MemoryGraph) {
        for (id, name, kind) in [
            ("person_alice", "Alice", "person"),
            ("person_bob", "Bob", "person"),
            ("org_acme", "Acme", "organization"),
        ] {
            graph.add_entity(Entity::new(id, name, kind)).await.unwrap();
        }
        graph
            .add_relationship(Relationship::new(
                "r1",
                "person_alice",
                "person_bob",
                "manages",
            ))
            .await
            .unwrap();
        graph
            .add_relationship(Relationship::new(
                "r2",
                "person_bob",
                "org_acme",
                "works_for",
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_relationship_with_missing_endpoint() {
        let graph = MemoryGraph::new();
        graph
            .add_entity(Entity::new("person_alice", "Alice", "person"))
            .await
            .unwrap();
        let stored = graph
            .add_relationship(Relationship::new("r1", "person_alice", "ghost", "knows"))
            .await
            .unwrap();
        assert!(!stored);
        assert_eq!(graph.relationship_count(), 0);
    }

    #[tokio::test]
    async fn neighbors_respect_direction_and_type() {
        let graph = MemoryGraph::new();
        seed(&graph).await;

        let out = graph
            .get_neighbors("person_bob", None, Direction::Out)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "org_acme");

        let both = graph
            .get_neighbors("person_bob", None, Direction::Both)
            .await
            .unwrap();
        assert_eq!(both.len(), 2);

        let managed = graph
            .get_neighbors("person_bob", Some("manages"), Direction::In)
            .await
            .unwrap();
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].id, "person_alice");
    }

    #[tokio::test]
    async fn find_path_follows_outgoing_edges() {
        let graph = MemoryGraph::new();
        seed(&graph).await;

        let path = graph
            .find_path("person_alice", "org_acme", None)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<&str> = path.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["person_alice", "person_bob", "org_acme"]);

        // Two edges are required; a one-edge bound finds nothing.
        let bounded = graph
            .find_path("person_alice", "org_acme", Some(1))
            .await
            .unwrap();
        assert!(bounded.is_none());
    }

    #[tokio::test]
    async fn find_path_to_self_is_single_entity() {
        let graph = MemoryGraph::new();
        seed(&graph).await;
        let path = graph
            .find_path("person_alice", "person_alice", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].id, "person_alice");
    }

    #[tokio::test]
    async fn search_supports_dotted_property_keys() {
        let graph = MemoryGraph::new();
        let mut properties = JsonMap::new();
        properties.insert("role".into(), json!("councillor"));
        graph
            .add_entity(
                Entity::new("person_carol", "Carol", "person").with_properties(properties),
            )
            .await
            .unwrap();
        seed(&graph).await;

        let mut criteria = JsonMap::new();
        criteria.insert("properties.role".into(), json!("councillor"));
        let found = graph.search_entities(&criteria).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "person_carol");

        let mut by_name = JsonMap::new();
        by_name.insert("name".into(), json!("Alice"));
        by_name.insert("type".into(), json!("person"));
        assert_eq!(graph.search_entities(&by_name).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_entity_cascades_relationships() {
        let graph = MemoryGraph::new();
        seed(&graph).await;

        assert!(graph.delete_entity("person_bob").await.unwrap());
        assert_eq!(graph.entity_count(), 2);
        assert_eq!(graph.relationship_count(), 0);
        assert!(!graph.delete_entity("person_bob").await.unwrap());
    }

    #[tokio::test]
    async fn subgraph_is_depth_limited() {
        let graph = MemoryGraph::new();
        seed(&graph).await;

        let shallow = graph
            .get_subgraph(&["person_alice".to_string()], 1)
            .await
            .unwrap();
        let ids: HashSet<&str> = shallow.entities.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains("person_alice"));
        assert!(ids.contains("person_bob"));
        assert!(!ids.contains("org_acme"));
        assert_eq!(shallow.relationships.len(), 1);

        let deep = graph
            .get_subgraph(&["person_alice".to_string()], 2)
            .await
            .unwrap();
        assert_eq!(deep.entities.len(), 3);
        assert_eq!(deep.relationships.len(), 2);
    }

    #[tokio::test]
    async fn relationships_filter_by_entity_and_type() {
        let graph = MemoryGraph::new();
        seed(&graph).await;

        let for_bob = graph
            .get_relationships(Some("person_bob"), None, None)
            .await
            .unwrap();
        assert_eq!(for_bob.len(), 2);

        let manages = graph
            .get_relationships(None, Some("manages"), None)
            .await
            .unwrap();
        assert_eq!(manages.len(), 1);
        assert_eq!(manages[0].id, "r1");

        let limited = graph.get_relationships(None, None, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
