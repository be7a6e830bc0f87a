//! In-memory projection of a stored knowledge graph.
//!
//! `QueryableGraph` is immutable after construction; a rebuild produces a
//! fresh instance that the engine swaps in atomically. Readers holding the
//! old `Arc` finish against it undisturbed.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::SearchConfig;
use crate::core::error::{RepographError, Result};
use crate::graph::model::{Community, Entity, KnowledgeGraph, Relationship};
use crate::query::keyword::tokenize;
use crate::store::{GraphStore, StoreError};

pub struct QueryableGraph {
    pub repository_id: String,
    pub version: u64,
    /// True when any community summary is a placeholder.
    pub degraded: bool,

    entities: HashMap<String, Entity>,
    relationships: Vec<Relationship>,
    /// Entity id -> indexes into `relationships`, both directions.
    adjacency: HashMap<String, Vec<usize>>,
    communities: HashMap<String, Community>,
    by_level: BTreeMap<u32, Vec<String>>,
    /// Token -> entity ids containing it in name or description.
    token_index: HashMap<String, Vec<String>>,

    max_network_relationships: usize,
}

impl QueryableGraph {
    pub fn build(
        graph: &KnowledgeGraph,
        entities: Vec<Entity>,
        relationships: Vec<Relationship>,
        communities: Vec<Community>,
        config: &SearchConfig,
    ) -> Self {
        let mut adjacency: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, rel) in relationships.iter().enumerate() {
            adjacency.entry(rel.source.clone()).or_default().push(i);
            adjacency.entry(rel.target.clone()).or_default().push(i);
        }

        let mut token_index: HashMap<String, Vec<String>> = HashMap::new();
        for entity in &entities {
            let mut tokens: HashSet<String> = tokenize(&entity.name).into_iter().collect();
            tokens.extend(tokenize(&entity.description));
            for token in tokens {
                token_index.entry(token).or_default().push(entity.id.clone());
            }
        }

        let degraded = communities.iter().any(|c| c.summary_is_placeholder);

        let mut by_level: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for community in &communities {
            by_level
                .entry(community.level)
                .or_default()
                .push(community.id.clone());
        }

        info!(
            "Query graph materialized for {} v{}: {} entities, {} relationships, {} communities{}",
            graph.repository_id,
            graph.version,
            entities.len(),
            relationships.len(),
            communities.len(),
            if degraded { " (degraded)" } else { "" }
        );

        Self {
            repository_id: graph.repository_id.clone(),
            version: graph.version,
            degraded,
            entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
            relationships,
            adjacency,
            communities: communities.into_iter().map(|c| (c.id.clone(), c)).collect(),
            by_level,
            token_index,
            max_network_relationships: config.max_network_relationships,
        }
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn community(&self, id: &str) -> Option<&Community> {
        self.communities.get(id)
    }

    pub fn communities(&self) -> impl Iterator<Item = &Community> {
        self.communities.values()
    }

    pub fn communities_at_level(&self, level: u32) -> Vec<&Community> {
        self.by_level
            .get(&level)
            .map(|ids| ids.iter().filter_map(|id| self.communities.get(id)).collect())
            .unwrap_or_default()
    }

    /// Relationships touching an entity, either direction.
    pub fn relationships_of(&self, entity_id: &str) -> Vec<&Relationship> {
        self.adjacency
            .get(entity_id)
            .map(|idxs| idxs.iter().map(|&i| &self.relationships[i]).collect())
            .unwrap_or_default()
    }

    /// Entity ids whose name or description contains any query token;
    /// the cheap pre-filter ahead of scoring.
    pub fn candidates_for(&self, query: &str) -> Vec<&Entity> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut candidates = Vec::new();
        for token in tokenize(query) {
            if let Some(ids) = self.token_index.get(&token) {
                for id in ids {
                    if seen.insert(id.as_str()) {
                        if let Some(entity) = self.entities.get(id) {
                            candidates.push(entity);
                        }
                    }
                }
            }
        }
        candidates
    }

    /// Bounded breadth-first traversal from each seed.
    ///
    /// Tracks visited *edges*, not just nodes: the graph is cyclic, and a
    /// node revisited through a new edge is legitimate context while a
    /// repeated edge is not. Each seed's result is capped to keep response
    /// sizes bounded.
    pub fn entity_network(
        &self,
        seed_ids: &[&str],
        max_depth: usize,
    ) -> Result<HashMap<String, Vec<Relationship>>> {
        let mut network = HashMap::new();

        for &seed in seed_ids {
            if !self.entities.contains_key(seed) {
                return Err(RepographError::EntityNotFound(seed.to_string()));
            }

            let mut collected: Vec<Relationship> = Vec::new();
            let mut visited_edges: HashSet<usize> = HashSet::new();
            let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
            queue.push_back((seed, 0));

            'bfs: while let Some((node, depth)) = queue.pop_front() {
                if depth >= max_depth {
                    continue;
                }
                let Some(edge_idxs) = self.adjacency.get(node) else {
                    continue;
                };
                for &idx in edge_idxs {
                    if !visited_edges.insert(idx) {
                        continue;
                    }
                    let rel = &self.relationships[idx];
                    collected.push(rel.clone());
                    if collected.len() >= self.max_network_relationships {
                        break 'bfs;
                    }
                    let other = if rel.source == node {
                        rel.target.as_str()
                    } else {
                        rel.source.as_str()
                    };
                    queue.push_back((other, depth + 1));
                }
            }

            debug!(
                "Network for seed {}: {} relationships at depth {}",
                seed,
                collected.len(),
                max_depth
            );
            network.insert(seed.to_string(), collected);
        }

        Ok(network)
    }
}

/// Loads stored graphs into queryable snapshots and serves the current one.
pub struct QueryEngine {
    store: Arc<GraphStore>,
    config: SearchConfig,
    current: RwLock<HashMap<String, Arc<QueryableGraph>>>,
}

impl QueryEngine {
    pub fn new(store: Arc<GraphStore>, config: SearchConfig) -> Self {
        Self {
            store,
            config,
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Materializes the latest stored version. Fails with a typed
    /// condition unless the aggregate is ready; "index still building" is
    /// the caller's message to surface, not a retry loop.
    pub fn load(&self, repository: &str) -> Result<Arc<QueryableGraph>> {
        let graph = match self.store.load_graph(repository) {
            Ok(graph) => graph,
            Err(StoreError::NotBuilt(repo)) => return Err(RepographError::GraphNotBuilt(repo)),
            Err(e) => return Err(e.into()),
        };

        if !graph.is_queryable() {
            return Err(RepographError::GraphNotReady {
                repository: repository.to_string(),
                status: graph.status.to_string(),
            });
        }

        let (entities, relationships, communities) = self.store.load_all(repository)?;
        let snapshot = Arc::new(QueryableGraph::build(
            &graph,
            entities,
            relationships,
            communities,
            &self.config,
        ));

        // Atomic swap; readers on the previous Arc are unaffected.
        self.current
            .write()
            .insert(repository.to_string(), Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// The current snapshot, loading it on first access.
    pub fn snapshot(&self, repository: &str) -> Result<Arc<QueryableGraph>> {
        if let Some(snapshot) = self.current.read().get(repository) {
            return Ok(Arc::clone(snapshot));
        }
        self.load(repository)
    }

    /// Installs a snapshot produced by the build pipeline, replacing any
    /// previously served version without a store round trip.
    pub fn install(&self, snapshot: Arc<QueryableGraph>) {
        self.current
            .write()
            .insert(snapshot.repository_id.clone(), snapshot);
    }

    /// Drops the cached snapshot so the next query sees a fresh load.
    pub fn invalidate(&self, repository: &str) {
        self.current.write().remove(repository);
    }
}
