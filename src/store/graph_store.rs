//! Durable, versioned graph storage on redb.
//!
//! Four record sets per repository (entities, relationships, communities,
//! text units), each keyed `(repository, version, record id)`, plus a
//! latest-version pointer and the aggregate snapshot. A bulk persist is a
//! single write transaction: either every table reflects the new version
//! or none does, and prior versions stay inspectable under their own
//! marker.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::graph::model::{Community, Entity, KnowledgeGraph, Relationship, TextUnit};

const ENTITIES: TableDefinition<(&str, u64, &str), &[u8]> = TableDefinition::new("entities");
const RELATIONSHIPS: TableDefinition<(&str, u64, &str), &[u8]> =
    TableDefinition::new("relationships");
const COMMUNITIES: TableDefinition<(&str, u64, &str), &[u8]> = TableDefinition::new("communities");
const TEXT_UNITS: TableDefinition<(&str, u64, &str), &[u8]> = TableDefinition::new("text_units");
/// repository -> latest committed version.
const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("versions");
/// repository -> serialized [`KnowledgeGraph`] aggregate snapshot.
const GRAPHS: TableDefinition<&str, &[u8]> = TableDefinition::new("graphs");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Graph not built for repository: {0}")]
    NotBuilt(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Text units are stored in their own record set; this wrapper keeps the
/// owning entity or relationship id alongside the unit for the rejoin at
/// load time.
#[derive(Debug, Serialize, Deserialize)]
struct StoredTextUnit {
    owner: String,
    unit: TextUnit,
}

pub struct GraphStore {
    db: Database,
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;

        // Make sure all tables exist before the first read.
        let txn = db.begin_write()?;
        {
            txn.open_table(ENTITIES)?;
            txn.open_table(RELATIONSHIPS)?;
            txn.open_table(COMMUNITIES)?;
            txn.open_table(TEXT_UNITS)?;
            txn.open_table(VERSIONS)?;
            txn.open_table(GRAPHS)?;
        }
        txn.commit()?;

        info!("Graph store opened at {}", path.as_ref().display());
        Ok(Self { db })
    }

    /// The version the next bulk persist should write. The caller fixes
    /// this once per build so retries upsert the same rows.
    pub fn next_version(&self, repository: &str) -> Result<u64, StoreError> {
        Ok(self.latest_version(repository)?.unwrap_or(0) + 1)
    }

    pub fn latest_version(&self, repository: &str) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VERSIONS)?;
        Ok(table.get(repository)?.map(|v| v.value()))
    }

    /// Bulk persist of one construction run. Upsert-by-key inside a single
    /// write transaction; calling twice with identical input leaves the
    /// store in the same queryable state.
    pub fn store_all(
        &self,
        repository: &str,
        version: u64,
        entities: &[Entity],
        relationships: &[Relationship],
        communities: &[Community],
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut entity_table = txn.open_table(ENTITIES)?;
            let mut unit_table = txn.open_table(TEXT_UNITS)?;

            for entity in entities {
                for unit in &entity.text_units {
                    let stored = StoredTextUnit {
                        owner: entity.id.clone(),
                        unit: unit.clone(),
                    };
                    unit_table.insert(
                        (repository, version, stored.unit.id.as_str()),
                        serde_json::to_vec(&stored)?.as_slice(),
                    )?;
                }
                // Units live in their own record set; strip them from the
                // entity row and rejoin on load.
                let mut row = entity.clone();
                row.text_units = Vec::new();
                entity_table.insert(
                    (repository, version, entity.id.as_str()),
                    serde_json::to_vec(&row)?.as_slice(),
                )?;
            }

            let mut rel_table = txn.open_table(RELATIONSHIPS)?;
            for rel in relationships {
                for unit in &rel.text_units {
                    let stored = StoredTextUnit {
                        owner: rel.id.clone(),
                        unit: unit.clone(),
                    };
                    unit_table.insert(
                        (repository, version, stored.unit.id.as_str()),
                        serde_json::to_vec(&stored)?.as_slice(),
                    )?;
                }
                let mut row = rel.clone();
                row.text_units = Vec::new();
                rel_table.insert(
                    (repository, version, rel.id.as_str()),
                    serde_json::to_vec(&row)?.as_slice(),
                )?;
            }

            let mut community_table = txn.open_table(COMMUNITIES)?;
            for community in communities {
                community_table.insert(
                    (repository, version, community.id.as_str()),
                    serde_json::to_vec(community)?.as_slice(),
                )?;
            }

            let mut version_table = txn.open_table(VERSIONS)?;
            version_table.insert(repository, version)?;
        }
        txn.commit()?;

        info!(
            "Persisted graph for {} at version {}: {} entities, {} relationships, {} communities",
            repository,
            version,
            entities.len(),
            relationships.len(),
            communities.len()
        );
        Ok(())
    }

    /// Persists the aggregate snapshot (status, metrics, errors).
    pub fn put_graph(&self, graph: &KnowledgeGraph) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(GRAPHS)?;
            table.insert(
                graph.repository_id.as_str(),
                serde_json::to_vec(graph)?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn load_graph(&self, repository: &str) -> Result<KnowledgeGraph, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(GRAPHS)?;
        match table.get(repository)? {
            Some(bytes) => Ok(serde_json::from_slice(bytes.value())?),
            None => Err(StoreError::NotBuilt(repository.to_string())),
        }
    }

    /// Loads the latest version of every record set, rejoining text units
    /// onto their owners.
    #[allow(clippy::type_complexity)]
    pub fn load_all(
        &self,
        repository: &str,
    ) -> Result<(Vec<Entity>, Vec<Relationship>, Vec<Community>), StoreError> {
        let version = self
            .latest_version(repository)?
            .ok_or_else(|| StoreError::NotBuilt(repository.to_string()))?;

        let txn = self.db.begin_read()?;

        let mut entities: Vec<Entity> = Vec::new();
        let entity_table = txn.open_table(ENTITIES)?;
        for row in entity_table.range((repository, version, "")..(repository, version + 1, ""))? {
            let (_, value) = row?;
            entities.push(serde_json::from_slice(value.value())?);
        }

        let mut relationships: Vec<Relationship> = Vec::new();
        let rel_table = txn.open_table(RELATIONSHIPS)?;
        for row in rel_table.range((repository, version, "")..(repository, version + 1, ""))? {
            let (_, value) = row?;
            relationships.push(serde_json::from_slice(value.value())?);
        }

        let mut communities: Vec<Community> = Vec::new();
        let community_table = txn.open_table(COMMUNITIES)?;
        for row in community_table.range((repository, version, "")..(repository, version + 1, ""))? {
            let (_, value) = row?;
            communities.push(serde_json::from_slice(value.value())?);
        }

        let unit_table = txn.open_table(TEXT_UNITS)?;
        let mut stored_units: Vec<StoredTextUnit> = Vec::new();
        for row in unit_table.range((repository, version, "")..(repository, version + 1, ""))? {
            let (_, value) = row?;
            stored_units.push(serde_json::from_slice(value.value())?);
        }
        for stored in stored_units {
            if let Some(entity) = entities.iter_mut().find(|e| e.id == stored.owner) {
                entity.text_units.push(stored.unit);
            } else if let Some(rel) = relationships.iter_mut().find(|r| r.id == stored.owner) {
                rel.text_units.push(stored.unit);
            }
        }

        debug!(
            "Loaded graph {} v{}: {} entities, {} relationships, {} communities",
            repository,
            version,
            entities.len(),
            relationships.len(),
            communities.len()
        );
        Ok((entities, relationships, communities))
    }

    /// Communities at the latest version, optionally filtered to one level.
    pub fn load_communities(
        &self,
        repository: &str,
        level: Option<u32>,
    ) -> Result<Vec<Community>, StoreError> {
        let version = self
            .latest_version(repository)?
            .ok_or_else(|| StoreError::NotBuilt(repository.to_string()))?;

        let txn = self.db.begin_read()?;
        let table = txn.open_table(COMMUNITIES)?;

        let mut communities = Vec::new();
        for row in table.range((repository, version, "")..(repository, version + 1, ""))? {
            let (_, value) = row?;
            let community: Community = serde_json::from_slice(value.value())?;
            if level.is_none_or(|l| community.level == l) {
                communities.push(community);
            }
        }
        Ok(communities)
    }

    pub fn load_entity(&self, repository: &str, entity_id: &str) -> Result<Entity, StoreError> {
        let version = self
            .latest_version(repository)?
            .ok_or_else(|| StoreError::NotBuilt(repository.to_string()))?;

        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        match table.get((repository, version, entity_id))? {
            Some(bytes) => Ok(serde_json::from_slice(bytes.value())?),
            None => Err(StoreError::NotFound(entity_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{EntityKind, RelationKind};
    use tempfile::tempdir;

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("{} description", id),
            kind: EntityKind::Class,
            text_units: vec![TextUnit {
                id: format!("tu-{}", id),
                text: format!("doc for {}", id),
                source_file: None,
            }],
            embedding: vec![0.1, 0.2],
            rank: 0.5,
            communities: vec!["com-0-0".to_string()],
            file_path: Some(format!("src/{}.rs", id)),
            line_range: Some((1, 20)),
            language: Some("rust".to_string()),
            signature: None,
        }
    }

    fn relationship(id: &str, source: &str, target: &str) -> Relationship {
        Relationship {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            kind: RelationKind::Calls,
            description: String::new(),
            weight: 0.7,
            confidence: 1.0,
            text_units: Vec::new(),
            rank: 0.0,
        }
    }

    fn community(id: &str, level: u32, members: &[&str]) -> Community {
        Community::new(
            id.to_string(),
            level,
            None,
            members.iter().map(|m| m.to_string()).collect(),
        )
    }

    fn sample() -> (Vec<Entity>, Vec<Relationship>, Vec<Community>) {
        (
            vec![entity("a"), entity("b")],
            vec![relationship("r1", "a", "b")],
            vec![
                community("com-0-0", 0, &["a", "b"]),
                community("com-1-0", 1, &["a"]),
            ],
        )
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        let (entities, relationships, communities) = sample();

        let version = store.next_version("repo").unwrap();
        store
            .store_all("repo", version, &entities, &relationships, &communities)
            .unwrap();

        let (loaded_e, loaded_r, loaded_c) = store.load_all("repo").unwrap();
        assert_eq!(loaded_e.len(), 2);
        assert_eq!(loaded_r.len(), 1);
        assert_eq!(loaded_c.len(), 2);

        // Text units survive the split storage.
        let a = loaded_e.iter().find(|e| e.id == "a").unwrap();
        assert_eq!(a.text_units.len(), 1);
        assert_eq!(a.text_units[0].text, "doc for a");
    }

    #[test]
    fn test_store_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        let (entities, relationships, communities) = sample();

        let version = store.next_version("repo").unwrap();
        store
            .store_all("repo", version, &entities, &relationships, &communities)
            .unwrap();
        store
            .store_all("repo", version, &entities, &relationships, &communities)
            .unwrap();

        let (loaded_e, loaded_r, loaded_c) = store.load_all("repo").unwrap();
        assert_eq!(loaded_e.len(), 2);
        assert_eq!(loaded_r.len(), 1);
        assert_eq!(loaded_c.len(), 2);
        assert_eq!(store.latest_version("repo").unwrap(), Some(version));
    }

    #[test]
    fn test_missing_repository_is_not_built() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        assert!(matches!(
            store.load_all("ghost"),
            Err(StoreError::NotBuilt(_))
        ));
        assert!(matches!(
            store.load_graph("ghost"),
            Err(StoreError::NotBuilt(_))
        ));
    }

    #[test]
    fn test_rebuild_creates_new_version_and_keeps_old_rows() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        let (entities, relationships, communities) = sample();

        let v1 = store.next_version("repo").unwrap();
        store
            .store_all("repo", v1, &entities, &relationships, &communities)
            .unwrap();

        let v2 = store.next_version("repo").unwrap();
        assert_eq!(v2, v1 + 1);
        store
            .store_all("repo", v2, &entities[..1], &[], &communities[..1])
            .unwrap();

        // Latest load reflects the new version only.
        let (loaded_e, loaded_r, loaded_c) = store.load_all("repo").unwrap();
        assert_eq!(loaded_e.len(), 1);
        assert_eq!(loaded_r.len(), 0);
        assert_eq!(loaded_c.len(), 1);
    }

    #[test]
    fn test_load_communities_by_level() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        let (entities, relationships, communities) = sample();

        let version = store.next_version("repo").unwrap();
        store
            .store_all("repo", version, &entities, &relationships, &communities)
            .unwrap();

        assert_eq!(store.load_communities("repo", None).unwrap().len(), 2);
        let level1 = store.load_communities("repo", Some(1)).unwrap();
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].id, "com-1-0");
    }

    #[test]
    fn test_load_entity_by_id() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();
        let (entities, relationships, communities) = sample();

        let version = store.next_version("repo").unwrap();
        store
            .store_all("repo", version, &entities, &relationships, &communities)
            .unwrap();

        let a = store.load_entity("repo", "a").unwrap();
        assert_eq!(a.name, "a");
        assert!(matches!(
            store.load_entity("repo", "ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_graph_snapshot_round_trip() {
        use crate::core::config::DetectionConfig;
        use crate::graph::model::GraphStatus;

        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.redb")).unwrap();

        let graph = KnowledgeGraph::new("repo", DetectionConfig::default())
            .with_status(GraphStatus::Ready);
        store.put_graph(&graph).unwrap();

        let loaded = store.load_graph("repo").unwrap();
        assert_eq!(loaded.status, GraphStatus::Ready);
        assert_eq!(loaded.repository_id, "repo");
    }
}
