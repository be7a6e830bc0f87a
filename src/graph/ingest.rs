use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::core::error::{RepographError, Result};
use crate::graph::model::{Entity, EntityKind, RelationKind, Relationship, TextUnit};

/// Entity shape delivered by the upstream code-analysis provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntity {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub documentation: Vec<String>,
    /// Produced by the embedding collaborator; consumed opaquely.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Relationship shape delivered by the upstream code-analysis provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRelationship {
    pub source: String,
    pub target: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Extraction confidence in [0, 1]; defaults to certain.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// Normalizes upstream analysis output into graph construction input.
///
/// Validation failures here are fatal to the build: an empty entity set or
/// a dangling relationship endpoint is a construction error, never a
/// runtime possibility downstream.
pub fn normalize(
    raw_entities: Vec<RawEntity>,
    raw_relationships: Vec<RawRelationship>,
) -> Result<(Vec<Entity>, Vec<Relationship>)> {
    if raw_entities.is_empty() {
        return Err(RepographError::Ingest(
            "upstream delivered an empty entity set".to_string(),
        ));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for raw in &raw_entities {
        if raw.id.trim().is_empty() {
            return Err(RepographError::Ingest(format!(
                "entity '{}' has an empty id",
                raw.name
            )));
        }
        if !seen_ids.insert(raw.id.as_str()) {
            return Err(RepographError::Ingest(format!(
                "duplicate entity id: {}",
                raw.id
            )));
        }
    }

    for raw in &raw_relationships {
        if !seen_ids.contains(raw.source.as_str()) {
            return Err(RepographError::Ingest(format!(
                "relationship references unknown source entity: {}",
                raw.source
            )));
        }
        if !seen_ids.contains(raw.target.as_str()) {
            return Err(RepographError::Ingest(format!(
                "relationship references unknown target entity: {}",
                raw.target
            )));
        }
    }

    let relationships: Vec<Relationship> = raw_relationships
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let kind = RelationKind::from(raw.kind.as_str());
            // Low-confidence edges are down-weighted, not discarded.
            let weight = kind.base_weight() * raw.confidence.clamp(0.0, 1.0);
            Relationship {
                id: format!("rel-{}-{}-{}", raw.source, raw.target, i),
                description: if raw.description.is_empty() {
                    format!("{} {} {}", raw.source, kind, raw.target)
                } else {
                    raw.description
                },
                source: raw.source,
                target: raw.target,
                kind,
                weight,
                confidence: raw.confidence.clamp(0.0, 1.0),
                text_units: Vec::new(),
                rank: 0.0,
            }
        })
        .collect();

    // Initial rank from weighted degree; the detector refines it with
    // detection-time statistics.
    let mut degree: HashMap<&str, f64> = HashMap::new();
    for rel in &relationships {
        *degree.entry(rel.source.as_str()).or_default() += rel.weight;
        *degree.entry(rel.target.as_str()).or_default() += rel.weight;
    }
    let max_degree = degree.values().cloned().fold(0.0_f64, f64::max).max(1e-9);

    let entities: Vec<Entity> = raw_entities
        .into_iter()
        .map(|raw| {
            let rank = degree.get(raw.id.as_str()).copied().unwrap_or(0.0) / max_degree;
            let text_units = raw
                .documentation
                .iter()
                .enumerate()
                .map(|(i, doc)| TextUnit {
                    id: format!("tu-{}-{}", raw.id, i),
                    text: doc.clone(),
                    source_file: raw.file_path.clone(),
                })
                .collect();
            Entity {
                kind: EntityKind::from(raw.kind.as_str()),
                description: if raw.description.is_empty() {
                    raw.signature.clone().unwrap_or_else(|| raw.name.clone())
                } else {
                    raw.description
                },
                id: raw.id,
                name: raw.name,
                text_units,
                embedding: raw.embedding,
                rank,
                communities: Vec::new(),
                file_path: raw.file_path,
                line_range: raw.line_range,
                language: raw.language,
                signature: raw.signature,
            }
        })
        .collect();

    debug!(
        "Normalized {} entities, {} relationships",
        entities.len(),
        relationships.len()
    );
    info!(
        "Ingest complete: {} entities, {} relationships",
        entities.len(),
        relationships.len()
    );

    Ok((entities, relationships))
}
