use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString, IntoStaticStr};

use crate::core::config::DetectionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Class,
    Method,
    Function,
    Module,
    Service,
    Interface,
    Variable,
    Custom(String),
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Class => write!(f, "class"),
            Self::Method => write!(f, "method"),
            Self::Function => write!(f, "function"),
            Self::Module => write!(f, "module"),
            Self::Service => write!(f, "service"),
            Self::Interface => write!(f, "interface"),
            Self::Variable => write!(f, "variable"),
            Self::Custom(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for EntityKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "class" => Self::Class,
            "method" => Self::Method,
            "function" => Self::Function,
            "module" => Self::Module,
            "service" => Self::Service,
            "interface" => Self::Interface,
            "variable" => Self::Variable,
            other => Self::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Calls,
    Inherits,
    Implements,
    DependsOn,
    Contains,
    References,
    Custom(String),
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calls => write!(f, "calls"),
            Self::Inherits => write!(f, "inherits"),
            Self::Implements => write!(f, "implements"),
            Self::DependsOn => write!(f, "depends_on"),
            Self::Contains => write!(f, "contains"),
            Self::References => write!(f, "references"),
            Self::Custom(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for RelationKind {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "calls" => Self::Calls,
            "inherits" => Self::Inherits,
            "implements" => Self::Implements,
            "depends_on" | "depends-on" => Self::DependsOn,
            "contains" => Self::Contains,
            "references" => Self::References,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl RelationKind {
    /// Base edge weight by kind; inheritance and containment bind tighter
    /// than a plain reference.
    pub fn base_weight(&self) -> f64 {
        match self {
            Self::Inherits | Self::Implements => 0.9,
            Self::Contains => 0.85,
            Self::Calls => 0.7,
            Self::DependsOn => 0.6,
            Self::References => 0.4,
            Self::Custom(_) => 0.5,
        }
    }
}

/// Evidentiary snippet attached to an entity or relationship; immutable
/// once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

/// A node in the knowledge graph: one code construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub text_units: Vec<TextUnit>,
    /// Produced upstream; opaque to this crate.
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Structural importance, normalized to [0, 1]. Assigned by the
    /// detector, never inferred at query time.
    #[serde(default)]
    pub rank: f64,
    /// One community id per level this entity participates in, coarsest
    /// first.
    #[serde(default)]
    pub communities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A directed, weighted edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    pub description: String,
    /// Effective strength; kind base weight scaled by upstream confidence.
    pub weight: f64,
    /// Upstream extraction confidence in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub text_units: Vec<TextUnit>,
    #[serde(default)]
    pub rank: f64,
}

/// A detected group of related entities. The hierarchy is flat-stored:
/// children point at their parent rather than nesting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub title: String,
    pub summary: String,
    /// 0 is the coarsest grouping; higher levels refine their parent.
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub rank: f64,
    pub member_ids: Vec<String>,
    pub detected_at: DateTime<Utc>,
    /// True when the summarizer fell back to a member-list placeholder.
    #[serde(default)]
    pub summary_is_placeholder: bool,
}

impl Community {
    pub fn new(id: String, level: u32, parent_id: Option<String>, member_ids: Vec<String>) -> Self {
        Self {
            id,
            title: String::new(),
            summary: String::new(),
            level,
            parent_id,
            rank: 0.0,
            member_ids,
            detected_at: Utc::now(),
            summary_is_placeholder: false,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    NotBuilt,
    DetectingCommunities,
    Persisting,
    LoadingInMemory,
    Ready,
    Failed,
    RequiresUpdate,
}

/// A non-fatal (or pipeline-halting) error collected during construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphError {
    /// Component tag: `ingest`, `community-detection`, `summarization`,
    /// `persistence`, `load`.
    pub component: String,
    pub message: String,
    pub fatal: bool,
    pub occurred_at: DateTime<Utc>,
}

impl GraphError {
    pub fn warning(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            message: message.into(),
            fatal: false,
            occurred_at: Utc::now(),
        }
    }

    pub fn fatal(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            message: message.into(),
            fatal: true,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub entity_count: usize,
    pub relationship_count: usize,
    pub community_count: usize,
    pub max_community_level: u32,
    pub build_duration_ms: u64,
    /// Community count per level, keyed by level.
    pub level_distribution: BTreeMap<u32, usize>,
    pub avg_entity_rank: f64,
    pub avg_community_rank: f64,
    /// True when any community carries a placeholder summary; callers
    /// should signal lower confidence downstream.
    pub degraded: bool,
}

/// The aggregate root: one per repository, immutable snapshot per status
/// change. The build pipeline swaps the current snapshot; readers never
/// observe inconsistent status/metrics pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub repository_id: String,
    /// Monotonically increasing per bulk persist.
    pub version: u64,
    pub status: GraphStatus,
    pub metrics: GraphMetrics,
    /// Detection parameters frozen at construction time.
    pub config: DetectionConfig,
    pub errors: Vec<GraphError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeGraph {
    pub fn new(repository_id: &str, config: DetectionConfig) -> Self {
        let now = Utc::now();
        Self {
            repository_id: repository_id.to_string(),
            version: 0,
            status: GraphStatus::NotBuilt,
            metrics: GraphMetrics::default(),
            config,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Produces the next snapshot with an updated status.
    pub fn with_status(&self, status: GraphStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        next
    }

    pub fn with_error(&self, error: GraphError) -> Self {
        let mut next = self.clone();
        if error.fatal {
            next.status = GraphStatus::Failed;
        }
        next.errors.push(error);
        next.updated_at = Utc::now();
        next
    }

    /// Queryable iff construction finished and produced structure.
    pub fn is_queryable(&self) -> bool {
        self.status == GraphStatus::Ready && self.metrics.community_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_round_trip() {
        assert_eq!(EntityKind::from("class"), EntityKind::Class);
        assert_eq!(EntityKind::Class.to_string(), "class");
        assert_eq!(
            EntityKind::from("trait_impl"),
            EntityKind::Custom("trait_impl".to_string())
        );
    }

    #[test]
    fn test_relation_base_weights_ordered() {
        assert!(RelationKind::Inherits.base_weight() > RelationKind::Calls.base_weight());
        assert!(RelationKind::Calls.base_weight() > RelationKind::References.base_weight());
    }

    #[test]
    fn test_status_snapshots_are_immutable() {
        let graph = KnowledgeGraph::new("repo-1", DetectionConfig::default());
        let detecting = graph.with_status(GraphStatus::DetectingCommunities);
        assert_eq!(graph.status, GraphStatus::NotBuilt);
        assert_eq!(detecting.status, GraphStatus::DetectingCommunities);
    }

    #[test]
    fn test_fatal_error_fails_the_graph() {
        let graph = KnowledgeGraph::new("repo-1", DetectionConfig::default())
            .with_error(GraphError::fatal("ingest", "empty entity set"));
        assert_eq!(graph.status, GraphStatus::Failed);
        assert!(!graph.is_queryable());
    }

    #[test]
    fn test_ready_without_communities_is_not_queryable() {
        let mut graph = KnowledgeGraph::new("repo-1", DetectionConfig::default());
        graph.status = GraphStatus::Ready;
        assert!(!graph.is_queryable());
        graph.metrics.community_count = 2;
        assert!(graph.is_queryable());
    }
}
