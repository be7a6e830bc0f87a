//! Graph construction: ingest, community detection, summarization and the
//! build pipeline that ties them together.

pub mod builder;
pub mod detection;
pub mod ingest;
pub mod model;
pub mod summarizer;

pub use builder::GraphBuilder;
pub use detection::{CommunityDetector, DetectionOutcome};
pub use ingest::{RawEntity, RawRelationship};
pub use model::{
    Community, Entity, EntityKind, GraphError, GraphMetrics, GraphStatus, KnowledgeGraph,
    RelationKind, Relationship, TextUnit,
};
pub use summarizer::CommunitySummarizer;
