use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Global,
    Local,
    Hybrid,
}

/// What a context fragment was taken from; consumers switch on the tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    CommunityReport,
    EntityDescription,
    RelationshipDescription,
    SourceCode,
    Documentation,
}

/// A query against one repository's knowledge graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQuery {
    pub repository_id: String,
    pub text: String,
    pub mode: QueryMode,
    /// Seeds local search directly instead of keyword matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_entity_id: Option<String>,
    /// Optional pre-computed embedding of the query text, used to augment
    /// keyword scoring. Never computed by this crate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Attach source attributions to the result where available.
    #[serde(default = "default_true")]
    pub include_sources: bool,
}

fn default_true() -> bool {
    true
}

impl GraphQuery {
    pub fn global(repository_id: &str, text: &str) -> Self {
        Self::new(repository_id, text, QueryMode::Global)
    }

    pub fn local(repository_id: &str, text: &str) -> Self {
        Self::new(repository_id, text, QueryMode::Local)
    }

    pub fn hybrid(repository_id: &str, text: &str) -> Self {
        Self::new(repository_id, text, QueryMode::Hybrid)
    }

    fn new(repository_id: &str, text: &str, mode: QueryMode) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            text: text.to_string(),
            mode,
            focus_entity_id: None,
            embedding: None,
            include_sources: true,
        }
    }

    pub fn with_focus(mut self, entity_id: &str) -> Self {
        self.focus_entity_id = Some(entity_id.to_string());
        self
    }
}

/// One grounding fragment behind an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFragment {
    pub kind: ContextKind,
    /// Id of the community, entity or relationship the content came from.
    pub source_id: String,
    pub content: String,
    pub relevance: f64,
}

/// A concrete source-code location backing part of an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub entity_id: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
    pub snippet: String,
    pub relevance: f64,
}

/// The synthesized, citation-backed answer. Produced per query, never
/// persisted as graph state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub mode: QueryMode,
    /// Always in [0, 1], whatever the collaborator emitted.
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub contexts: Vec<ContextFragment>,
    pub sources: Vec<SourceAttribution>,
    /// True when the underlying graph carries placeholder summaries.
    #[serde(default)]
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builders() {
        let query = GraphQuery::local("repo", "who calls auth?").with_focus("auth");
        assert_eq!(query.mode, QueryMode::Local);
        assert_eq!(query.focus_entity_id.as_deref(), Some("auth"));
        assert!(query.include_sources);
    }

    #[test]
    fn test_context_kind_serialization() {
        let json = serde_json::to_string(&ContextKind::CommunityReport).unwrap();
        assert_eq!(json, "\"community_report\"");
    }
}
