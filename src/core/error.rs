use thiserror::Error;

/// Crate-wide error type.
///
/// Component-local errors (LLM providers, graph store) carry their own enums
/// and convert into this one at the seams.
#[derive(Error, Debug)]
pub enum RepographError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Community detection error: {0}")]
    Detection(String),

    #[error("Graph store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("LLM provider error: {0}")]
    LlmProvider(#[from] crate::llm::providers::base::LlmProviderError),

    #[error("Graph not built for repository: {0}")]
    GraphNotBuilt(String),

    #[error("Graph not ready for repository {repository}: status is {status}")]
    GraphNotReady { repository: String, status: String },

    #[error("A build is already in progress for repository: {0}")]
    AlreadyBuilding(String),

    #[error("Build cancelled for repository: {0}")]
    BuildCancelled(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RepographError>;
