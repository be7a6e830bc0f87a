pub mod core;
pub mod graph;
pub mod llm;
pub mod query;
pub mod store;
pub mod utils;

pub use utils::{safe_truncate, safe_truncate_ellipsis};

pub use core::config::RepographConfig;
pub use core::error::{RepographError, Result};
pub use graph::builder::GraphBuilder;
pub use llm::factory::LlmProviderFactory;
pub use query::{GraphQuery, QueryEngine, QueryMode, QueryResult, SearchService};
pub use store::{GraphStore, StoreError};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub const DEFAULT_LLM_MODEL: &str = "llama3.1:8b";

pub const DEFAULT_CACHE_SIZE: usize = 1000;

pub const DEFAULT_CACHE_TTL: u64 = 300;
