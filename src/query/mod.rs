//! Query side: in-memory snapshots plus the three search modes.

pub mod engine;
pub mod global_search;
pub mod hybrid;
pub mod keyword;
pub mod local_search;
pub mod models;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::config::SearchConfig;
use crate::core::error::Result;
use crate::llm::synthesis::AnswerSynthesizer;

pub use engine::{QueryEngine, QueryableGraph};
pub use models::{
    ContextFragment, ContextKind, GraphQuery, QueryMode, QueryResult, SourceAttribution,
};

struct CachedAnswer {
    result: QueryResult,
    stored_at: Instant,
}

/// The public query surface: resolves the repository snapshot, dispatches
/// to the mode's search and memoizes recent answers.
pub struct SearchService {
    engine: Arc<QueryEngine>,
    synthesizer: AnswerSynthesizer,
    config: SearchConfig,
    cache: Mutex<LruCache<String, CachedAnswer>>,
    ttl: Duration,
}

impl SearchService {
    pub fn new(
        engine: Arc<QueryEngine>,
        synthesizer: AnswerSynthesizer,
        config: SearchConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size.max(1)).unwrap();
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            engine,
            synthesizer,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub async fn search(&self, query: &GraphQuery) -> Result<QueryResult> {
        let graph = self.engine.snapshot(&query.repository_id)?;

        // Keyed by snapshot version: a rebuild that installs a new
        // snapshot invalidates every cached answer for the old one.
        let key = cache_key(query, graph.version);
        if let Some(hit) = self.cache_get(&key) {
            debug!("Answer cache hit for {} ({})", query.repository_id, query.mode);
            return Ok(hit);
        }

        let result = match query.mode {
            QueryMode::Global => {
                global_search::execute(&graph, &self.synthesizer, &self.config, query).await?
            }
            QueryMode::Local => {
                local_search::execute(&graph, &self.synthesizer, &self.config, query).await?
            }
            QueryMode::Hybrid => {
                hybrid::execute(&graph, &self.synthesizer, &self.config, query).await?
            }
        };

        self.cache.lock().put(
            key,
            CachedAnswer {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(result)
    }

    /// Drops the repository's snapshot and all memoized answers; called
    /// after a rebuild lands a new version.
    pub fn invalidate(&self, repository: &str) {
        self.engine.invalidate(repository);
        self.cache.lock().clear();
    }

    fn cache_get(&self, key: &str) -> Option<QueryResult> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }
}

fn cache_key(query: &GraphQuery, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.repository_id.as_bytes());
    hasher.update(version.to_le_bytes());
    hasher.update([0]);
    hasher.update(query.mode.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(query.text.as_bytes());
    hasher.update([0]);
    if let Some(focus) = &query.focus_entity_id {
        hasher.update(focus.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DetectionConfig, RepographConfig};
    use crate::graph::model::{
        Community, Entity, EntityKind, GraphStatus, KnowledgeGraph,
    };
    use crate::llm::providers::base::{LlmMetadata, LlmProvider, LlmProviderError};
    use crate::store::GraphStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                "Answer.\nCONFIDENCE: 0.9".to_string(),
                LlmMetadata::default(),
            ))
        }
        fn provider_name(&self) -> &str {
            "counting"
        }
        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn seeded_store(dir: &TempDir) -> Arc<GraphStore> {
        let store =
            Arc::new(GraphStore::open(dir.path().join("graph.redb")).unwrap());

        let entity = Entity {
            id: "pay".to_string(),
            name: "PaymentService".to_string(),
            description: "handles invoice payments".to_string(),
            kind: EntityKind::Class,
            text_units: Vec::new(),
            embedding: Vec::new(),
            rank: 0.8,
            communities: vec!["com-0-0".to_string()],
            file_path: None,
            line_range: None,
            language: None,
            signature: None,
        };
        let mut community =
            Community::new("com-0-0".to_string(), 0, None, vec!["pay".to_string()]);
        community.title = "Payments".to_string();
        community.summary = "invoice payment handling".to_string();
        community.rank = 0.8;

        let mut graph = KnowledgeGraph::new("repo", DetectionConfig::default());
        graph.version = 1;
        graph.status = GraphStatus::Ready;
        graph.metrics.entity_count = 1;
        graph.metrics.community_count = 1;

        store
            .store_all("repo", 1, &[entity], &[], &[community])
            .unwrap();
        store.put_graph(&graph).unwrap();
        store
    }

    fn service(store: Arc<GraphStore>, provider: Arc<CountingProvider>) -> SearchService {
        let config = RepographConfig::default();
        let engine = Arc::new(QueryEngine::new(store, config.search.clone()));
        let synthesizer = AnswerSynthesizer::new(provider, 5);
        SearchService::new(engine, synthesizer, config.search)
    }

    #[tokio::test]
    async fn test_repeated_query_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let service = service(seeded_store(&dir), Arc::clone(&provider));
        let query = GraphQuery::global("repo", "how are payments handled?");

        let first = service.search(&query).await.unwrap();
        let calls_after_first = provider.calls.load(Ordering::SeqCst);
        let second = service.search(&query).await.unwrap();

        assert_eq!(first.answer, second.answer);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn test_invalidate_clears_cached_answers() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let service = service(seeded_store(&dir), Arc::clone(&provider));
        let query = GraphQuery::global("repo", "how are payments handled?");

        service.search(&query).await.unwrap();
        let calls_after_first = provider.calls.load(Ordering::SeqCst);
        service.invalidate("repo");
        service.search(&query).await.unwrap();

        assert!(provider.calls.load(Ordering::SeqCst) > calls_after_first);
    }

    #[tokio::test]
    async fn test_new_snapshot_version_bypasses_stale_answers() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let config = RepographConfig::default();
        let engine = Arc::new(QueryEngine::new(store, config.search.clone()));
        let synthesizer = AnswerSynthesizer::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, 5);
        let service = SearchService::new(Arc::clone(&engine), synthesizer, config.search.clone());
        let query = GraphQuery::global("repo", "how are payments handled?");

        service.search(&query).await.unwrap();
        let calls_after_first = provider.calls.load(Ordering::SeqCst);
        service.search(&query).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);

        // A rebuild installs version 2 directly on the engine, without
        // the service being told. Cached version-1 answers must not be
        // served against it.
        let mut graph = KnowledgeGraph::new("repo", DetectionConfig::default());
        graph.version = 2;
        graph.status = GraphStatus::Ready;
        graph.metrics.community_count = 1;
        let mut community =
            Community::new("com-0-0".to_string(), 0, None, vec!["pay".to_string()]);
        community.title = "Payments".to_string();
        community.summary = "invoice payment handling".to_string();
        community.rank = 0.8;
        engine.install(Arc::new(QueryableGraph::build(
            &graph,
            Vec::new(),
            Vec::new(),
            vec![community],
            &config.search,
        )));

        service.search(&query).await.unwrap();
        assert!(provider.calls.load(Ordering::SeqCst) > calls_after_first);
    }

    #[tokio::test]
    async fn test_distinct_modes_are_cached_separately() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let service = service(seeded_store(&dir), Arc::clone(&provider));

        let global = service
            .search(&GraphQuery::global("repo", "payments"))
            .await
            .unwrap();
        let local = service
            .search(&GraphQuery::local("repo", "payments"))
            .await
            .unwrap();

        assert_eq!(global.mode, QueryMode::Global);
        assert_eq!(local.mode, QueryMode::Local);
    }
}
