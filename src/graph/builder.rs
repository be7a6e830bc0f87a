//! The construction pipeline: ingest, detect, summarize, persist, serve.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::core::config::RepographConfig;
use crate::core::error::{RepographError, Result};
use crate::graph::detection::CommunityDetector;
use crate::graph::ingest::{self, RawEntity, RawRelationship};
use crate::graph::model::{
    Community, Entity, GraphError, GraphMetrics, GraphStatus, KnowledgeGraph, Relationship,
};
use crate::graph::summarizer::CommunitySummarizer;
use crate::llm::providers::base::LlmProvider;
use crate::query::engine::{QueryEngine, QueryableGraph};
use crate::store::GraphStore;

/// Orchestrates one repository build end to end. Each status transition
/// persists a fresh aggregate snapshot, so pollers always see a
/// consistent status/metrics pair even mid-build.
pub struct GraphBuilder {
    store: Arc<GraphStore>,
    engine: Arc<QueryEngine>,
    summarizer: CommunitySummarizer,
    config: RepographConfig,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    build_slots: Semaphore,
}

impl GraphBuilder {
    pub fn new(
        store: Arc<GraphStore>,
        engine: Arc<QueryEngine>,
        provider: Arc<dyn LlmProvider>,
        config: RepographConfig,
    ) -> Self {
        let summarizer = CommunitySummarizer::new(
            provider,
            config.llm_timeout_secs,
            config.summary_prompt_budget,
            config.summary_sample_size,
            config.summary_concurrency,
        );
        Self {
            store,
            engine,
            summarizer,
            build_slots: Semaphore::new(config.max_concurrent_builds.max(1)),
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Builds (or rebuilds) the repository's graph from upstream analysis
    /// output. Exactly one build per repository runs at a time; a second
    /// caller gets `AlreadyBuilding` immediately rather than queueing.
    pub async fn build(
        &self,
        repository: &str,
        raw_entities: Vec<RawEntity>,
        raw_relationships: Vec<RawRelationship>,
    ) -> Result<KnowledgeGraph> {
        let cancel = self.claim(repository)?;
        let result = self
            .run_pipeline(repository, raw_entities, raw_relationships, &cancel)
            .await;
        self.in_flight.lock().remove(repository);

        match &result {
            Ok(graph) => info!(
                "Build complete for {} v{}: {} entities, {} communities in {}ms",
                repository,
                graph.version,
                graph.metrics.entity_count,
                graph.metrics.community_count,
                graph.metrics.build_duration_ms
            ),
            Err(e) => error!("Build failed for {}: {}", repository, e),
        }
        result
    }

    /// Requests cancellation of an in-flight build. Returns false when no
    /// build is running for the repository.
    pub fn cancel(&self, repository: &str) -> bool {
        match self.in_flight.lock().get(repository) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// The current aggregate for polling. A repository that was never
    /// built reports `NotBuilt` rather than an error.
    pub fn status(&self, repository: &str) -> Result<KnowledgeGraph> {
        match self.store.load_graph(repository) {
            Ok(graph) => Ok(graph),
            Err(crate::store::StoreError::NotBuilt(_)) => Ok(KnowledgeGraph::new(
                repository,
                self.config.detection.clone(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Marks the current graph stale after upstream changes; queries keep
    /// serving the old version until the next build lands.
    pub fn mark_stale(&self, repository: &str) -> Result<()> {
        let graph = self.store.load_graph(repository)?;
        self.store
            .put_graph(&graph.with_status(GraphStatus::RequiresUpdate))?;
        Ok(())
    }

    fn claim(&self, repository: &str) -> Result<Arc<AtomicBool>> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(repository) {
            return Err(RepographError::AlreadyBuilding(repository.to_string()));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        in_flight.insert(repository.to_string(), Arc::clone(&cancel));
        Ok(cancel)
    }

    async fn run_pipeline(
        &self,
        repository: &str,
        raw_entities: Vec<RawEntity>,
        raw_relationships: Vec<RawRelationship>,
        cancel: &AtomicBool,
    ) -> Result<KnowledgeGraph> {
        let _slot = self
            .build_slots
            .acquire()
            .await
            .map_err(|e| RepographError::Internal(e.to_string()))?;
        let started = Instant::now();

        // The version is fixed up front so a retried persist overwrites
        // its own partial records instead of minting a new version.
        let version = self.store.next_version(repository)?;
        let mut graph = KnowledgeGraph::new(repository, self.config.detection.clone());
        graph.version = version;

        graph = graph.with_status(GraphStatus::DetectingCommunities);
        self.store.put_graph(&graph)?;

        let (mut entities, relationships) = match ingest::normalize(raw_entities, raw_relationships)
        {
            Ok(normalized) => normalized,
            Err(e) => return Err(self.fail(graph, "ingest", e)),
        };

        let detector = CommunityDetector::new(self.config.detection.clone());
        let mut communities = match detector.detect(&mut entities, &relationships) {
            Ok(outcome) => {
                graph.errors.extend(outcome.warnings);
                outcome.communities
            }
            Err(e) => return Err(self.fail(graph, "community-detection", e)),
        };

        if cancel.load(Ordering::SeqCst) {
            return Err(self.fail(
                graph,
                "community-detection",
                RepographError::BuildCancelled(repository.to_string()),
            ));
        }

        match self
            .summarizer
            .summarize_all(&mut communities, &entities, cancel)
            .await
        {
            Ok(warnings) => graph.errors.extend(warnings),
            Err(e) => return Err(self.fail(graph, "summarization", e)),
        }
        if cancel.load(Ordering::SeqCst) {
            return Err(self.fail(
                graph,
                "summarization",
                RepographError::BuildCancelled(repository.to_string()),
            ));
        }

        graph = graph.with_status(GraphStatus::Persisting);
        self.store.put_graph(&graph)?;
        if let Err(e) = self
            .persist_with_retry(repository, version, &entities, &relationships, &communities)
            .await
        {
            return Err(self.fail(graph, "persistence", e));
        }

        graph = graph.with_status(GraphStatus::LoadingInMemory);
        graph.metrics = compute_metrics(&entities, &relationships, &communities, started.elapsed());
        self.store.put_graph(&graph)?;

        graph = graph.with_status(GraphStatus::Ready);
        let snapshot = Arc::new(QueryableGraph::build(
            &graph,
            entities,
            relationships,
            communities,
            &self.config.search,
        ));
        self.store.put_graph(&graph)?;
        self.engine.install(snapshot);

        Ok(graph)
    }

    async fn persist_with_retry(
        &self,
        repository: &str,
        version: u64,
        entities: &[Entity],
        relationships: &[Relationship],
        communities: &[Community],
    ) -> Result<()> {
        let mut delay = Duration::from_millis(self.config.store_retry_delay_ms);
        let mut attempts = 0;
        loop {
            match self
                .store
                .store_all(repository, version, entities, relationships, communities)
            {
                Ok(()) => return Ok(()),
                Err(e) if attempts < self.config.store_max_retries => {
                    attempts += 1;
                    warn!(
                        "Persist attempt {} for {} v{} failed, retrying in {:?}: {}",
                        attempts, repository, version, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Records a fatal snapshot and hands the original error back. A
    /// failed persist of the failure record itself is only logged; the
    /// pipeline error wins.
    fn fail(&self, graph: KnowledgeGraph, component: &str, error: RepographError) -> RepographError {
        let failed = graph.with_error(GraphError::fatal(component, error.to_string()));
        if let Err(e) = self.store.put_graph(&failed) {
            error!(
                "Could not persist failure record for {}: {}",
                failed.repository_id, e
            );
        }
        error
    }
}

fn compute_metrics(
    entities: &[Entity],
    relationships: &[Relationship],
    communities: &[Community],
    build_duration: Duration,
) -> GraphMetrics {
    let mut level_distribution: BTreeMap<u32, usize> = BTreeMap::new();
    for community in communities {
        *level_distribution.entry(community.level).or_default() += 1;
    }

    let avg = |sum: f64, n: usize| if n == 0 { 0.0 } else { sum / n as f64 };

    GraphMetrics {
        entity_count: entities.len(),
        relationship_count: relationships.len(),
        community_count: communities.len(),
        max_community_level: communities.iter().map(|c| c.level).max().unwrap_or(0),
        build_duration_ms: build_duration.as_millis() as u64,
        level_distribution,
        avg_entity_rank: avg(entities.iter().map(|e| e.rank).sum(), entities.len()),
        avg_community_rank: avg(communities.iter().map(|c| c.rank).sum(), communities.len()),
        degraded: communities.iter().any(|c| c.summary_is_placeholder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SearchConfig;
    use crate::llm::providers::base::{LlmMetadata, LlmProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct CannedProvider;

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            Ok((
                "Title: Payments\nSummary: Handles invoice payment flow across services."
                    .to_string(),
                LlmMetadata::default(),
            ))
        }
        fn provider_name(&self) -> &str {
            "canned"
        }
        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[derive(Debug)]
    struct TimeoutProvider;

    #[async_trait]
    impl LlmProvider for TimeoutProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            Err(LlmProviderError::Timeout(1))
        }
        fn provider_name(&self) -> &str {
            "timeout"
        }
        fn model_name(&self) -> &str {
            "timeout"
        }
    }

    /// A provider slow enough that a concurrent second build attempt
    /// observes the first still in flight.
    #[derive(Debug)]
    struct SlowProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok((
                "Title: T\nSummary: Slowly produced summary text.".to_string(),
                LlmMetadata::default(),
            ))
        }
        fn provider_name(&self) -> &str {
            "slow"
        }
        fn model_name(&self) -> &str {
            "slow"
        }
    }

    fn init_logs() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn raw_input() -> (Vec<RawEntity>, Vec<RawRelationship>) {
        let names = ["alpha", "beta", "gamma", "delta"];
        let entities = names
            .iter()
            .map(|name| RawEntity {
                id: name.to_string(),
                name: name.to_string(),
                kind: "class".to_string(),
                description: format!("the {} service", name),
                file_path: Some(format!("src/{}.rs", name)),
                line_range: None,
                language: Some("rust".to_string()),
                signature: None,
                documentation: Vec::new(),
                embedding: Vec::new(),
            })
            .collect();
        let relationships = vec![
            RawRelationship {
                source: "alpha".to_string(),
                target: "beta".to_string(),
                kind: "calls".to_string(),
                description: String::new(),
                confidence: 1.0,
            },
            RawRelationship {
                source: "beta".to_string(),
                target: "gamma".to_string(),
                kind: "calls".to_string(),
                description: String::new(),
                confidence: 1.0,
            },
            RawRelationship {
                source: "gamma".to_string(),
                target: "delta".to_string(),
                kind: "calls".to_string(),
                description: String::new(),
                confidence: 1.0,
            },
        ];
        (entities, relationships)
    }

    fn builder_with(dir: &TempDir, provider: Arc<dyn LlmProvider>) -> (GraphBuilder, Arc<GraphStore>) {
        let mut config = RepographConfig::default();
        config.detection.seed = Some(7);
        config.detection.min_community_size = 1;
        let store = Arc::new(GraphStore::open(dir.path().join("graph.redb")).unwrap());
        let engine = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            SearchConfig::default(),
        ));
        (
            GraphBuilder::new(Arc::clone(&store), engine, provider, config),
            store,
        )
    }

    #[tokio::test]
    async fn test_successful_build_reaches_ready() {
        init_logs();
        let dir = TempDir::new().unwrap();
        let (builder, store) = builder_with(&dir, Arc::new(CannedProvider));
        let (entities, relationships) = raw_input();

        let graph = builder.build("repo", entities, relationships).await.unwrap();

        assert_eq!(graph.status, GraphStatus::Ready);
        assert_eq!(graph.version, 1);
        assert_eq!(graph.metrics.entity_count, 4);
        assert!(graph.metrics.community_count > 0);
        assert!(!graph.metrics.degraded);

        let stored = store.load_graph("repo").unwrap();
        assert_eq!(stored.status, GraphStatus::Ready);
        assert!(stored.is_queryable());
    }

    /// All summarization calls timing out still yields a Ready graph;
    /// placeholders mark it degraded instead of failing the build.
    #[tokio::test]
    async fn test_all_summaries_timing_out_still_ready() {
        let dir = TempDir::new().unwrap();
        let (builder, _store) = builder_with(&dir, Arc::new(TimeoutProvider));
        let (entities, relationships) = raw_input();

        let graph = builder.build("repo", entities, relationships).await.unwrap();

        assert_eq!(graph.status, GraphStatus::Ready);
        assert!(graph.metrics.degraded);
        assert!(graph.errors.iter().any(|e| !e.fatal));
    }

    #[tokio::test]
    async fn test_concurrent_build_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(SlowProvider {
            calls: AtomicUsize::new(0),
        });
        let (builder, _store) = builder_with(&dir, provider);
        let builder = Arc::new(builder);

        let (entities, relationships) = raw_input();
        let first = {
            let builder = Arc::clone(&builder);
            let (e2, r2) = (entities.clone(), relationships.clone());
            tokio::spawn(async move { builder.build("repo", e2, r2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = builder.build("repo", entities, relationships).await;
        assert!(matches!(second, Err(RepographError::AlreadyBuilding(_))));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, GraphStatus::Ready);
    }

    #[tokio::test]
    async fn test_empty_input_marks_failed() {
        let dir = TempDir::new().unwrap();
        let (builder, store) = builder_with(&dir, Arc::new(CannedProvider));

        let err = builder.build("repo", Vec::new(), Vec::new()).await;
        assert!(matches!(err, Err(RepographError::Ingest(_))));

        let stored = store.load_graph("repo").unwrap();
        assert_eq!(stored.status, GraphStatus::Failed);
        assert!(stored.errors.iter().any(|e| e.fatal));
    }

    #[tokio::test]
    async fn test_rebuild_bumps_version() {
        let dir = TempDir::new().unwrap();
        let (builder, _store) = builder_with(&dir, Arc::new(CannedProvider));

        let (e1, r1) = raw_input();
        let v1 = builder.build("repo", e1, r1).await.unwrap();
        let (e2, r2) = raw_input();
        let v2 = builder.build("repo", e2, r2).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn test_status_for_unknown_repository() {
        let dir = TempDir::new().unwrap();
        let (builder, _store) = builder_with(&dir, Arc::new(CannedProvider));

        let graph = builder.status("unknown").unwrap();
        assert_eq!(graph.status, GraphStatus::NotBuilt);
    }

    #[tokio::test]
    async fn test_mark_stale_flags_requires_update() {
        let dir = TempDir::new().unwrap();
        let (builder, store) = builder_with(&dir, Arc::new(CannedProvider));

        let (entities, relationships) = raw_input();
        builder.build("repo", entities, relationships).await.unwrap();
        builder.mark_stale("repo").unwrap();

        let stored = store.load_graph("repo").unwrap();
        assert_eq!(stored.status, GraphStatus::RequiresUpdate);
    }
}
