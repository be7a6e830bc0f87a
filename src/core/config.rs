use serde::{Deserialize, Serialize};

/// Top-level configuration for graph construction and querying.
///
/// Everything has a working default; `from_env` applies `REPOGRAPH_*`
/// overrides for deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepographConfig {
    /// Path of the redb database file backing the graph store.
    pub store_path: String,
    /// Store write retry attempts before a build is marked failed.
    pub store_max_retries: u32,
    /// Initial backoff between store retries, in milliseconds.
    pub store_retry_delay_ms: u64,

    pub llm_provider: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_temperature: f64,
    /// Timeout applied to every text-generation call, in seconds.
    pub llm_timeout_secs: u64,

    pub llm_fallback_enabled: bool,
    pub llm_fallback_url: String,
    pub llm_fallback_model: String,

    pub detection: DetectionConfig,

    /// Character budget for a single community-summary prompt.
    pub summary_prompt_budget: usize,
    /// Member entities sampled into a summary prompt, by rank.
    pub summary_sample_size: usize,
    /// Concurrent summarization requests within one build.
    pub summary_concurrency: usize,

    /// Simultaneous builds across repositories.
    pub max_concurrent_builds: usize,

    pub search: SearchConfig,
}

/// Community-detection parameters, frozen into the aggregate at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Hierarchy depth; levels run `0..max_levels`.
    pub max_levels: u32,
    /// Communities below this size are merged into their strongest neighbor.
    pub min_community_size: usize,
    /// Entities ranked below this are excluded from recursion beyond level 0.
    pub entity_rank_threshold: f64,
    /// Modularity resolution; higher yields more communities.
    pub resolution: f64,
    /// Local-moving iterations per clustering pass.
    pub max_iterations: usize,
    /// Seed for the visit-order shuffle; `None` means entropy-seeded.
    pub seed: Option<u64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_levels: 3,
            min_community_size: 5,
            entity_rank_threshold: 0.1,
            resolution: 1.0,
            max_iterations: 50,
            seed: None,
        }
    }
}

/// Query-side knobs shared by global, local and hybrid search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Communities selected for global synthesis.
    pub global_top_k: usize,
    /// Weight of keyword relevance in the global community score.
    pub global_text_weight: f64,
    /// Weight of stored community rank in the global community score.
    pub global_rank_weight: f64,

    /// Seed entities derived from the query when no focus entity is given.
    pub local_seed_count: usize,
    /// Neighborhood traversal depth for local search.
    pub local_depth: usize,
    /// Weight of query match in the local entity score.
    pub local_match_weight: f64,
    /// Weight of entity rank in the local entity score.
    pub local_rank_weight: f64,

    /// Relationship ceiling per traversal seed.
    pub max_network_relationships: usize,
    /// Confidence ceiling applied when the graph carries placeholder summaries.
    pub degraded_confidence_cap: f64,

    pub cache_size: usize,
    pub cache_ttl_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            global_top_k: 10,
            global_text_weight: 0.7,
            global_rank_weight: 0.3,
            local_seed_count: 5,
            local_depth: 2,
            local_match_weight: 0.6,
            local_rank_weight: 0.4,
            max_network_relationships: 100,
            degraded_confidence_cap: 0.6,
            cache_size: crate::DEFAULT_CACHE_SIZE,
            cache_ttl_secs: crate::DEFAULT_CACHE_TTL,
        }
    }
}

impl RepographConfig {
    pub fn new(store_path: &str) -> Self {
        Self {
            store_path: store_path.to_string(),
            store_max_retries: 3,
            store_retry_delay_ms: 100,

            llm_provider: "openai".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            llm_api_key: None,
            llm_base_url: None,
            llm_temperature: 0.3,
            llm_timeout_secs: 60,

            llm_fallback_enabled: true,
            llm_fallback_url: crate::DEFAULT_OLLAMA_URL.to_string(),
            llm_fallback_model: crate::DEFAULT_LLM_MODEL.to_string(),

            detection: DetectionConfig::default(),

            summary_prompt_budget: 4000,
            summary_sample_size: 20,
            summary_concurrency: 4,

            max_concurrent_builds: 4,

            search: SearchConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::new(
            &std::env::var("REPOGRAPH_STORE_PATH")
                .unwrap_or_else(|_| "repograph.redb".to_string()),
        );

        if let Ok(provider) = std::env::var("REPOGRAPH_LLM_PROVIDER") {
            config.llm_provider = provider;
        }
        if let Ok(model) = std::env::var("REPOGRAPH_LLM_MODEL") {
            config.llm_model = model;
        }
        if let Ok(key) = std::env::var("REPOGRAPH_LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("REPOGRAPH_LLM_BASE_URL") {
            config.llm_base_url = Some(url);
        }
        if let Ok(levels) = std::env::var("REPOGRAPH_MAX_LEVELS") {
            if let Ok(levels) = levels.parse() {
                config.detection.max_levels = levels;
            }
        }
        if let Ok(size) = std::env::var("REPOGRAPH_MIN_COMMUNITY_SIZE") {
            if let Ok(size) = size.parse() {
                config.detection.min_community_size = size;
            }
        }
        if let Ok(builds) = std::env::var("REPOGRAPH_MAX_CONCURRENT_BUILDS") {
            if let Ok(builds) = builds.parse() {
                config.max_concurrent_builds = builds;
            }
        }

        config
    }
}

impl Default for RepographConfig {
    fn default() -> Self {
        Self::new("repograph.redb")
    }
}
