//! Community-level search for broad, architectural questions.

use std::time::Instant;
use tracing::{debug, info};

use crate::core::config::SearchConfig;
use crate::core::error::Result;
use crate::graph::model::Community;
use crate::llm::synthesis::{AnswerSynthesizer, DEFAULT_CONFIDENCE};
use crate::query::engine::QueryableGraph;
use crate::query::keyword::{keyword_overlap, tokenize};
use crate::query::models::{ContextFragment, ContextKind, GraphQuery, QueryMode, QueryResult};

const SYSTEM_PROMPT: &str = "You are a codebase analyst answering a broad question about a \
repository. Ground your answer strictly in the community reports provided; do not invent \
components that are not described. End your answer with a line 'CONFIDENCE: <0.0-1.0>' \
reflecting how well the reports cover the question.";

struct ScoredCommunity<'a> {
    community: &'a Community,
    score: f64,
}

/// Ranks community reports against the query and synthesizes a single
/// answer from the top selection.
pub async fn execute(
    graph: &QueryableGraph,
    synthesizer: &AnswerSynthesizer,
    config: &SearchConfig,
    query: &GraphQuery,
) -> Result<QueryResult> {
    let start = Instant::now();
    let query_tokens = tokenize(&query.text);

    let selected = select_communities(graph, config, &query_tokens);
    debug!(
        "Global search selected {} of {} communities",
        selected.len(),
        graph.communities().count()
    );

    let contexts: Vec<ContextFragment> = selected
        .iter()
        .map(|sc| ContextFragment {
            kind: ContextKind::CommunityReport,
            source_id: sc.community.id.clone(),
            content: format!("{}: {}", sc.community.title, sc.community.summary),
            relevance: sc.score,
        })
        .collect();

    let (answer, confidence) = if selected.is_empty() {
        (
            "No community reports matched the question.".to_string(),
            0.0,
        )
    } else {
        synthesize(synthesizer, &query.text, &selected).await
    };

    let confidence = if graph.degraded {
        confidence.min(config.degraded_confidence_cap)
    } else {
        confidence
    };

    let elapsed = start.elapsed().as_millis() as u64;
    info!(
        "Global search answered in {}ms (confidence={:.2}, {} contexts)",
        elapsed,
        confidence,
        contexts.len()
    );

    Ok(QueryResult {
        answer,
        mode: QueryMode::Global,
        confidence: confidence.clamp(0.0, 1.0),
        processing_time_ms: elapsed,
        contexts,
        sources: Vec::new(),
        degraded: graph.degraded,
    })
}

/// Combined relevance: keyword overlap against title+summary weighted with
/// the community's stored rank. Ties break toward the coarser level; broad
/// questions are better served by broader communities.
fn select_communities<'a>(
    graph: &'a QueryableGraph,
    config: &SearchConfig,
    query_tokens: &[String],
) -> Vec<ScoredCommunity<'a>> {
    let mut scored: Vec<ScoredCommunity<'a>> = graph
        .communities()
        .map(|community| {
            let text = format!("{} {}", community.title, community.summary);
            let text_relevance = keyword_overlap(query_tokens, &text);
            let score = config.global_text_weight * text_relevance
                + config.global_rank_weight * community.rank.clamp(0.0, 1.0);
            ScoredCommunity { community, score }
        })
        .filter(|sc| sc.score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.community.level.cmp(&b.community.level))
    });
    scored.truncate(config.global_top_k);
    scored
}

async fn synthesize(
    synthesizer: &AnswerSynthesizer,
    query_text: &str,
    selected: &[ScoredCommunity<'_>],
) -> (String, f64) {
    let mut prompt = format!("Question: {}\n\nCommunity reports:\n", query_text);
    for sc in selected {
        prompt.push_str(&format!(
            "- [{}] {}: {}\n",
            sc.community.id, sc.community.title, sc.community.summary
        ));
    }

    match synthesizer.synthesize(SYSTEM_PROMPT, &prompt).await {
        Ok(answer) => (answer.text, answer.confidence),
        Err(e) => {
            // The reports themselves are still a usable, clearly-degraded
            // answer; never fail the query over a collaborator outage.
            tracing::warn!("Global synthesis failed, answering from reports: {}", e);
            let fallback = selected
                .iter()
                .map(|sc| format!("{}: {}", sc.community.title, sc.community.summary))
                .collect::<Vec<_>>()
                .join("\n");
            (fallback, DEFAULT_CONFIDENCE)
        }
    }
}
