//! Hybrid search: global and local branches fused into one answer.

use std::time::Instant;
use tracing::{info, warn};

use crate::core::config::SearchConfig;
use crate::core::error::Result;
use crate::llm::synthesis::AnswerSynthesizer;
use crate::query::engine::QueryableGraph;
use crate::query::models::{GraphQuery, QueryMode, QueryResult};
use crate::query::{global_search, local_search};

const SYSTEM_PROMPT: &str = "You are a codebase analyst. Merge the two partial answers below \
into one coherent answer: the first covers repository-wide structure, the second covers \
specific entities. Resolve overlap, keep concrete entity names, and do not introduce facts \
absent from either. End with a line 'CONFIDENCE: <0.0-1.0>'.";

/// Runs the global and local branches concurrently and fuses their
/// answers. Branch contexts and sources are carried through unchanged;
/// the reported time is the combined work, not the wall clock.
pub async fn execute(
    graph: &QueryableGraph,
    synthesizer: &AnswerSynthesizer,
    config: &SearchConfig,
    query: &GraphQuery,
) -> Result<QueryResult> {
    let start = Instant::now();

    let mut global_query = query.clone();
    global_query.mode = QueryMode::Global;
    let mut local_query = query.clone();
    local_query.mode = QueryMode::Local;

    let (global, local) = tokio::join!(
        global_search::execute(graph, synthesizer, config, &global_query),
        local_search::execute(graph, synthesizer, config, &local_query),
    );
    let global = global?;
    let local = local?;

    let confidence = global.confidence.max(local.confidence);
    let processing_time_ms = global.processing_time_ms + local.processing_time_ms;

    let answer = fuse(synthesizer, &query.text, &global, &local).await;

    let mut contexts = global.contexts;
    contexts.extend(local.contexts);
    let mut sources = global.sources;
    sources.extend(local.sources);

    let elapsed = start.elapsed().as_millis() as u64;
    info!(
        "Hybrid search answered in {}ms wall ({}ms combined, confidence={:.2})",
        elapsed, processing_time_ms, confidence
    );

    Ok(QueryResult {
        answer,
        mode: QueryMode::Hybrid,
        confidence: confidence.clamp(0.0, 1.0),
        processing_time_ms: processing_time_ms.max(elapsed),
        contexts,
        sources,
        degraded: graph.degraded,
    })
}

async fn fuse(
    synthesizer: &AnswerSynthesizer,
    query_text: &str,
    global: &QueryResult,
    local: &QueryResult,
) -> String {
    let prompt = format!(
        "Question: {}\n\nRepository-wide answer:\n{}\n\nEntity-level answer:\n{}\n",
        query_text, global.answer, local.answer
    );
    match synthesizer.synthesize(SYSTEM_PROMPT, &prompt).await {
        Ok(fused) => fused.text,
        Err(e) => {
            warn!("Hybrid fusion failed, concatenating branch answers: {}", e);
            format!("[global] {}\n[local] {}", global.answer, local.answer)
        }
    }
}
