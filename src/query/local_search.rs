//! Entity-neighborhood search for questions about specific code constructs.

use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::core::config::SearchConfig;
use crate::core::error::{RepographError, Result};
use crate::graph::model::{Entity, Relationship};
use crate::llm::synthesis::{AnswerSynthesizer, DEFAULT_CONFIDENCE};
use crate::query::engine::QueryableGraph;
use crate::query::keyword::{match_score, tokenize};
use crate::query::models::{
    ContextFragment, ContextKind, GraphQuery, QueryMode, QueryResult, SourceAttribution,
};
use crate::utils::safe_truncate_ellipsis;

const SYSTEM_PROMPT: &str = "You are a codebase analyst answering a question about specific \
code entities. Ground your answer strictly in the entity and relationship descriptions \
provided; cite entity names rather than inventing new ones. End your answer with a line \
'CONFIDENCE: <0.0-1.0>' reflecting how well the context covers the question.";

const SNIPPET_BUDGET: usize = 300;

/// Resolves seed entities, expands their relationship neighborhood and
/// synthesizes an answer over the assembled context.
pub async fn execute(
    graph: &QueryableGraph,
    synthesizer: &AnswerSynthesizer,
    config: &SearchConfig,
    query: &GraphQuery,
) -> Result<QueryResult> {
    let start = Instant::now();
    let query_tokens = tokenize(&query.text);

    let seeds = resolve_seeds(graph, config, query, &query_tokens)?;
    debug!(
        "Local search seeded with {:?}",
        seeds.iter().map(|e| e.id.as_str()).collect::<Vec<_>>()
    );

    let seed_ids: Vec<&str> = seeds.iter().map(|e| e.id.as_str()).collect();
    let network = graph.entity_network(&seed_ids, config.local_depth)?;

    let (contexts, sources) = assemble_context(graph, config, query, &query_tokens, &seeds, &network);

    let (answer, confidence) = if contexts.is_empty() {
        (
            "No entities in the graph matched the question.".to_string(),
            0.0,
        )
    } else {
        synthesize(synthesizer, &query.text, &contexts).await
    };

    let confidence = if graph.degraded {
        confidence.min(config.degraded_confidence_cap)
    } else {
        confidence
    };

    let elapsed = start.elapsed().as_millis() as u64;
    info!(
        "Local search answered in {}ms (seeds={}, contexts={}, confidence={:.2})",
        elapsed,
        seeds.len(),
        contexts.len(),
        confidence
    );

    Ok(QueryResult {
        answer,
        mode: QueryMode::Local,
        confidence: confidence.clamp(0.0, 1.0),
        processing_time_ms: elapsed,
        contexts,
        sources,
        degraded: graph.degraded,
    })
}

/// An explicit focus entity must exist; without one the best keyword
/// matches across names and descriptions seed the walk.
fn resolve_seeds<'a>(
    graph: &'a QueryableGraph,
    config: &SearchConfig,
    query: &GraphQuery,
    query_tokens: &[String],
) -> Result<Vec<&'a Entity>> {
    if let Some(focus_id) = &query.focus_entity_id {
        let entity = graph
            .entity(focus_id)
            .ok_or_else(|| RepographError::EntityNotFound(focus_id.clone()))?;
        return Ok(vec![entity]);
    }

    let mut scored: Vec<(&Entity, f64)> = graph
        .candidates_for(&query.text)
        .into_iter()
        .map(|entity| {
            let text = format!("{} {}", entity.name, entity.description);
            let matched = match_score(
                query_tokens,
                &text,
                query.embedding.as_deref(),
                &entity.embedding,
            );
            let score = config.local_match_weight * matched
                + config.local_rank_weight * entity.rank.clamp(0.0, 1.0);
            (entity, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(config.local_seed_count);
    Ok(scored.into_iter().map(|(entity, _)| entity).collect())
}

fn assemble_context(
    graph: &QueryableGraph,
    config: &SearchConfig,
    query: &GraphQuery,
    query_tokens: &[String],
    seeds: &[&Entity],
    network: &HashMap<String, Vec<Relationship>>,
) -> (Vec<ContextFragment>, Vec<SourceAttribution>) {
    let mut contexts = Vec::new();
    let mut sources = Vec::new();
    let mut described: Vec<&str> = Vec::new();

    for seed in seeds {
        push_entity(config, query, query_tokens, seed, &mut contexts, &mut sources);
        described.push(seed.id.as_str());

        for rel in network.get(&seed.id).into_iter().flatten() {
            contexts.push(ContextFragment {
                kind: ContextKind::RelationshipDescription,
                source_id: rel.id.clone(),
                content: format!("{} -[{}]-> {}: {}", rel.source, rel.kind, rel.target, rel.description),
                relevance: rel.weight.clamp(0.0, 1.0),
            });
            for endpoint in [rel.source.as_str(), rel.target.as_str()] {
                if !described.contains(&endpoint) {
                    if let Some(entity) = graph.entity(endpoint) {
                        push_entity(
                            config,
                            query,
                            query_tokens,
                            entity,
                            &mut contexts,
                            &mut sources,
                        );
                        described.push(endpoint);
                    }
                }
            }
        }
    }

    contexts.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    sources.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    (contexts, sources)
}

fn push_entity(
    config: &SearchConfig,
    query: &GraphQuery,
    query_tokens: &[String],
    entity: &Entity,
    contexts: &mut Vec<ContextFragment>,
    sources: &mut Vec<SourceAttribution>,
) {
    let text = format!("{} {}", entity.name, entity.description);
    let matched = match_score(
        query_tokens,
        &text,
        query.embedding.as_deref(),
        &entity.embedding,
    );
    let relevance = (config.local_match_weight * matched
        + config.local_rank_weight * entity.rank.clamp(0.0, 1.0))
    .clamp(0.0, 1.0);

    let mut content = format!("{} ({}): {}", entity.name, entity.kind, entity.description);
    if let Some(signature) = &entity.signature {
        content.push_str(&format!(" Signature: {}", signature));
    }
    contexts.push(ContextFragment {
        kind: ContextKind::EntityDescription,
        source_id: entity.id.clone(),
        content,
        relevance,
    });

    if query.include_sources {
        if let Some(file_path) = &entity.file_path {
            let snippet = entity
                .text_units
                .first()
                .map(|unit| safe_truncate_ellipsis(&unit.text, SNIPPET_BUDGET))
                .unwrap_or_else(|| entity.description.clone());
            sources.push(SourceAttribution {
                entity_id: entity.id.clone(),
                file_path: file_path.clone(),
                line_range: entity.line_range,
                snippet,
                relevance,
            });
        }
    }
}

async fn synthesize(
    synthesizer: &AnswerSynthesizer,
    query_text: &str,
    contexts: &[ContextFragment],
) -> (String, f64) {
    let mut prompt = format!("Question: {}\n\nContext:\n", query_text);
    for fragment in contexts {
        prompt.push_str(&format!("- ({}) {}\n", fragment.kind, fragment.content));
    }

    match synthesizer.synthesize(SYSTEM_PROMPT, &prompt).await {
        Ok(answer) => (answer.text, answer.confidence),
        Err(e) => {
            tracing::warn!("Local synthesis failed, answering from context: {}", e);
            let fallback = contexts
                .iter()
                .map(|fragment| fragment.content.clone())
                .collect::<Vec<_>>()
                .join("\n");
            (fallback, DEFAULT_CONFIDENCE)
        }
    }
}
