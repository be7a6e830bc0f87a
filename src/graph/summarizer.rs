use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::error::Result;
use crate::graph::model::{Community, Entity, GraphError};
use crate::llm::providers::base::LlmProvider;
use crate::utils::safe_truncate_ellipsis;

const SYSTEM_PROMPT: &str = "You are a software architecture analyst. Given a group of related \
code entities, produce a short title and a summary of what this part of the codebase does. \
Respond with exactly two lines:\nTitle: <short title>\nSummary: <2-4 sentence summary>";

/// Generates titles and summaries for detected communities.
///
/// The collaborator is treated as unreliable: any error, timeout or
/// unusable output degrades that community to a placeholder summary and a
/// recorded warning. Summarization never fails a build.
pub struct CommunitySummarizer {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
    prompt_budget: usize,
    sample_size: usize,
    concurrency: usize,
}

struct SummaryOutcome {
    community_id: String,
    title: String,
    summary: String,
    placeholder: bool,
    warning: Option<String>,
}

impl SummaryOutcome {
    /// A unit skipped because the build was cancelled before it was
    /// dequeued; the caller fills the placeholder text.
    fn cancelled(community_id: String) -> Self {
        Self {
            community_id,
            title: String::new(),
            summary: String::new(),
            placeholder: true,
            warning: None,
        }
    }
}

impl CommunitySummarizer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        timeout_secs: u64,
        prompt_budget: usize,
        sample_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(timeout_secs),
            prompt_budget,
            sample_size,
            concurrency: concurrency.max(1),
        }
    }

    /// Summarizes every community in place. Individual communities have no
    /// cross-dependency, so requests run with bounded concurrency; the
    /// cancel flag is checked between units, not mid-request.
    pub async fn summarize_all(
        &self,
        communities: &mut [Community],
        entities: &[Entity],
        cancel: &AtomicBool,
    ) -> Result<Vec<GraphError>> {
        let entity_map: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let jobs: Vec<(String, String)> = communities
            .iter()
            .map(|c| (c.id.clone(), self.build_prompt(c, &entity_map)))
            .collect();

        // The flag is re-read as each unit is dequeued, so a cancel midway
        // through the batch stops further provider calls; only requests
        // already in flight run to completion.
        let outcomes: Vec<SummaryOutcome> = stream::iter(jobs)
            .map(|(community_id, prompt)| async move {
                if cancel.load(Ordering::SeqCst) {
                    return SummaryOutcome::cancelled(community_id);
                }
                self.summarize_one(community_id, prompt).await
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut by_id: HashMap<String, SummaryOutcome> = outcomes
            .into_iter()
            .map(|o| (o.community_id.clone(), o))
            .collect();

        let mut warnings = Vec::new();
        let mut placeholders = 0usize;
        for community in communities.iter_mut() {
            match by_id.remove(&community.id) {
                Some(outcome) => {
                    if outcome.placeholder {
                        let (title, summary) = self.placeholder(community, &entity_map);
                        community.title = title;
                        community.summary = summary;
                        placeholders += 1;
                    } else {
                        community.title = outcome.title;
                        community.summary = outcome.summary;
                    }
                    community.summary_is_placeholder = outcome.placeholder;
                    if let Some(message) = outcome.warning {
                        warnings.push(GraphError::warning("summarization", message));
                    }
                }
                None => {
                    // No outcome recorded for this community; degrade it.
                    let (title, summary) = self.placeholder(community, &entity_map);
                    community.title = title;
                    community.summary = summary;
                    community.summary_is_placeholder = true;
                    placeholders += 1;
                }
            }
        }

        info!(
            "Summarized {} communities ({} placeholders)",
            communities.len(),
            placeholders
        );
        Ok(warnings)
    }

    async fn summarize_one(&self, community_id: String, prompt: String) -> SummaryOutcome {
        let generation = self.provider.generate(SYSTEM_PROMPT, &prompt, None);

        let result = match tokio::time::timeout(self.timeout, generation).await {
            Ok(Ok((text, _metadata))) => parse_summary(&text),
            Ok(Err(e)) => {
                warn!("Summarization failed for {}: {}", community_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Summarization timed out after {}s for {}",
                    self.timeout.as_secs(),
                    community_id
                );
                None
            }
        };

        match result {
            Some((title, summary)) => SummaryOutcome {
                community_id,
                title,
                summary,
                placeholder: false,
                warning: None,
            },
            None => {
                let warning = format!(
                    "community {} stored with placeholder summary",
                    community_id
                );
                SummaryOutcome {
                    community_id,
                    // Filled from member names by the caller-side fallback
                    // pass below; empty here so it is recognizable.
                    title: String::new(),
                    summary: String::new(),
                    placeholder: true,
                    warning: Some(warning),
                }
            }
        }
    }

    /// Samples the highest-ranked members into a bounded prompt. Large
    /// communities are sampled, never exhaustively enumerated.
    fn build_prompt(&self, community: &Community, entity_map: &HashMap<&str, &Entity>) -> String {
        let mut members: Vec<&Entity> = community
            .member_ids
            .iter()
            .filter_map(|id| entity_map.get(id.as_str()).copied())
            .collect();
        members.sort_by(|a, b| b.rank.partial_cmp(&a.rank).unwrap_or(std::cmp::Ordering::Equal));

        let sampled = members.len().min(self.sample_size);
        let mut prompt = format!(
            "Community of {} code entities ({} shown):\n",
            community.member_ids.len(),
            sampled
        );
        for entity in members.iter().take(self.sample_size) {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                entity.name,
                entity.kind,
                safe_truncate_ellipsis(&entity.description, 160)
            ));
        }

        debug!(
            "Built summary prompt for {} ({} chars)",
            community.id,
            prompt.len()
        );
        safe_truncate_ellipsis(&prompt, self.prompt_budget)
    }

    /// Placeholder title and summary from member names; always non-empty.
    pub fn placeholder(
        &self,
        community: &Community,
        entity_map: &HashMap<&str, &Entity>,
    ) -> (String, String) {
        placeholder_summary(community, entity_map)
    }
}

pub fn placeholder_summary(
    community: &Community,
    entity_map: &HashMap<&str, &Entity>,
) -> (String, String) {
    let names: Vec<&str> = community
        .member_ids
        .iter()
        .take(3)
        .map(|id| {
            entity_map
                .get(id.as_str())
                .map(|e| e.name.as_str())
                .unwrap_or(id.as_str())
        })
        .collect();

    let title = if names.is_empty() {
        format!("Community {}", community.id)
    } else {
        names.join(", ")
    };

    let all_names: Vec<&str> = community
        .member_ids
        .iter()
        .take(10)
        .map(|id| {
            entity_map
                .get(id.as_str())
                .map(|e| e.name.as_str())
                .unwrap_or(id.as_str())
        })
        .collect();
    let summary = format!(
        "Group of {} related code entities: {}",
        community.member_ids.len(),
        all_names.join(", ")
    );

    (title, summary)
}

/// Lenient parse of the expected "Title:"/"Summary:" response shape.
fn parse_summary(text: &str) -> Option<(String, String)> {
    let mut title = None;
    let mut summary_lines: Vec<&str> = Vec::new();
    let mut in_summary = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = strip_prefix_ci(trimmed, "title:") {
            title = Some(rest.trim().to_string());
            in_summary = false;
        } else if let Some(rest) = strip_prefix_ci(trimmed, "summary:") {
            summary_lines.push(rest.trim());
            in_summary = true;
        } else if in_summary && !trimmed.is_empty() {
            summary_lines.push(trimmed);
        }
    }

    let summary = summary_lines.join(" ").trim().to_string();
    match (title, summary.is_empty()) {
        (Some(title), false) if !title.is_empty() => Some((title, summary)),
        // A free-text answer with no structure is still usable as a
        // summary if it is non-trivial.
        (None, _) if text.trim().len() > 20 => {
            let text = text.trim();
            let title = safe_truncate_ellipsis(text.lines().next().unwrap_or(text), 60);
            Some((title, text.to_string()))
        }
        _ => None,
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::EntityKind;
    use crate::llm::providers::base::{LlmMetadata, LlmProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct CannedProvider(String);

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            Ok((self.0.clone(), LlmMetadata::default()))
        }
        fn provider_name(&self) -> &str {
            "canned"
        }
        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[derive(Debug)]
    struct FailingProvider;

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            Err(LlmProviderError::Provider("unavailable".to_string()))
        }
        fn provider_name(&self) -> &str {
            "failing"
        }
        fn model_name(&self) -> &str {
            "failing"
        }
    }

    fn entity(id: &str, rank: f64) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
            description: format!("{} description", id),
            kind: EntityKind::Class,
            text_units: Vec::new(),
            embedding: Vec::new(),
            rank,
            communities: Vec::new(),
            file_path: None,
            line_range: None,
            language: None,
            signature: None,
        }
    }

    fn community(id: &str, members: &[&str]) -> Community {
        Community::new(
            id.to_string(),
            0,
            None,
            members.iter().map(|m| m.to_string()).collect(),
        )
    }

    #[test]
    fn test_parse_structured_response() {
        let parsed = parse_summary("Title: Auth layer\nSummary: Handles login and tokens.");
        let (title, summary) = parsed.unwrap();
        assert_eq!(title, "Auth layer");
        assert_eq!(summary, "Handles login and tokens.");
    }

    #[test]
    fn test_parse_unstructured_response_is_salvaged() {
        let parsed =
            parse_summary("This community groups the billing pipeline and invoice models.");
        assert!(parsed.is_some());
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(parse_summary("").is_none());
        assert!(parse_summary("ok").is_none());
    }

    #[tokio::test]
    async fn test_summarize_all_happy_path() {
        let summarizer = CommunitySummarizer::new(
            Arc::new(CannedProvider(
                "Title: Payments\nSummary: Payment processing entities.".to_string(),
            )),
            5,
            4000,
            20,
            2,
        );
        let entities = vec![entity("a", 0.9), entity("b", 0.5)];
        let mut communities = vec![community("com-0-0", &["a", "b"])];
        let cancel = AtomicBool::new(false);

        let warnings = summarizer
            .summarize_all(&mut communities, &entities, &cancel)
            .await
            .unwrap();

        assert!(warnings.is_empty());
        assert_eq!(communities[0].title, "Payments");
        assert!(!communities[0].summary_is_placeholder);
    }

    #[tokio::test]
    async fn test_failing_collaborator_degrades_not_fails() {
        let summarizer = CommunitySummarizer::new(Arc::new(FailingProvider), 5, 4000, 20, 2);
        let entities = vec![entity("a", 0.9)];
        let mut communities = vec![community("com-0-0", &["a"])];
        let cancel = AtomicBool::new(false);

        let warnings = summarizer
            .summarize_all(&mut communities, &entities, &cancel)
            .await
            .unwrap();

        assert_eq!(warnings.len(), 1);
        assert!(communities[0].summary_is_placeholder);
        assert!(!communities[0].summary.is_empty());
        assert!(!communities[0].title.is_empty());
    }

    /// Sets the cancel flag from inside its first generation, so every
    /// later unit observes it when dequeued.
    #[derive(Debug)]
    struct CancellingProvider {
        cancel: Arc<AtomicBool>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CancellingProvider {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _format: Option<&str>,
        ) -> std::result::Result<(String, LlmMetadata), LlmProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.store(true, Ordering::SeqCst);
            Ok((
                "Title: First\nSummary: Completed before the cancel landed.".to_string(),
                LlmMetadata::default(),
            ))
        }
        fn provider_name(&self) -> &str {
            "cancelling"
        }
        fn model_name(&self) -> &str {
            "cancelling"
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_remaining_units() {
        let cancel = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(CancellingProvider {
            cancel: Arc::clone(&cancel),
            calls: AtomicUsize::new(0),
        });
        let summarizer =
            CommunitySummarizer::new(Arc::clone(&provider) as Arc<dyn LlmProvider>, 5, 4000, 20, 1);

        let entities: Vec<Entity> = (0..5).map(|i| entity(&format!("e{}", i), 0.5)).collect();
        let mut communities: Vec<Community> = (0..5)
            .map(|i| {
                Community::new(
                    format!("com-0-{}", i),
                    0,
                    None,
                    vec![format!("e{}", i)],
                )
            })
            .collect();

        summarizer
            .summarize_all(&mut communities, &entities, &cancel)
            .await
            .unwrap();

        // Only the unit already in flight reached the collaborator; the
        // rest were skipped at dequeue and degraded to placeholders.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let placeholders = communities
            .iter()
            .filter(|c| c.summary_is_placeholder)
            .count();
        assert_eq!(placeholders, 4);
        assert!(communities.iter().all(|c| !c.summary.is_empty()));
    }

    #[test]
    fn test_prompt_is_bounded() {
        let summarizer = CommunitySummarizer::new(Arc::new(FailingProvider), 5, 200, 5, 1);
        let entities: Vec<Entity> = (0..100).map(|i| entity(&format!("e{}", i), 0.5)).collect();
        let ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
        let com = community("com-0-0", &ids);
        let entity_map: HashMap<&str, &Entity> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let prompt = summarizer.build_prompt(&com, &entity_map);
        assert!(prompt.chars().count() <= 203);
    }
}
