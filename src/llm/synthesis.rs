use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::providers::base::{LlmMetadata, LlmProvider, LlmProviderError};

/// Confidence reported when the collaborator emits no usable marker.
/// A mid-point "unknown" signal, not a failure.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

lazy_static! {
    // Private contract with our providers: a trailing "CONFIDENCE: 0.8"
    // line, case insensitive.
    static ref CONFIDENCE_MARKER: Regex =
        Regex::new(r"(?im)^\s*confidence:\s*([0-9]*\.?[0-9]+)\s*$").unwrap();
}

#[derive(Debug, Clone)]
pub struct SynthesizedAnswer {
    pub text: String,
    pub confidence: f64,
    pub metadata: LlmMetadata,
}

/// Runs grounded-answer generation against the LLM provider with a hard
/// timeout, and extracts the self-reported confidence marker.
pub struct AnswerSynthesizer {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout_secs: u64) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn synthesize(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<SynthesizedAnswer, LlmProviderError> {
        let generation = self.provider.generate(system_prompt, user_prompt, None);

        let (raw, metadata) = match tokio::time::timeout(self.timeout, generation).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Generation timed out after {}s (provider={})",
                    self.timeout.as_secs(),
                    self.provider.provider_name()
                );
                return Err(LlmProviderError::Timeout(self.timeout.as_secs()));
            }
        };

        if raw.trim().is_empty() {
            return Err(LlmProviderError::Provider("empty generation".to_string()));
        }

        let (text, confidence) = parse_confidence(&raw);
        debug!(
            "Synthesized {} chars, confidence={:.2}",
            text.len(),
            confidence
        );

        Ok(SynthesizedAnswer {
            text,
            confidence,
            metadata,
        })
    }
}

/// Strips the confidence marker line from the answer and returns the
/// parsed value clamped to [0, 1]; missing or garbled markers yield
/// [`DEFAULT_CONFIDENCE`].
pub fn parse_confidence(raw: &str) -> (String, f64) {
    let confidence = CONFIDENCE_MARKER
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
        .unwrap_or(DEFAULT_CONFIDENCE);

    let text = CONFIDENCE_MARKER.replace_all(raw, "").trim().to_string();
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct CannedProvider {
        response: String,
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _response_format: Option<&str>,
        ) -> Result<(String, LlmMetadata), LlmProviderError> {
            Ok((self.response.clone(), LlmMetadata::default()))
        }

        fn provider_name(&self) -> &str {
            "canned"
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_parse_confidence_marker() {
        let (text, confidence) = parse_confidence("The auth module calls jwt.\nCONFIDENCE: 0.85");
        assert_eq!(text, "The auth module calls jwt.");
        assert!((confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_parse_confidence_case_insensitive() {
        let (_, confidence) = parse_confidence("answer\nConfidence: 0.4");
        assert!((confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_missing_marker_defaults() {
        let (text, confidence) = parse_confidence("no marker here");
        assert_eq!(text, "no marker here");
        assert!((confidence - DEFAULT_CONFIDENCE).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_marker_is_clamped() {
        let (_, confidence) = parse_confidence("answer\nCONFIDENCE: 7.5");
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_synthesize_strips_marker() {
        let synthesizer = AnswerSynthesizer::new(
            Arc::new(CannedProvider {
                response: "grounded answer\nCONFIDENCE: 0.9".to_string(),
            }),
            5,
        );
        let answer = synthesizer.synthesize("system", "user").await.unwrap();
        assert_eq!(answer.text, "grounded answer");
        assert!((answer.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_generation_is_error() {
        let synthesizer = AnswerSynthesizer::new(
            Arc::new(CannedProvider {
                response: "   ".to_string(),
            }),
            5,
        );
        assert!(synthesizer.synthesize("system", "user").await.is_err());
    }
}
