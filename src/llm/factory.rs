use std::sync::Arc;

use super::providers::base::LlmProvider;
use super::providers::fallback::LlmProviderWithFallback;
use super::providers::ollama::OllamaProvider;
use super::providers::openai::OpenAiProvider;
use crate::core::config::RepographConfig;
use crate::core::error::{RepographError, Result};

pub struct LlmProviderFactory;

impl LlmProviderFactory {
    pub fn create(
        provider: &str,
        model: &str,
        api_key: Option<&str>,
        base_url: Option<&str>,
        temperature: f64,
    ) -> Result<Arc<dyn LlmProvider>> {
        match provider {
            "openai" => Ok(Arc::new(OpenAiProvider::new(
                api_key.unwrap_or_default(),
                model,
                base_url.map(String::from),
                temperature,
            ))),
            "ollama" => Ok(Arc::new(OllamaProvider::new(
                base_url.unwrap_or(crate::DEFAULT_OLLAMA_URL),
                model,
                temperature,
            ))),
            other => Err(RepographError::Config(format!(
                "Unknown LLM provider: {other}. Supported: openai, ollama"
            ))),
        }
    }

    /// Builds the provider stack the config describes: primary wrapped with
    /// the Ollama fallback when enabled.
    pub fn from_config(config: &RepographConfig) -> Result<Arc<dyn LlmProvider>> {
        let primary = Self::create(
            &config.llm_provider,
            &config.llm_model,
            config.llm_api_key.as_deref(),
            config.llm_base_url.as_deref(),
            config.llm_temperature,
        )?;

        Ok(Arc::new(LlmProviderWithFallback::new(
            primary,
            config.llm_fallback_enabled,
            Some(config.llm_fallback_url.clone()),
            Some(config.llm_fallback_model.clone()),
            config.llm_temperature,
        )))
    }
}
