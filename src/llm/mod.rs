pub mod factory;
pub mod providers;
pub mod synthesis;

pub use factory::LlmProviderFactory;
pub use providers::{LlmMetadata, LlmProvider, LlmProviderError, LlmProviderWithFallback};
pub use synthesis::{AnswerSynthesizer, SynthesizedAnswer, DEFAULT_CONFIDENCE};
