//! LLM integration.
//!
//! The classifier talks to an [`LlmProvider`]; the only concrete backend is an
//! OpenAI-compatible chat completions endpoint reached over reqwest.

pub mod openai;
pub mod provider;

pub use openai::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::ClassifierConfig;
use crate::error::LlmError;

/// Create the configured LLM provider.
pub fn create_provider(config: &ClassifierConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider =
        OpenAiCompatProvider::new(&config.base_url, config.api_key.clone(), &config.model)?;
    tracing::info!(model = %config.model, endpoint = %provider.endpoint(), "Using OpenAI-compatible LLM");
    Ok(Arc::new(provider))
}
