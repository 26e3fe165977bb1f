//! LLM integration.
//!
//! The inference service is consumed through the `LlmProvider` trait;
//! the only shipped implementation is the native Anthropic Messages API
//! client. Two provider instances run side by side: a **main** tier for
//! user-facing replies and a **fast** tier for auxiliary calls
//! (checkins, commitment extraction, deep pattern scans).

pub mod anthropic;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::*;

use std::sync::Arc;

use secrecy::SecretString;

/// Model tier selection for `create_provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Main conversational model.
    Main,
    /// Cheaper model for background and scheduled calls.
    Fast,
}

/// Configuration for creating LLM providers.
#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model_main: String,
    pub model_fast: String,
}

/// Create a provider for the given tier.
pub fn create_provider(config: &LlmConfig, tier: ModelTier) -> Arc<dyn LlmProvider> {
    let model = match tier {
        ModelTier::Main => &config.model_main,
        ModelTier::Fast => &config.model_fast,
    };
    tracing::info!(model = %model, tier = ?tier, "Using Anthropic provider");
    Arc::new(AnthropicProvider::new(config.api_key.clone(), model.as_str()))
}
