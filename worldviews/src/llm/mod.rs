use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Core trait for text-generation backends
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider id recorded with every generation ("openai", "anthropic", ...)
    fn id(&self) -> &str;

    /// Generate a completion for a system instruction + user message
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl UsageMetadata {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Failures at the provider seam. Everything else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider} request timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },

    /// Terminal: primary and fallback both failed. Not retried inside the client.
    #[error("all LLM providers failed: {0}")]
    AllProvidersFailed(String),
}

pub mod anthropic;
pub mod client;
pub mod mock;
pub mod remote;

pub use client::{Generation, ProviderClient};
