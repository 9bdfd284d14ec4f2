//! Uniform chat capability over an ordered primary -> fallback provider chain.

use anyhow::Result;
use common::{LlmConfig, ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::anthropic::AnthropicProvider;
use super::mock::MockProvider;
use super::remote::RemoteLlmProvider;
use super::{LlmError, LlmProvider, LlmRequest};

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4-turbo-preview";
const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-sonnet-20240229";

/// Output of one chat call. Also the cache payload: identical whether freshly
/// generated or replayed from the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub text: String,
    pub model_name: String,
    /// input + output tokens reported by the provider that answered
    pub tokens_used: u64,
    pub elapsed_ms: u64,
    pub provider_id: String,
}

pub struct ProviderClient {
    chain: Vec<Arc<dyn LlmProvider>>,
    mock: MockProvider,
}

impl ProviderClient {
    pub fn new(
        primary: Option<Arc<dyn LlmProvider>>,
        fallback: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            chain: primary.into_iter().chain(fallback).collect(),
            mock: MockProvider,
        }
    }

    /// Client with no credentials: every call answers from the mock provider
    pub fn mock() -> Self {
        Self::new(None, None)
    }

    /// Build the chain from config. `lookup_key` resolves the env var *name* found in the
    /// config to a key; providers whose key is missing are left out of the chain.
    pub fn from_config(config: &LlmConfig, lookup_key: impl Fn(&str) -> Option<String>) -> Self {
        let build = |cfg: &Option<ProviderConfig>| -> Option<Arc<dyn LlmProvider>> {
            let cfg = cfg.as_ref()?;
            let key = match cfg.api_key_env.as_deref().and_then(&lookup_key) {
                Some(key) if !key.trim().is_empty() => key,
                _ => {
                    warn!(kind = ?cfg.kind, "no API key available for provider, skipping it");
                    return None;
                }
            };
            Some(build_provider(cfg, key))
        };

        let client = Self::new(build(&config.primary), build(&config.fallback));
        if client.is_mock() {
            info!("no provider credentials configured, generation will use mock responses");
        }
        client
    }

    pub fn is_mock(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.chain.iter().map(|p| p.id().to_string()).collect()
    }

    /// Try the primary, then exactly one fallback. A timeout counts as a failure.
    /// Returns `LlmError::AllProvidersFailed` when the chain is exhausted.
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        timeout: Duration,
    ) -> Result<Generation> {
        let request = LlmRequest {
            system: system.to_string(),
            prompt: user.to_string(),
            max_tokens: Some(max_tokens),
            temperature: None,
        };

        if self.chain.is_empty() {
            return attempt(&self.mock, request, timeout).await;
        }

        let mut last_error = None;
        for provider in &self.chain {
            match attempt(provider.as_ref(), request.clone(), timeout).await {
                Ok(generation) => return Ok(generation),
                Err(e) => {
                    warn!(provider = provider.id(), error = %format!("{:#}", e), "provider failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "no provider attempted".to_string());
        Err(LlmError::AllProvidersFailed(reason).into())
    }
}

async fn attempt<P: LlmProvider + ?Sized>(
    provider: &P,
    request: LlmRequest,
    timeout: Duration,
) -> Result<Generation> {
    info!(provider = provider.id(), "generating");
    let start = Instant::now();

    let response = tokio::time::timeout(timeout, provider.generate(request))
        .await
        .map_err(|_| LlmError::Timeout {
            provider: provider.id().to_string(),
            seconds: timeout.as_secs(),
        })??;

    Ok(Generation {
        text: response.content,
        model_name: response.model,
        tokens_used: response.usage.total_tokens as u64,
        elapsed_ms: start.elapsed().as_millis() as u64,
        provider_id: provider.id().to_string(),
    })
}

/// Instantiate a provider from its config block
pub fn build_provider(cfg: &ProviderConfig, api_key: String) -> Arc<dyn LlmProvider> {
    let temperature = cfg.temperature.unwrap_or(0.7);
    match cfg.kind {
        ProviderKind::Openai => Arc::new(
            RemoteLlmProvider::new(
                cfg.api_url.clone().unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
                api_key,
                cfg.model.clone().unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            )
            .with_defaults(120, 500, temperature),
        ),
        ProviderKind::Anthropic => Arc::new(
            AnthropicProvider::new(
                cfg.api_url.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.to_string()),
                api_key,
                cfg.model.clone().unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            )
            .with_defaults(120, 500, temperature),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, UsageMetadata};

    struct Failing(&'static str);

    #[async_trait::async_trait]
    impl LlmProvider for Failing {
        fn id(&self) -> &str {
            self.0
        }
        async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
            anyhow::bail!("{} is down", self.0)
        }
    }

    struct Answering(&'static str);

    #[async_trait::async_trait]
    impl LlmProvider for Answering {
        fn id(&self) -> &str {
            self.0
        }
        async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
            Ok(LlmResponse {
                content: format!("answer from {}", self.0),
                usage: UsageMetadata::new(20, 10),
                model: format!("{}-model", self.0),
            })
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl LlmProvider for Slow {
        fn id(&self) -> &str {
            "slow"
        }
        async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::bail!("unreachable")
        }
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn primary_answers_and_tokens_are_summed() {
        let client = ProviderClient::new(Some(Arc::new(Answering("openai"))), None);
        let g = client.chat("sys", "hello", 100, T).await.unwrap();
        assert_eq!(g.provider_id, "openai");
        assert_eq!(g.tokens_used, 30);
        assert_eq!(g.model_name, "openai-model");
    }

    #[tokio::test]
    async fn falls_back_once_to_secondary() {
        let client = ProviderClient::new(
            Some(Arc::new(Failing("openai"))),
            Some(Arc::new(Answering("anthropic"))),
        );
        let g = client.chat("sys", "hello", 100, T).await.unwrap();
        assert_eq!(g.provider_id, "anthropic");
        assert_eq!(g.text, "answer from anthropic");
    }

    #[tokio::test]
    async fn both_failing_is_terminal() {
        let client = ProviderClient::new(
            Some(Arc::new(Failing("openai"))),
            Some(Arc::new(Failing("anthropic"))),
        );
        let err = client.chat("sys", "hello", 100, T).await.unwrap_err();
        match err.downcast_ref::<LlmError>() {
            Some(LlmError::AllProvidersFailed(reason)) => assert!(reason.contains("anthropic")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn timed_out_primary_triggers_fallback() {
        let client = ProviderClient::new(
            Some(Arc::new(Slow)),
            Some(Arc::new(Answering("anthropic"))),
        );
        let g = client
            .chat("sys", "hello", 100, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(g.provider_id, "anthropic");
    }

    #[tokio::test]
    async fn no_credentials_means_mock() {
        let client = ProviderClient::mock();
        assert!(client.is_mock());
        let g = client
            .chat("sys", "Tesla unveils battery. More text.", 100, T)
            .await
            .unwrap();
        assert_eq!(g.provider_id, "mock");
        assert!(g.text.contains("Tesla unveils battery"));
    }

    #[test]
    fn from_config_skips_providers_without_keys() {
        let cfg: LlmConfig = toml::from_str(
            r#"
            [primary]
            kind = "openai"
            api_key_env = "OPENAI_API_KEY"

            [fallback]
            kind = "anthropic"
            api_key_env = "ANTHROPIC_API_KEY"
            "#,
        )
        .unwrap();

        let client = ProviderClient::from_config(&cfg, |name| {
            (name == "ANTHROPIC_API_KEY").then(|| "sk-ant".to_string())
        });
        assert_eq!(client.provider_ids(), vec!["anthropic".to_string()]);

        let none = ProviderClient::from_config(&cfg, |_| None);
        assert!(none.is_mock());
    }
}
