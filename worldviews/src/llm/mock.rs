//! Deterministic offline provider used when no credentials are configured.

use anyhow::Result;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

pub const MOCK_MODEL: &str = "mock-gpt-4-turbo";

pub struct MockProvider;

impl MockProvider {
    /// Echo the first sentence of the user message
    pub fn reply_for(prompt: &str) -> String {
        let topic = prompt.split('.').next().unwrap_or_default().trim();
        format!(
            "Mock response for: {}. This is a simulated LLM response for development/testing purposes.",
            topic
        )
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let content = Self::reply_for(&request.prompt);
        // rough 4-chars-per-token estimate keeps the numbers stable across runs
        let prompt_tokens = (request.system.len() + request.prompt.len()) / 4;
        let completion_tokens = content.len() / 4;

        Ok(LlmResponse {
            content,
            usage: UsageMetadata::new(prompt_tokens, completion_tokens),
            model: MOCK_MODEL.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let request = LlmRequest {
            system: "sys".to_string(),
            prompt: "React to this news: Fed cuts rates. Markets rally.".to_string(),
            max_tokens: None,
            temperature: None,
        };
        let a = MockProvider.generate(request.clone()).await.unwrap();
        let b = MockProvider.generate(request).await.unwrap();

        assert_eq!(a.content, b.content);
        assert_eq!(a.usage.total_tokens, b.usage.total_tokens);
        assert!(a.content.starts_with("Mock response for: React to this news: Fed cuts rates"));
        assert_eq!(a.model, MOCK_MODEL);
    }
}
