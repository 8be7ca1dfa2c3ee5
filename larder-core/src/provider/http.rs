//! HTTP provider for OpenAI-compatible model servers.
//!
//! Talks to `/embeddings` and `/chat/completions` on whatever base URLs the
//! configuration points at. Self-hosted inference servers (vLLM, llama.cpp,
//! LM Studio) and the hosted APIs all speak this surface, so one client
//! covers every deployment we care about.

use super::types::*;
use crate::config::{EmbeddingConfig, GeneratorConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP client implementing both provider capabilities.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    http_client: reqwest::Client,
    embedding: EmbeddingConfig,
    generator: GeneratorConfig,
}

impl HttpProvider {
    /// Creates a provider from the embedding and generator sections of the
    /// configuration.
    pub fn new(embedding: EmbeddingConfig, generator: GeneratorConfig) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            embedding,
            generator,
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Embedder for HttpProvider {
    async fn embed(&self, text: &str) -> EmbedResult<Vec<f32>> {
        let url = Self::endpoint(&self.embedding.base_url, "embeddings");

        let request = EmbeddingsRequest {
            model: self.embedding.model.clone(),
            input: text.to_string(),
        };

        let mut builder = self
            .http_client
            .post(&url)
            .json(&request)
            .timeout(Duration::from_secs(self.embedding.timeout_secs));
        if let Some(key) = &self.embedding.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbedError::Timeout
            } else {
                EmbedError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Unavailable(format!("{}: {}", status, body)));
        }

        let parsed = response
            .json::<EmbeddingsResponse>()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| EmbedError::InvalidResponse("no embedding rows returned".to_string()))?;

        if vector.len() != self.embedding.dimension {
            return Err(EmbedError::InvalidResponse(format!(
                "embedding has dimension {} but the model is configured for {}",
                vector.len(),
                self.embedding.dimension
            )));
        }

        debug!(chars = text.chars().count(), "embedded text");
        Ok(vector)
    }
}

#[async_trait]
impl Generator for HttpProvider {
    async fn generate(&self, request: &GenerationRequest) -> GenerateResult<String> {
        let url = Self::endpoint(&self.generator.base_url, "chat/completions");

        let chat_request = ChatCompletionsRequest {
            model: self.generator.model.clone(),
            messages: vec![
                WireMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                WireMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            temperature: self.generator.temperature,
            max_tokens: self.generator.max_tokens,
        };

        let mut builder = self
            .http_client
            .post(&url)
            .json(&chat_request)
            .timeout(Duration::from_secs(self.generator.timeout_secs));
        if let Some(key) = &self.generator.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerateError::Timeout
            } else {
                GenerateError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GenerateError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::Unavailable(format!("{}: {}", status, body)));
        }

        let parsed = response
            .json::<ChatCompletionsResponse>()
            .await
            .map_err(|e| GenerateError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                GenerateError::InvalidResponse("no completion choices returned".to_string())
            })?;

        debug!(chars = content.chars().count(), "received completion");
        Ok(content)
    }
}

// OpenAI-compatible request/response types (internal)

#[derive(Debug, Clone, Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_duplicate_slashes() {
        assert_eq!(
            HttpProvider::endpoint("http://localhost:8000/v1/", "embeddings"),
            "http://localhost:8000/v1/embeddings"
        );
        assert_eq!(
            HttpProvider::endpoint("http://localhost:8000/v1", "chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_embeddings_response_parses_rows() {
        let raw = r#"{"object":"list","data":[{"object":"embedding","embedding":[0.1,0.2],"index":0}],"model":"m"}"#;
        let parsed: EmbeddingsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2]);
    }

    #[test]
    fn test_chat_response_parses_first_choice_content() {
        let raw = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Simmer gently."},"finish_reason":"stop"}]}"#;
        let parsed: ChatCompletionsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Simmer gently.")
        );
    }

    #[test]
    fn test_chat_response_tolerates_missing_content() {
        let raw = r#"{"choices":[{"message":{"role":"assistant"}}]}"#;
        let parsed: ChatCompletionsResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
