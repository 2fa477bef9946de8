//! Embeddings over an OpenAI-compatible `/embeddings` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use quill_config::AppConfig;
use quill_core::error::IndexError;
use quill_core::index::Embedder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::router::default_base_url;

pub struct OpenAiEmbedder {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        }
    }

    /// Embedder for the configured embedding provider.
    pub fn from_config(config: &AppConfig) -> Self {
        let provider = &config.index.embedding_provider;
        let base_url = config
            .providers
            .get(provider)
            .and_then(|p| p.api_url.clone())
            .unwrap_or_else(|| default_base_url(provider));
        Self::new(
            base_url,
            config.api_key_for(provider).unwrap_or_default(),
            &config.index.embedding_model,
        )
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %self.model, count = texts.len(), "Sending embedding request");

        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        });
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IndexError::EmbeddingFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Embedding request failed");
            return Err(IndexError::EmbeddingFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| IndexError::EmbeddingFailed(format!("bad embedding response: {e}")))?;
        Ok(parsed.into_vectors())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Vectors in input order.
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        if self.data.iter().all(|d| d.index.is_some()) {
            self.data.sort_by_key(|d| d.index);
        }
        self.data.into_iter().map(|d| d.embedding).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_reordered_by_index() {
        let json = r#"{"object":"list","data":[
            {"object":"embedding","index":1,"embedding":[0.0,1.0]},
            {"object":"embedding","index":0,"embedding":[1.0,0.0]}
        ],"model":"text-embedding-3-small"}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.into_vectors(), vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn from_config_uses_embedding_provider() {
        let config = AppConfig::default();
        let embedder = OpenAiEmbedder::from_config(&config);
        assert_eq!(embedder.name(), config.index.embedding_model);
        assert!(embedder.base_url.contains("openai.com"));
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let embedder = OpenAiEmbedder::new("http://127.0.0.1:9", "", "m");
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }
}
