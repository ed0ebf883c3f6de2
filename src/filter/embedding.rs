//! Remote embedding backend client.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::config::FilterConfig;
use crate::{Error, Result};

/// Client for an OpenAI-shaped `/embeddings` endpoint.
pub struct EmbeddingClient {
    http: Client,
    url: String,
    key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    /// Build from configuration; `None` when no endpoint is configured.
    #[must_use]
    pub fn from_config(config: &FilterConfig) -> Option<Self> {
        let url = config.embeddings_url.clone()?;
        Some(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url,
            key: config.resolve_embeddings_key(),
            model: config.embeddings_model.clone(),
        })
    }

    /// Embed a batch of inputs, preserving order.
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.http.post(&self.url).json(&serde_json::json!({
            "model": self.model,
            "input": inputs,
        }));
        if let Some(ref key) = self.key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Upstream {
                status: response.status().as_u16(),
                body: "embeddings endpoint rejected the request".to_string(),
            });
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Invalid embeddings response: {e}")))?;

        if body.data.len() != inputs.len() {
            return Err(Error::Transport(format!(
                "embeddings endpoint returned {} vectors for {} inputs",
                body.data.len(),
                inputs.len()
            )));
        }

        let mut items = body.data;
        items.sort_by_key(|item| item.index);
        Ok(items.into_iter().map(|item| item.embedding).collect())
    }
}

/// Cosine similarity; zero when either vector has zero norm.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![0.5, 0.5, 0.7];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite_vectors() {
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn embeddings_response_parses() {
        let json = r#"{"data":[{"index":1,"embedding":[0.2]},{"index":0,"embedding":[0.1]}]}"#;
        let parsed: EmbeddingsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 2);
    }
}
