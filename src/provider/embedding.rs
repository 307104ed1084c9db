//! Text-embedding capability, grounded on the Bailian embeddings API shape.

use crate::provider::language_model::ProviderError;
use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds non-empty text into a vector of the configured dimension.
    /// Callers must filter empty input before calling — it is not a legal
    /// request.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

pub struct BailianEmbeddingProvider {
    client: reqwest::Client,
    api_endpoint: String,
    api_key: String,
    model_code: String,
    dimension: usize,
}

impl BailianEmbeddingProvider {
    pub fn new(api_endpoint: String, api_key: String, model_code: String, dimension: usize) -> Self {
        Self { client: reqwest::Client::new(), api_endpoint, api_key, model_code, dimension }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    input: Input<'a>,
    parameters: Parameters,
}

#[derive(Serialize)]
struct Input<'a> {
    texts: Vec<&'a str>,
}

#[derive(Serialize)]
struct Parameters {
    dimensions: usize,
}

#[derive(Deserialize)]
struct Response {
    output: Output,
}

#[derive(Deserialize)]
struct Output {
    embeddings: Vec<Embedding>,
}

#[derive(Deserialize)]
struct Embedding {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for BailianEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = Request {
            model: &self.model_code,
            input: Input { texts: vec![text] },
            parameters: Parameters { dimensions: self.dimension },
        };

        let response = self
            .client
            .post(&self.api_endpoint)
            .bearer_auth(&self.api_key)
            .header("X-DashScope-SSE", "disable")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let parsed: Response = response.json().await.map_err(ProviderError::Network)?;
        parsed
            .output
            .embeddings
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or(ProviderError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_configured_dimension() {
        let req = Request { model: "text-embedding-v4", input: Input { texts: vec!["hi"] }, parameters: Parameters { dimensions: 1536 } };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["parameters"]["dimensions"], 1536);
        assert_eq!(json["input"]["texts"][0], "hi");
    }
}
