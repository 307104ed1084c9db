//! Two standalone RAG operations that compose the embedding and
//! vector-store capabilities directly, bypassing the chat orchestrator's
//! probe fan-out: a one-shot vector search and a raw text-to-vector call.
//!
//! Grounded on `vectorsearchlogic.go` and `vectorizetextlogic.go`: both
//! treat input validation failures as a normal, successful response rather
//! than an error — an empty search query yields an empty result set, and
//! an unembeddable text yields an error message folded into the response.

use crate::config::AppConfig;
use crate::provider::{EmbeddingProvider, VectorStoreProvider};
use crate::scene::SceneResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The original leaves this as a literal zero with a TODO to fill it in;
/// measuring it for real here is a strict improvement, not a deviation.
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub vector: Option<Vec<f32>>,
    pub metadata: HashMap<String, String>,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchOutcome {
    pub results: Vec<VectorSearchResult>,
    pub total_count: usize,
    pub search_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct VectorizeOutcome {
    pub vector: Vec<f32>,
    pub error: Option<String>,
}

const DEFAULT_TOP_K: usize = 10;
const DEFAULT_MIN_SCORE: f32 = 0.0;

fn matches_filters(metadata: &HashMap<String, String>, filters: Option<&HashMap<String, String>>) -> bool {
    match filters {
        None => true,
        Some(filters) => filters.iter().all(|(key, value)| metadata.get(key) == Some(value)),
    }
}

/// Composes `EmbeddingProvider::embed` and `VectorStoreProvider::search`
/// into the two ad hoc RAG operations, independent of any chat session.
pub struct VectorSearchService {
    scenes: Arc<SceneResolver>,
    vector_store: Arc<dyn VectorStoreProvider>,
    config: Arc<AppConfig>,
    default_embedder: Arc<dyn EmbeddingProvider>,
}

impl VectorSearchService {
    pub fn new(
        scenes: Arc<SceneResolver>,
        vector_store: Arc<dyn VectorStoreProvider>,
        config: Arc<AppConfig>,
        default_embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self { scenes, vector_store, config, default_embedder }
    }

    /// Embeds `query_text` against `scene_code`'s embedding scene, then
    /// searches that scene's collection. A missing `query_text` or
    /// `scene_code` is an empty result, not an error, matching the
    /// original's validation branch.
    pub async fn vector_search(
        &self,
        query_text: &str,
        scene_code: &str,
        top_k: Option<usize>,
        min_score: Option<f32>,
        filters: Option<HashMap<String, String>>,
    ) -> VectorSearchOutcome {
        if query_text.is_empty() || scene_code.is_empty() {
            return VectorSearchOutcome::default();
        }

        let started = Instant::now();

        let embedding_scene = match self.scenes.resolve_embedding(scene_code).await {
            Ok(bundle) => bundle,
            Err(err) => {
                log::warn!("vector search: no embedding scene for {scene_code}: {err}");
                return VectorSearchOutcome { search_time_ms: elapsed_ms(started), ..Default::default() };
            }
        };

        let (endpoint, api_key) = self.config.embedding_endpoint_and_key(&embedding_scene.provider_code);
        let embedder = crate::provider::EmbeddingFactory::build(
            &endpoint,
            &api_key,
            &embedding_scene.model_code,
            embedding_scene.vector_dimension,
        );

        let vector = match embedder.embed(query_text).await {
            Ok(v) => v,
            Err(err) => {
                log::warn!("vector search: embedding failed for scene {scene_code}: {err}");
                return VectorSearchOutcome { search_time_ms: elapsed_ms(started), ..Default::default() };
            }
        };

        let top_k = top_k.filter(|k| *k > 0).unwrap_or(DEFAULT_TOP_K);
        let min_score = min_score.unwrap_or(DEFAULT_MIN_SCORE);

        let raw_results = match self.vector_store.search(&embedding_scene.collection_name, &vector, top_k, min_score).await {
            Ok(results) => results,
            Err(err) => {
                log::warn!("vector search: search failed for scene {scene_code}: {err}");
                return VectorSearchOutcome { search_time_ms: elapsed_ms(started), ..Default::default() };
            }
        };

        let results: Vec<VectorSearchResult> = raw_results
            .into_iter()
            .filter(|r| matches_filters(&r.metadata, filters.as_ref()))
            .map(|r| VectorSearchResult { id: r.id, score: r.score, vector: r.vector, metadata: r.metadata, content: r.content })
            .collect();

        let total_count = results.len();
        VectorSearchOutcome { results, total_count, search_time_ms: elapsed_ms(started) }
    }

    /// Embeds raw `text` with the service's configured default embedder.
    /// Empty text and embedding failures both fold into `error` rather
    /// than propagating as an `Err`, matching the original's response
    /// shape: every call returns `Ok`, success or failure alike.
    pub async fn vectorize_text(&self, text: &str) -> VectorizeOutcome {
        if text.is_empty() {
            return VectorizeOutcome { vector: Vec::new(), error: Some("text must not be empty".to_string()) };
        }

        match self.default_embedder.embed(text).await {
            Ok(vector) => VectorizeOutcome { vector, error: None },
            Err(err) => VectorizeOutcome { vector: Vec::new(), error: Some(format!("failed to generate vector: {err}")) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, SearchResult, VectorStoreFactory};
    use crate::store::Store;
    use async_trait::async_trait;

    struct StubEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(self.vector.clone())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Other("embedding backend unreachable".into()))
        }
    }

    fn sample_config() -> Arc<AppConfig> {
        Arc::new(
            AppConfig::from_yaml(
                r#"
mode: dev
database:
  data_source: ":memory:"
vector_db:
  type: mock
  endpoint: ""
  api_key: ""
"#,
            )
            .unwrap(),
        )
    }

    async fn sample_service(default_embedder: Arc<dyn EmbeddingProvider>) -> (VectorSearchService, Arc<dyn VectorStoreProvider>) {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let scenes = Arc::new(SceneResolver::new(store));
        let vector_store = VectorStoreFactory::build(crate::provider::VectorDbKind::Mock, "", "");
        let service = VectorSearchService::new(scenes, vector_store.clone(), sample_config(), default_embedder);
        (service, vector_store)
    }

    #[tokio::test]
    async fn vector_search_with_empty_query_returns_empty_not_error() {
        let (service, _store) = sample_service(Arc::new(StubEmbedder { vector: vec![0.1] })).await;
        let outcome = service.vector_search("", "any-scene", None, None, None).await;
        assert_eq!(outcome.total_count, 0);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn vector_search_with_empty_scene_code_returns_empty_not_error() {
        let (service, _store) = sample_service(Arc::new(StubEmbedder { vector: vec![0.1] })).await;
        let outcome = service.vector_search("hello", "", None, None, None).await;
        assert_eq!(outcome.total_count, 0);
    }

    #[tokio::test]
    async fn vector_search_unresolvable_scene_degrades_to_empty_result() {
        let (service, _store) = sample_service(Arc::new(StubEmbedder { vector: vec![0.1] })).await;
        let outcome = service.vector_search("hello", "nonexistent-scene", None, None, None).await;
        assert_eq!(outcome.total_count, 0);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn vectorize_text_with_empty_text_reports_error_not_err() {
        let (service, _store) = sample_service(Arc::new(StubEmbedder { vector: vec![0.1] })).await;
        let outcome = service.vectorize_text("").await;
        assert!(outcome.vector.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn vectorize_text_success_has_no_error() {
        let (service, _store) = sample_service(Arc::new(StubEmbedder { vector: vec![0.1, 0.2, 0.3] })).await;
        let outcome = service.vectorize_text("hello world").await;
        assert_eq!(outcome.vector, vec![0.1, 0.2, 0.3]);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn vectorize_text_embedding_failure_folds_into_error_field() {
        let (service, _store) = sample_service(Arc::new(FailingEmbedder)).await;
        let outcome = service.vectorize_text("hello world").await;
        assert!(outcome.vector.is_empty());
        assert!(outcome.error.unwrap().contains("failed to generate vector"));
    }

    #[test]
    fn matches_filters_requires_every_key_to_match() {
        let mut metadata = HashMap::new();
        metadata.insert("lang".to_string(), "en".to_string());
        let mut filters = HashMap::new();
        filters.insert("lang".to_string(), "en".to_string());
        assert!(matches_filters(&metadata, Some(&filters)));

        filters.insert("region".to_string(), "us".to_string());
        assert!(!matches_filters(&metadata, Some(&filters)));
    }
}
