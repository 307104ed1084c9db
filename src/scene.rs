//! Scene resolution: maps a scene code to the provider/model bundle a
//! request should run against. One DB read per call, no cache — a scene
//! edit takes effect on the very next request.

use crate::store::{EmbeddingSceneRow, SceneRow, Store, StoreError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SceneBundle {
    pub scene_code: String,
    pub provider_code: String,
    pub model_code: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub enable_stream: bool,
    pub system_prompt: String,
}

impl From<SceneRow> for SceneBundle {
    fn from(row: SceneRow) -> Self {
        Self {
            scene_code: row.scene_code,
            provider_code: row.provider_code,
            model_code: row.model_code,
            temperature: row.temperature,
            max_tokens: row.max_tokens,
            enable_stream: row.enable_stream,
            system_prompt: row.system_prompt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingSceneBundle {
    pub scene_code: String,
    pub provider_code: String,
    pub model_code: String,
    pub vector_dimension: usize,
    pub collection_name: String,
}

impl From<EmbeddingSceneRow> for EmbeddingSceneBundle {
    fn from(row: EmbeddingSceneRow) -> Self {
        Self {
            scene_code: row.scene_code,
            provider_code: row.provider_code,
            model_code: row.model_code,
            vector_dimension: row.vector_dimension.max(0) as usize,
            collection_name: row.collection_name,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("scene not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SceneResolver {
    store: Arc<Store>,
}

impl SceneResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, scene_code: &str) -> Result<SceneBundle, ResolveError> {
        self.store
            .find_scene_by_code(scene_code)
            .await?
            .map(SceneBundle::from)
            .ok_or_else(|| ResolveError::NotFound(scene_code.to_string()))
    }

    pub async fn resolve_embedding(&self, scene_code: &str) -> Result<EmbeddingSceneBundle, ResolveError> {
        self.store
            .find_embedding_scene_by_code(scene_code)
            .await?
            .map(EmbeddingSceneBundle::from)
            .ok_or_else(|| ResolveError::NotFound(scene_code.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SceneRow;

    async fn seeded_store() -> Arc<Store> {
        let store = Store::open(":memory:").unwrap();
        store
            .upsert_scene(SceneRow {
                scene_code: "chat".into(),
                provider_code: "unified".into(),
                model_code: "doubao-pro".into(),
                temperature: 0.7,
                max_tokens: 1024,
                enable_stream: true,
                system_prompt: "you are a helpful assistant".into(),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn resolve_known_scene() {
        let resolver = SceneResolver::new(seeded_store().await);
        let bundle = resolver.resolve("chat").await.unwrap();
        assert_eq!(bundle.provider_code, "unified");
        assert!(bundle.enable_stream);
    }

    #[tokio::test]
    async fn resolve_unknown_scene_is_not_found() {
        let resolver = SceneResolver::new(seeded_store().await);
        let err = resolver.resolve("missing").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
