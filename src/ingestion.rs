//! Knowledge ingestion: a content-addressed, deduplicating pipeline that
//! downloads or accepts source material, segments it, produces multi-view
//! summaries, and inserts summary documents into the vector store.

use crate::gateway::LmGateway;
use crate::provider::{EmbeddingProvider, Message, VectorDocument, VectorStoreProvider};
use crate::scene::{ResolveError, SceneResolver};
use crate::store::{Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const SEGMENTATION_SYSTEM_PROMPT: &str = "请将以下文本按语义拆分成多个段落，每行一个段落，不要编号。";
const SUMMARY_SYSTEM_PROMPT: &str = "请为以下内容生成多个不同角度的一句话摘要，每行一个，不要编号。";

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("source_type is required and must be one of FileUrl, Segments, Summaries")]
    MissingSourceType,

    #[error("file_url is required for FileUrl source")]
    MissingFileUrl,

    #[error("segments must not be empty")]
    EmptySegments,

    #[error("summaries must not be empty")]
    EmptySummaries,

    #[error("user_id is required")]
    MissingUserId,

    #[error("scene_code is required")]
    MissingSceneCode,

    #[error("failed to download {url}: {source}")]
    Download { url: String, source: reqwest::Error },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("vector store insert failed: {0}")]
    RagInsertFailed(String),

    #[error("vector store delete failed: {0}")]
    RagDeleteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    FileUrl,
    Segments,
    Summaries,
}

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub source_type: Option<SourceType>,
    pub file_url: Option<String>,
    pub segments: Option<Vec<String>>,
    pub summaries: Option<Vec<String>>,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub vector_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub success: bool,
    pub message: String,
}

fn trim_drop_empty(items: Vec<String>) -> Vec<String> {
    items.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn md5_of_joined(items: &[String]) -> String {
    format!("{:x}", md5::compute(items.join("\n")))
}

pub struct KnowledgeIngestion {
    gateway: Arc<LmGateway>,
    scenes: Arc<SceneResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStoreProvider>,
    store: Arc<Store>,
    http: reqwest::Client,
}

impl KnowledgeIngestion {
    pub fn new(
        gateway: Arc<LmGateway>,
        scenes: Arc<SceneResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStoreProvider>,
        store: Arc<Store>,
    ) -> Self {
        Self { gateway, scenes, embedder, vector_store, store, http: reqwest::Client::new() }
    }

    /// Embeds `text` for a to-be-inserted vector document; a failure here
    /// is treated the same as a persist failure upstream — logged and the
    /// document is dropped rather than inserted with a missing vector.
    async fn embed_or_log(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                log::warn!("embedding summary failed, skipping document: {err}");
                None
            }
        }
    }

    async fn segment_via_gateway(&self, scene_code: &str, text: &str, user_id: &str) -> Vec<String> {
        let messages = vec![Message::system(SEGMENTATION_SYSTEM_PROMPT), Message::user(text)];
        match self.gateway.call_unary(scene_code, messages, user_id).await {
            Ok(outcome) => {
                let segments = trim_drop_empty(outcome.content.lines().map(str::to_string).collect());
                if segments.is_empty() {
                    vec![text.to_string()]
                } else {
                    segments
                }
            }
            Err(err) => {
                log::warn!("segmentation call failed, using input as one segment: {err}");
                vec![text.to_string()]
            }
        }
    }

    async fn summarize_via_gateway(&self, scene_code: &str, segment_text: &str, user_id: &str) -> Vec<String> {
        let messages = vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(segment_text)];
        match self.gateway.call_unary(scene_code, messages, user_id).await {
            Ok(outcome) => {
                let summaries = trim_drop_empty(outcome.content.lines().map(str::to_string).collect());
                if summaries.is_empty() {
                    vec![segment_text.to_string()]
                } else {
                    summaries
                }
            }
            Err(err) => {
                log::warn!("summarization call failed, falling back to segment text: {err}");
                vec![segment_text.to_string()]
            }
        }
    }

    /// Runs the full pipeline for the given scene_code (segmentation and
    /// summarization share one scene in this design — callers that need
    /// distinct scenes for each stage pass the appropriate code per call
    /// site at the ingress boundary).
    pub async fn ingest(&self, scene_code: &str, req: IngestRequest) -> Result<IngestOutcome, IngestionError> {
        if req.user_id.is_empty() {
            return Err(IngestionError::MissingUserId);
        }
        let source_type = req.source_type.ok_or(IngestionError::MissingSourceType)?;

        // Resolve the embedding scene up front so a missing collection
        // fails fast, before any network download or LM spend.
        let embedding_scene = self.scenes.resolve_embedding(scene_code).await?;

        let (file_md5, file_id, raw_segments): (String, i64, Vec<String>) = match source_type {
            SourceType::FileUrl => {
                let url = req.file_url.clone().ok_or(IngestionError::MissingFileUrl)?;
                if url.is_empty() {
                    return Err(IngestionError::MissingFileUrl);
                }

                let bytes = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|source| IngestionError::Download { url: url.clone(), source })?
                    .bytes()
                    .await
                    .map_err(|source| IngestionError::Download { url: url.clone(), source })?;
                let md5 = format!("{:x}", md5::compute(&bytes));

                if self.store.find_file_by_md5(&md5).await?.is_some() {
                    return Ok(IngestOutcome { vector_id: md5, success: true, message: "already exists".into() });
                }

                let text = String::from_utf8_lossy(&bytes).to_string();
                let file_name = url.rsplit('/').next().unwrap_or("").to_string();
                let id = self.store.insert_file(&url, &file_name, bytes.len() as i64, "", &md5).await?;
                (md5, id, vec![text])
            }
            SourceType::Segments => {
                let segments = trim_drop_empty(req.segments.clone().unwrap_or_default());
                if segments.is_empty() {
                    return Err(IngestionError::EmptySegments);
                }
                let md5 = md5_of_joined(&segments);
                if self.store.find_file_by_md5(&md5).await?.is_some() {
                    return Ok(IngestOutcome { vector_id: md5, success: true, message: "already exists".into() });
                }
                self.store.insert_file("", "", 0, "", &md5).await?;
                (md5, 0, segments)
            }
            SourceType::Summaries => {
                let summaries = trim_drop_empty(req.summaries.clone().unwrap_or_default());
                if summaries.is_empty() {
                    return Err(IngestionError::EmptySummaries);
                }
                let md5 = md5_of_joined(&summaries);
                if let Some(_existing) = self.store.find_file_by_md5(&md5).await? {
                    return Ok(IngestOutcome { vector_id: md5, success: true, message: "already exists".into() });
                }
                self.store.insert_file("", "", 0, "", &md5).await?;

                // Pre-made summaries skip segmentation/per-segment summarization
                // entirely: file_id = seg_id = 0 for every row.
                let mut documents = Vec::new();
                for summary_text in &summaries {
                    let summary_md5 = format!("{:x}", md5::compute(summary_text));
                    match self.store.insert_summary(0, 0, summary_text, &summary_md5).await {
                        Ok(summary_id) => {
                            let Some(vector) = self.embed_or_log(summary_text).await else { continue };
                            let mut metadata = HashMap::new();
                            metadata.insert("knowledge_file_id".to_string(), "0".to_string());
                            metadata.insert("knowledge_segment_id".to_string(), "0".to_string());
                            metadata.insert("user_id".to_string(), req.user_id.clone());
                            documents.push(VectorDocument {
                                id: summary_id.to_string(),
                                vector,
                                content: summary_text.clone(),
                                metadata,
                            });
                        }
                        Err(err) => log::warn!("failed to persist summary row, skipping: {err}"),
                    }
                }
                return self.finish(md5, documents, &embedding_scene.collection_name).await;
            }
        };

        let segments = if matches!(source_type, SourceType::FileUrl) {
            let mut out = Vec::new();
            for text in &raw_segments {
                out.extend(self.segment_via_gateway(scene_code, text, &req.user_id).await);
            }
            out
        } else {
            raw_segments
        };

        let mut documents = Vec::new();
        for segment_text in &segments {
            let segment_md5 = format!("{:x}", md5::compute(segment_text));
            let segment_id = match self.store.insert_segment(file_id, segment_text, &segment_md5).await {
                Ok(id) => id,
                Err(err) => {
                    log::warn!("failed to persist segment, skipping its summaries: {err}");
                    continue;
                }
            };

            let summaries = self.summarize_via_gateway(scene_code, segment_text, &req.user_id).await;
            for summary_text in &summaries {
                let summary_md5 = format!("{:x}", md5::compute(summary_text));
                match self.store.insert_summary(file_id, segment_id, summary_text, &summary_md5).await {
                    Ok(summary_id) => {
                        let Some(vector) = self.embed_or_log(summary_text).await else { continue };
                        let mut metadata = HashMap::new();
                        metadata.insert("knowledge_file_id".to_string(), file_id.to_string());
                        metadata.insert("knowledge_segment_id".to_string(), segment_id.to_string());
                        metadata.insert("user_id".to_string(), req.user_id.clone());
                        documents.push(VectorDocument {
                            id: summary_id.to_string(),
                            vector,
                            content: summary_text.clone(),
                            metadata,
                        });
                    }
                    Err(err) => log::warn!("failed to persist summary row, skipping: {err}"),
                }
            }
        }

        self.finish(file_md5, documents, &embedding_scene.collection_name).await
    }

    async fn finish(
        &self,
        file_md5: String,
        documents: Vec<VectorDocument>,
        collection: &str,
    ) -> Result<IngestOutcome, IngestionError> {
        if documents.is_empty() {
            return Ok(IngestOutcome { vector_id: file_md5, success: false, message: "no documents".into() });
        }

        self.vector_store
            .insert(collection, &documents)
            .await
            .map_err(|err| IngestionError::RagInsertFailed(err.to_string()))?;

        Ok(IngestOutcome { vector_id: file_md5, success: true, message: "知识库添加成功".into() })
    }

    pub async fn delete(&self, vector_id: &str, _user_id: &str, scene_code: &str) -> Result<DeleteOutcome, IngestionError> {
        if scene_code.is_empty() {
            return Err(IngestionError::MissingSceneCode);
        }
        let embedding_scene = self.scenes.resolve_embedding(scene_code).await?;

        match self.vector_store.delete(&embedding_scene.collection_name, &[vector_id.to_string()]).await {
            Ok(()) => Ok(DeleteOutcome { success: true, message: String::new() }),
            Err(err) => Ok(DeleteOutcome { success: false, message: err.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderRegistry, VectorDocument as VDoc};
    use crate::provider::vector_store::MockVectorStore;
    use crate::store::{EmbeddingSceneRow, SceneRow};

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    async fn harness() -> (Arc<Store>, KnowledgeIngestion) {
        let store = Arc::new(Store::open(":memory:").unwrap());
        store
            .upsert_scene(SceneRow {
                scene_code: "ingest".into(),
                provider_code: "unified".into(),
                model_code: "m".into(),
                temperature: 0.0,
                max_tokens: 512,
                enable_stream: false,
                system_prompt: String::new(),
            })
            .await
            .unwrap();
        store
            .upsert_embedding_scene(EmbeddingSceneRow {
                scene_code: "ingest".into(),
                provider_code: "bailian".into(),
                model_code: "text-embedding-v4".into(),
                vector_dimension: 8,
                collection_name: "knowledge".into(),
            })
            .await
            .unwrap();

        let scenes = Arc::new(crate::scene::SceneResolver::new(store.clone()));
        let registry = Arc::new(ProviderRegistry::with_defaults());
        let gateway = Arc::new(LmGateway::new(store.clone(), scenes.clone(), registry));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(StubEmbedder);
        let vector_store: Arc<dyn VectorStoreProvider> = Arc::new(MockVectorStore::new());
        let ingestion = KnowledgeIngestion::new(gateway, scenes, embedder, vector_store, store.clone());
        (store, ingestion)
    }

    #[tokio::test]
    async fn summaries_mode_writes_rows_with_zero_file_and_segment_ids() {
        let (store, ingestion) = harness().await;
        let req = IngestRequest {
            source_type: Some(SourceType::Summaries),
            summaries: Some(vec!["A".into(), "B".into()]),
            user_id: "u1".into(),
            ..Default::default()
        };

        let outcome = ingestion.ingest("ingest", req).await.unwrap();
        assert!(outcome.success);

        let found = store.find_file_by_md5(&md5_of_joined(&["A".to_string(), "B".to_string()])).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn segments_mode_rejects_empty_list_after_trim() {
        let (_store, ingestion) = harness().await;
        let req = IngestRequest {
            source_type: Some(SourceType::Segments),
            segments: Some(vec!["   ".into(), "".into()]),
            user_id: "u1".into(),
            ..Default::default()
        };

        let err = ingestion.ingest("ingest", req).await.unwrap_err();
        assert!(matches!(err, IngestionError::EmptySegments));
    }

    #[tokio::test]
    async fn repeated_segments_ingestion_dedups_by_file_md5() {
        let (_store, ingestion) = harness().await;
        let req = || IngestRequest {
            source_type: Some(SourceType::Segments),
            segments: Some(vec!["hello world".into()]),
            user_id: "u1".into(),
            ..Default::default()
        };

        let first = ingestion.ingest("ingest", req()).await.unwrap();
        assert!(first.success);

        let second = ingestion.ingest("ingest", req()).await.unwrap();
        assert!(second.success);
        assert_eq!(second.message, "already exists");
        assert_eq!(second.vector_id, first.vector_id);
    }

    #[tokio::test]
    async fn missing_user_id_is_a_validation_error() {
        let (_store, ingestion) = harness().await;
        let req = IngestRequest { source_type: Some(SourceType::Summaries), summaries: Some(vec!["A".into()]), ..Default::default() };
        let err = ingestion.ingest("ingest", req).await.unwrap_err();
        assert!(matches!(err, IngestionError::MissingUserId));
    }

    #[test]
    fn dummy_doc_constructs() {
        let _ = VDoc { id: "1".into(), vector: vec![], content: "c".into(), metadata: HashMap::new() };
    }
}
