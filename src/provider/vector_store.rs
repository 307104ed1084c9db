//! Vector store capability: CRUD over named collections, with three
//! adapters — a remote DashVector-shaped REST service, an in-memory mock,
//! and a local-index placeholder.

use crate::provider::language_model::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    InnerProduct,
    L2,
    Cosine,
}

#[derive(Debug, Clone)]
pub struct VectorDocument {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub vector: Option<Vec<f32>>,
    pub metadata: HashMap<String, String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub metric: Metric,
    pub exists: bool,
}

#[async_trait::async_trait]
pub trait VectorStoreProvider: Send + Sync {
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, ProviderError>;

    async fn insert(&self, collection: &str, documents: &[VectorDocument]) -> Result<(), ProviderError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ProviderError>;

    async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<(), ProviderError>;

    async fn delete_collection(&self, name: &str) -> Result<(), ProviderError>;

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, ProviderError>;

    async fn list_collections(&self) -> Result<Vec<String>, ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;
}

// ===========================================================================
// Remote adapter (DashVector-shaped REST protocol)
// ===========================================================================

pub struct RemoteVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteVectorStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("dashvector-auth-token", &self.api_key)
            .header("X-API-Key", &self.api_key)
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/v1/collections/{}", self.base_url, name)
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    output: Option<T>,
    #[serde(default)]
    data: Option<T>,
}

impl<T> Envelope<T> {
    /// Prefers `output` over `data` over treating the raw body as absent.
    fn into_payload(self) -> Result<Option<T>, ProviderError> {
        if self.code != 0 {
            return Err(ProviderError::Other(format!("vector store error {}: {}", self.code, self.message)));
        }
        Ok(self.output.or(self.data))
    }
}

#[derive(Serialize)]
struct InsertDoc<'a> {
    id: &'a str,
    vector: &'a [f32],
    fields: HashMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct InsertRequest<'a> {
    docs: Vec<InsertDoc<'a>>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    topk: usize,
}

#[derive(Deserialize)]
struct QueryDoc {
    id: String,
    score: f32,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    fields: HashMap<String, String>,
}

#[derive(Deserialize)]
struct QueryOutput {
    #[serde(default)]
    output: Vec<QueryDoc>,
}

#[derive(Deserialize)]
struct CollectionStatus {
    #[serde(default)]
    status: String,
}

const CONTENT_FIELD: &str = "content";

#[async_trait::async_trait]
impl VectorStoreProvider for RemoteVectorStore {
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let url = format!("{}/query", self.collection_url(collection));
        let body = QueryRequest { vector: query_vector, topk: top_k };

        let response = self.auth(self.client.post(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let envelope: Envelope<QueryOutput> = response.json().await.map_err(ProviderError::Network)?;
        let docs = envelope.into_payload()?.map(|o| o.output).unwrap_or_default();

        Ok(docs
            .into_iter()
            .filter(|d| d.score >= min_score)
            .map(|mut d| {
                let content = d.fields.remove(CONTENT_FIELD).unwrap_or_default();
                SearchResult { id: d.id, score: d.score, vector: d.vector, metadata: d.fields, content }
            })
            .collect())
    }

    async fn insert(&self, collection: &str, documents: &[VectorDocument]) -> Result<(), ProviderError> {
        if documents.is_empty() {
            return Ok(());
        }

        let url = format!("{}/docs", self.collection_url(collection));
        let docs: Vec<InsertDoc> = documents
            .iter()
            .map(|d| {
                let mut fields: HashMap<&str, &str> =
                    d.metadata.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                fields.insert(CONTENT_FIELD, &d.content);
                InsertDoc { id: &d.id, vector: &d.vector, fields }
            })
            .collect();

        let response = self.auth(self.client.post(&url)).json(&InsertRequest { docs }).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }
        let envelope: Envelope<serde_json::Value> = response.json().await.map_err(ProviderError::Network)?;
        envelope.into_payload()?;
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Ok(());
        }

        let url = format!("{}/docs", self.collection_url(collection));
        let response = self
            .auth(self.client.delete(&url))
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }
        let envelope: Envelope<serde_json::Value> = response.json().await.map_err(ProviderError::Network)?;
        envelope.into_payload()?;
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<(), ProviderError> {
        let metric_str = match metric {
            Metric::InnerProduct => "dotproduct",
            Metric::L2 => "euclidean",
            Metric::Cosine => "cosine",
        };
        let response = self
            .auth(self.client.post(self.collection_url(name)))
            .json(&serde_json::json!({ "name": name, "dimension": dimension, "metric": metric_str }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }
        let envelope: Envelope<serde_json::Value> = response.json().await.map_err(ProviderError::Network)?;
        envelope.into_payload()?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), ProviderError> {
        let response = self.auth(self.client.delete(self.collection_url(name))).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }
        Ok(())
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, ProviderError> {
        let response = self.auth(self.client.get(self.collection_url(name))).send().await?;
        if !response.status().is_success() {
            return Ok(CollectionInfo { name: name.to_string(), dimension: 0, metric: Metric::Cosine, exists: false });
        }
        let envelope: Envelope<CollectionStatus> = response.json().await.map_err(ProviderError::Network)?;
        let status = envelope.into_payload()?.map(|s| s.status).unwrap_or_default();
        Ok(CollectionInfo {
            name: name.to_string(),
            dimension: 0,
            metric: Metric::Cosine,
            exists: status == "SERVING",
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/collections", self.base_url);
        let response = self.auth(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }
        let envelope: Envelope<Vec<String>> = response.json().await.map_err(ProviderError::Network)?;
        Ok(envelope.into_payload()?.unwrap_or_default())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ===========================================================================
// In-memory mock adapter, used in tests and via `VectorDB.Type = mock`
// ===========================================================================

#[derive(Default)]
struct MockCollection {
    dimension: usize,
    metric: Metric,
    docs: HashMap<String, VectorDocument>,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Cosine
    }
}

#[derive(Default)]
pub struct MockVectorStore {
    collections: Arc<AsyncRwLock<HashMap<String, MockCollection>>>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait::async_trait]
impl VectorStoreProvider for MockVectorStore {
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<SearchResult> = coll
            .docs
            .values()
            .map(|doc| SearchResult {
                id: doc.id.clone(),
                score: cosine(query_vector, &doc.vector),
                vector: Some(doc.vector.clone()),
                metadata: doc.metadata.clone(),
                content: doc.content.clone(),
            })
            .filter(|r| r.score >= min_score)
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    async fn insert(&self, collection: &str, documents: &[VectorDocument]) -> Result<(), ProviderError> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().await;
        let coll = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            coll.docs.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ProviderError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().await;
        if let Some(coll) = collections.get_mut(collection) {
            for id in ids {
                coll.docs.remove(id);
            }
        }
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<(), ProviderError> {
        let mut collections = self.collections.write().await;
        collections.insert(name.to_string(), MockCollection { dimension, metric, docs: HashMap::new() });
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), ProviderError> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, ProviderError> {
        let collections = self.collections.read().await;
        match collections.get(name) {
            Some(coll) => {
                Ok(CollectionInfo { name: name.to_string(), dimension: coll.dimension, metric: coll.metric, exists: true })
            }
            None => Ok(CollectionInfo { name: name.to_string(), dimension: 0, metric: Metric::Cosine, exists: false }),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ===========================================================================
// Local-index placeholder — preserves the interface; real ANN search is
// out of scope. All mutation serializes under a single writer lock.
// ===========================================================================

pub struct LocalIndexVectorStore {
    collections: std::sync::RwLock<HashMap<String, MockCollection>>,
}

impl LocalIndexVectorStore {
    pub fn new() -> Self {
        Self { collections: std::sync::RwLock::new(HashMap::new()) }
    }
}

impl Default for LocalIndexVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VectorStoreProvider for LocalIndexVectorStore {
    async fn search(
        &self,
        collection: &str,
        _query_vector: &[f32],
        top_k: usize,
        _min_score: f32,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        // Placeholder: no real nearest-neighbor search. Returns up to
        // `top_k` arbitrary members of the collection so the interface is
        // exercisable without a real index implementation.
        let collections = self.collections.read().unwrap();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .docs
            .values()
            .take(top_k)
            .map(|doc| SearchResult {
                id: doc.id.clone(),
                score: 0.0,
                vector: Some(doc.vector.clone()),
                metadata: doc.metadata.clone(),
                content: doc.content.clone(),
            })
            .collect())
    }

    async fn insert(&self, collection: &str, documents: &[VectorDocument]) -> Result<(), ProviderError> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().unwrap();
        let coll = collections.entry(collection.to_string()).or_default();
        for doc in documents {
            coll.docs.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), ProviderError> {
        let mut collections = self.collections.write().unwrap();
        if let Some(coll) = collections.get_mut(collection) {
            for id in ids {
                coll.docs.remove(id);
            }
        }
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize, metric: Metric) -> Result<(), ProviderError> {
        let mut collections = self.collections.write().unwrap();
        collections.insert(name.to_string(), MockCollection { dimension, metric, docs: HashMap::new() });
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), ProviderError> {
        self.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn get_collection_info(&self, name: &str) -> Result<CollectionInfo, ProviderError> {
        let collections = self.collections.read().unwrap();
        match collections.get(name) {
            Some(coll) => {
                Ok(CollectionInfo { name: name.to_string(), dimension: coll.dimension, metric: coll.metric, exists: true })
            }
            None => Ok(CollectionInfo { name: name.to_string(), dimension: 0, metric: Metric::Cosine, exists: false }),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.collections.read().unwrap().keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, vector: Vec<f32>, content: &str) -> VectorDocument {
        VectorDocument { id: id.to_string(), vector, content: content.to_string(), metadata: HashMap::new() }
    }

    #[tokio::test]
    async fn mock_store_filters_by_min_score() {
        let store = MockVectorStore::new();
        store.insert("c", &[doc("a", vec![1.0, 0.0], "a"), doc("b", vec![0.0, 1.0], "b")]).await.unwrap();

        let results = store.search("c", &[1.0, 0.0], 10, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn mock_store_insert_is_noop_on_empty_batch() {
        let store = MockVectorStore::new();
        store.insert("c", &[]).await.unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_store_search_on_missing_collection_returns_empty() {
        let store = MockVectorStore::new();
        let results = store.search("missing", &[1.0], 10, 0.0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn local_index_preserves_interface_without_real_search() {
        let store = LocalIndexVectorStore::new();
        store.insert("c", &[doc("a", vec![1.0], "a")]).await.unwrap();
        let info = store.get_collection_info("c").await.unwrap();
        assert!(info.exists);
    }
}
