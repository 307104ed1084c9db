//! Adapter selection: a plain `match` over configuration, no dynamic
//! registration, per the "Provider dispatch" design note.

use crate::provider::embedding::{BailianEmbeddingProvider, EmbeddingProvider};
use crate::provider::vector_store::{LocalIndexVectorStore, MockVectorStore, RemoteVectorStore, VectorStoreProvider};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorDbKind {
    Local,
    Remote,
    Mock,
}

pub struct VectorStoreFactory;

impl VectorStoreFactory {
    pub fn build(kind: VectorDbKind, endpoint: &str, api_key: &str) -> Arc<dyn VectorStoreProvider> {
        match kind {
            VectorDbKind::Remote => Arc::new(RemoteVectorStore::new(endpoint, api_key)),
            VectorDbKind::Local => Arc::new(LocalIndexVectorStore::new()),
            VectorDbKind::Mock => Arc::new(MockVectorStore::new()),
        }
    }
}

pub struct EmbeddingFactory;

impl EmbeddingFactory {
    pub fn build(endpoint: &str, api_key: &str, model_code: &str, dimension: usize) -> Arc<dyn EmbeddingProvider> {
        Arc::new(BailianEmbeddingProvider::new(
            endpoint.to_string(),
            api_key.to_string(),
            model_code.to_string(),
            dimension,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_and_local_builds_dont_need_network_config() {
        let _ = VectorStoreFactory::build(VectorDbKind::Mock, "", "");
        let _ = VectorStoreFactory::build(VectorDbKind::Local, "", "");
    }
}
