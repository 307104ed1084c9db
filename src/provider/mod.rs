//! Provider plane: uniform capability interfaces for language-model
//! completion, text embedding, and vector-store CRUD, plus their
//! concrete adapters and selection factories.

pub mod adapter;
pub mod embedding;
pub mod factory;
pub mod language_model;
pub mod registry;
pub mod vector_store;

pub use embedding::EmbeddingProvider;
pub use factory::{EmbeddingFactory, VectorDbKind, VectorStoreFactory};
pub use language_model::*;
pub use registry::ProviderRegistry;
pub use vector_store::{CollectionInfo, Metric, SearchResult, VectorDocument, VectorStoreProvider};
