//! A retrieval-augmented chat backend: a streaming chat orchestration
//! pipeline and a content-addressed knowledge ingestion pipeline, sharing a
//! provider plane of pluggable language-model, embedding, and vector-store
//! adapters.

pub mod config;
pub mod gateway;
pub mod ingestion;
pub mod logger;
pub mod orchestrator;
pub mod provider;
pub mod scene;
pub mod search;
pub mod store;

pub use config::AppConfig;
pub use gateway::LmGateway;
pub use ingestion::KnowledgeIngestion;
pub use logger::log;
pub use orchestrator::ChatOrchestrator;
pub use scene::SceneResolver;
pub use search::VectorSearchService;
pub use store::Store;
