//! Thin CLI wiring a config file to the library: not itself a transport,
//! just a local driver for the chat and ingestion pipelines against
//! stdin/stdout.

use clap::{Parser, Subcommand};
use rag_chat_backend::gateway::LmGateway;
use rag_chat_backend::ingestion::{IngestRequest, KnowledgeIngestion, SourceType};
use rag_chat_backend::orchestrator::{Cancellation, ChatOrchestrator};
use rag_chat_backend::provider::{EmbeddingFactory, EmbeddingProvider, ProviderError, ProviderRegistry, VectorStoreFactory};
use rag_chat_backend::scene::SceneResolver;
use rag_chat_backend::search::VectorSearchService;
use rag_chat_backend::{AppConfig, Store};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rag-chat-backend")]
#[command(author, version, about = "Chat orchestration and knowledge ingestion CLI", long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream one chat turn to stdout
    Chat {
        /// Scene code to run the turn against
        #[arg(long)]
        scene: String,
        /// The user's message
        #[arg(long)]
        message: String,
        /// Existing session id to continue, if any
        #[arg(long)]
        session: Option<i64>,
        /// Opaque user identifier tag
        #[arg(long, default_value = "anonymous")]
        user: String,
    },
    /// Ingest knowledge from one of the three supported source modes
    Ingest {
        /// Scene code used for segmentation/summarization and collection lookup
        #[arg(long)]
        scene: String,
        /// Opaque user identifier tag
        #[arg(long, default_value = "anonymous")]
        user: String,
        /// Remote URL to download and ingest (FileUrl mode)
        #[arg(long)]
        file_url: Option<String>,
        /// Pre-split segment strings (Segments mode)
        #[arg(long)]
        segment: Vec<String>,
        /// Pre-made summary strings (Summaries mode)
        #[arg(long)]
        summary: Vec<String>,
    },
    /// One-shot vector search, independent of any chat session
    Search {
        /// Embedding scene whose collection is searched
        #[arg(long)]
        scene: String,
        /// Text to embed and search for
        #[arg(long)]
        query: String,
        /// Maximum number of results to return
        #[arg(long)]
        top_k: Option<usize>,
        /// Minimum similarity score to keep a result
        #[arg(long)]
        min_score: Option<f32>,
    },
    /// Embeds raw text with a scene's embedding model
    Vectorize {
        /// Embedding scene providing the model to use
        #[arg(long)]
        scene: String,
        /// Text to embed
        #[arg(long)]
        text: String,
    },
}

/// Stands in for a real embedder when a chat scene has no matching
/// embedding scene configured: every call fails, which the orchestrator's
/// per-probe fan-out already treats as "zero results for this probe," not
/// a terminal error.
struct NoEmbeddingConfigured;

#[async_trait::async_trait]
impl EmbeddingProvider for NoEmbeddingConfigured {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Other("no embedding scene configured".into()))
    }
}

fn build_embedder(config: &AppConfig, provider_code: &str, model_code: &str, dimension: usize) -> Arc<dyn EmbeddingProvider> {
    let (endpoint, api_key) = config.embedding_endpoint_and_key(provider_code);
    EmbeddingFactory::build(&endpoint, &api_key, model_code, dimension)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("failed to load config from {}: {err}", cli.config);
            return ExitCode::FAILURE;
        }
    };

    let store = match Store::open(&config.database.data_source) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("failed to open store: {err}");
            return ExitCode::FAILURE;
        }
    };

    let scenes = Arc::new(SceneResolver::new(store.clone()));
    let registry = Arc::new(ProviderRegistry::with_defaults());
    let provider_configs = config
        .provider_defaults
        .iter()
        .map(|(provider_code, defaults)| (provider_code.clone(), defaults.into()))
        .collect();
    let gateway =
        Arc::new(LmGateway::new(store.clone(), scenes.clone(), registry).with_provider_configs(provider_configs));
    let vector_store = VectorStoreFactory::build(config.vector_db.kind.into(), &config.vector_db.endpoint, &config.vector_db.api_key);

    match cli.command {
        Commands::Chat { scene, message, session, user } => {
            let (embedder, collection): (Arc<dyn EmbeddingProvider>, String) =
                match scenes.resolve_embedding(&scene).await {
                    Ok(bundle) => (
                        build_embedder(&config, &bundle.provider_code, &bundle.model_code, bundle.vector_dimension),
                        bundle.collection_name,
                    ),
                    Err(err) => {
                        log::warn!("no embedding scene for {scene}, retrieval will be skipped: {err}");
                        (Arc::new(NoEmbeddingConfigured), String::new())
                    }
                };

            let orchestrator = ChatOrchestrator::new(gateway, scenes, embedder, vector_store, store);
            let cancellation = Cancellation::new();

            let mut stdout = std::io::stdout();
            let result = orchestrator
                .chat_stream(session, &scene, &message, &user, &collection, cancellation, |chunk| {
                    let write_ok = write!(stdout, "{}", chunk.delta).and_then(|_| stdout.flush()).is_ok();
                    if chunk.finished {
                        println!();
                    }
                    write_ok
                })
                .await;

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("chat turn failed: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Ingest { scene, user, file_url, segment, summary } => {
            let embedding_scene = match scenes.resolve_embedding(&scene).await {
                Ok(bundle) => bundle,
                Err(err) => {
                    eprintln!("failed to resolve embedding scene {scene}: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let embedder =
                build_embedder(&config, &embedding_scene.provider_code, &embedding_scene.model_code, embedding_scene.vector_dimension);
            let ingestion = KnowledgeIngestion::new(gateway, scenes, embedder, vector_store, store);

            let req = if let Some(url) = file_url {
                IngestRequest { source_type: Some(SourceType::FileUrl), file_url: Some(url), user_id: user, ..Default::default() }
            } else if !segment.is_empty() {
                IngestRequest { source_type: Some(SourceType::Segments), segments: Some(segment), user_id: user, ..Default::default() }
            } else {
                IngestRequest { source_type: Some(SourceType::Summaries), summaries: Some(summary), user_id: user, ..Default::default() }
            };

            match ingestion.ingest(&scene, req).await {
                Ok(outcome) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "vector_id": outcome.vector_id,
                            "success": outcome.success,
                            "message": outcome.message,
                        })
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("ingestion failed: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Search { scene, query, top_k, min_score } => {
            let default_embedder: Arc<dyn EmbeddingProvider> = match scenes.resolve_embedding(&scene).await {
                Ok(bundle) => build_embedder(&config, &bundle.provider_code, &bundle.model_code, bundle.vector_dimension),
                Err(err) => {
                    eprintln!("failed to resolve embedding scene {scene}: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let service = VectorSearchService::new(scenes, vector_store, config, default_embedder);
            let outcome = service.vector_search(&query, &scene, top_k, min_score, None).await;
            println!(
                "{}",
                serde_json::json!({
                    "total_count": outcome.total_count,
                    "search_time_ms": outcome.search_time_ms,
                    "results": outcome.results.iter().map(|r| serde_json::json!({
                        "id": r.id,
                        "score": r.score,
                        "content": r.content,
                    })).collect::<Vec<_>>(),
                })
            );
            ExitCode::SUCCESS
        }
        Commands::Vectorize { scene, text } => {
            let default_embedder: Arc<dyn EmbeddingProvider> = match scenes.resolve_embedding(&scene).await {
                Ok(bundle) => build_embedder(&config, &bundle.provider_code, &bundle.model_code, bundle.vector_dimension),
                Err(err) => {
                    eprintln!("failed to resolve embedding scene {scene}: {err}");
                    return ExitCode::FAILURE;
                }
            };
            let service = VectorSearchService::new(scenes, vector_store, config, default_embedder);
            let outcome = service.vectorize_text(&text).await;
            match outcome.error {
                Some(error) => {
                    println!("{}", serde_json::json!({ "vector": [], "error": error }));
                    ExitCode::SUCCESS
                }
                None => {
                    println!("{}", serde_json::json!({ "vector": outcome.vector, "error": serde_json::Value::Null }));
                    ExitCode::SUCCESS
                }
            }
        }
    }
}
