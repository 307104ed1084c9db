//! Language-model gateway: resolves a scene, dispatches to the right
//! provider, and persists a completion record on every exit path.

use crate::provider::{
    ChunkStream, CompletionRequest, FinishReason, LanguageModelProvider, Message, ProviderConfig, ProviderError,
    ProviderRegistry, Role, TokenUsage,
};
use crate::scene::{ResolveError, SceneResolver};
use crate::store::{CompletionRecord, Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("scene_code is required")]
    MissingSceneCode,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("provider not registered: {0}")]
    UnknownProvider(String),

    #[error("streaming is disabled for this scene")]
    StreamingDisabled,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub request_id: String,
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// Renders `[role]: content` lines joined by `\n`, matching `BuildPromptText`.
pub fn build_prompt_text(messages: &[Message]) -> String {
    messages.iter().map(|m| format!("[{}]: {}", m.role.as_str(), m.content)).collect::<Vec<_>>().join("\n")
}

/// CJK scalar values contribute `count / 1.5` tokens, everything else
/// contributes `count / 4`; the floor is 1 token for any non-empty text.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let total_chars = text.chars().count();
    let chinese_chars = text.chars().filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c)).count();
    let other_chars = total_chars - chinese_chars;

    let chinese_tokens = chinese_chars as f64 / 1.5;
    let other_tokens = other_chars as f64 / 4.0;
    let estimate = (chinese_tokens + other_tokens).floor() as i64;
    estimate.max(1)
}

/// Persists the accumulating completion record when dropped, regardless of
/// which path out of the gateway call is taken — the Rust analogue of the
/// Go `defer l.common.SaveCompletion(completion)`. The write runs with a
/// timeout detached from the caller's own cancellation.
struct PersistOnDrop {
    store: Arc<Store>,
    record: Option<CompletionRecord>,
}

impl PersistOnDrop {
    fn new(store: Arc<Store>, record: CompletionRecord) -> Self {
        Self { store, record: Some(record) }
    }

    fn record_mut(&mut self) -> &mut CompletionRecord {
        self.record.as_mut().expect("record taken before drop")
    }
}

impl Drop for PersistOnDrop {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.save_completion(record).await {
                    log::warn!("failed to persist completion record: {err}");
                }
            });
        }
    }
}

pub struct LmGateway {
    store: Arc<Store>,
    scenes: Arc<SceneResolver>,
    registry: Arc<ProviderRegistry>,
    provider_configs: HashMap<String, ProviderConfig>,
}

impl LmGateway {
    pub fn new(store: Arc<Store>, scenes: Arc<SceneResolver>, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, scenes, registry, provider_configs: HashMap::new() }
    }

    /// Attaches the per-provider endpoint/credential bundle (keyed by
    /// `provider_code`, the same key scenes resolve to) that `call_unary`
    /// and `call_streaming` pass through to the selected provider. A
    /// provider with no configured entry falls back to `ProviderConfig`'s
    /// defaults, which is only ever correct against a mock/local adapter.
    pub fn with_provider_configs(mut self, provider_configs: HashMap<String, ProviderConfig>) -> Self {
        self.provider_configs = provider_configs;
        self
    }

    fn lookup_provider(&self, provider_code: &str) -> Result<Arc<dyn LanguageModelProvider>, GatewayError> {
        self.registry.get(provider_code).ok_or_else(|| GatewayError::UnknownProvider(provider_code.to_string()))
    }

    fn provider_config(&self, provider_code: &str) -> ProviderConfig {
        self.provider_configs.get(provider_code).cloned().unwrap_or_default()
    }

    pub async fn call_unary(
        &self,
        scene_code: &str,
        messages: Vec<Message>,
        user_id: &str,
    ) -> Result<CompletionOutcome, GatewayError> {
        if scene_code.is_empty() {
            return Err(GatewayError::MissingSceneCode);
        }

        let request_id = Uuid::new_v4().to_string();
        let prompt = build_prompt_text(&messages);

        let mut guard = PersistOnDrop::new(
            self.store.clone(),
            CompletionRecord {
                request_id: request_id.clone(),
                scene_code: scene_code.to_string(),
                provider_code: String::new(),
                model_code: String::new(),
                prompt: prompt.clone(),
                completion: String::new(),
                input_tokens: 0,
                output_tokens: 0,
                total_tokens: 0,
                user_id: user_id.to_string(),
                response_time_secs: 0.0,
                status: 0,
                error_msg: None,
            },
        );

        let started = std::time::Instant::now();

        let bundle = match self.scenes.resolve(scene_code).await {
            Ok(b) => b,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                return Err(err.into());
            }
        };
        guard.record_mut().provider_code = bundle.provider_code.clone();
        guard.record_mut().model_code = bundle.model_code.clone();

        let provider = match self.lookup_provider(&bundle.provider_code) {
            Ok(p) => p,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                return Err(err);
            }
        };

        let request = CompletionRequest {
            messages,
            model_code: bundle.model_code.clone(),
            temperature: bundle.temperature,
            max_tokens: bundle.max_tokens,
            stream: false,
            config: self.provider_config(&bundle.provider_code),
        };

        let response = match provider.call(&request).await {
            Ok(r) => r,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                guard.record_mut().response_time_secs = started.elapsed().as_secs_f64();
                return Err(err.into());
            }
        };

        let usage = if response.usage.is_zero() {
            let input_tokens = estimate_tokens(&prompt);
            let output_tokens = estimate_tokens(&response.content);
            TokenUsage { input_tokens, output_tokens, total_tokens: input_tokens + output_tokens }
        } else {
            response.usage.clone()
        };

        let record = guard.record_mut();
        record.completion = response.content.clone();
        record.input_tokens = usage.input_tokens;
        record.output_tokens = usage.output_tokens;
        record.total_tokens = usage.total_tokens;
        record.status = 1;
        record.response_time_secs = started.elapsed().as_secs_f64();

        Ok(CompletionOutcome {
            request_id,
            content: response.content,
            usage,
            finish_reason: response.finish_reason,
        })
    }

    /// Streams a completion, forwarding each chunk to `sink`. `sink`
    /// returns `false` to signal that the caller can no longer accept
    /// chunks (a disconnected client, mirroring the Go original's `if err
    /// := stream.Send(...); err != nil { return ... }`); the loop then
    /// stops pulling from the provider but still persists whatever text
    /// had accumulated as a successful, partial completion.
    pub async fn call_streaming<F>(
        &self,
        scene_code: &str,
        messages: Vec<Message>,
        user_id: &str,
        mut sink: F,
    ) -> Result<CompletionOutcome, GatewayError>
    where
        F: FnMut(crate::provider::StreamChunk) -> bool,
    {
        if scene_code.is_empty() {
            return Err(GatewayError::MissingSceneCode);
        }

        let request_id = Uuid::new_v4().to_string();
        let prompt = build_prompt_text(&messages);

        let mut guard = PersistOnDrop::new(
            self.store.clone(),
            CompletionRecord {
                request_id: request_id.clone(),
                scene_code: scene_code.to_string(),
                provider_code: String::new(),
                model_code: String::new(),
                prompt: prompt.clone(),
                completion: String::new(),
                input_tokens: 0,
                output_tokens: 0,
                total_tokens: 0,
                user_id: user_id.to_string(),
                response_time_secs: 0.0,
                status: 0,
                error_msg: None,
            },
        );

        let started = std::time::Instant::now();

        let bundle = match self.scenes.resolve(scene_code).await {
            Ok(b) => b,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                return Err(err.into());
            }
        };
        guard.record_mut().provider_code = bundle.provider_code.clone();
        guard.record_mut().model_code = bundle.model_code.clone();

        if !bundle.enable_stream {
            let err = GatewayError::StreamingDisabled;
            guard.record_mut().error_msg = Some(err.to_string());
            return Err(err);
        }

        let provider = match self.lookup_provider(&bundle.provider_code) {
            Ok(p) => p,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                return Err(err);
            }
        };

        let request = CompletionRequest {
            messages,
            model_code: bundle.model_code.clone(),
            temperature: bundle.temperature,
            max_tokens: bundle.max_tokens,
            stream: true,
            config: self.provider_config(&bundle.provider_code),
        };

        let mut chunk_stream: ChunkStream = match provider.stream(&request).await {
            Ok(s) => s,
            Err(err) => {
                guard.record_mut().error_msg = Some(err.to_string());
                guard.record_mut().response_time_secs = started.elapsed().as_secs_f64();
                return Err(err.into());
            }
        };

        use futures::StreamExt;
        let mut accumulated = String::new();
        let mut final_usage: Option<TokenUsage> = None;
        let mut finish_reason = FinishReason::Stop;

        let mut disconnected = false;

        while let Some(item) = chunk_stream.next().await {
            match item {
                Ok(chunk) => {
                    accumulated.push_str(&chunk.delta);
                    if let Some(usage) = chunk.usage.clone() {
                        final_usage = Some(usage);
                    }
                    if chunk.finished {
                        finish_reason = chunk.finish_reason.clone();
                    }
                    let finished = chunk.finished;
                    if !sink(chunk) {
                        disconnected = true;
                        break;
                    }
                    if finished {
                        break;
                    }
                }
                Err(err) => {
                    guard.record_mut().completion = accumulated.clone();
                    guard.record_mut().error_msg = Some(err.to_string());
                    guard.record_mut().response_time_secs = started.elapsed().as_secs_f64();
                    return Err(err.into());
                }
            }
        }

        let usage = resolve_final_usage(&prompt, &accumulated, final_usage);

        let record = guard.record_mut();
        record.completion = accumulated.clone();
        record.input_tokens = usage.input_tokens;
        record.output_tokens = usage.output_tokens;
        record.total_tokens = usage.total_tokens;
        record.status = 1;
        record.response_time_secs = started.elapsed().as_secs_f64();

        if disconnected {
            finish_reason = FinishReason::Other("client_disconnected".to_string());
        }

        Ok(CompletionOutcome { request_id, content: accumulated, usage, finish_reason })
    }
}

/// Uses the provider's own reported usage when it gave one (and it's
/// nonzero), otherwise falls back to `estimate_tokens`. Shared by the
/// normal-completion and client-disconnect exits of `call_streaming`.
fn resolve_final_usage(prompt: &str, accumulated: &str, final_usage: Option<TokenUsage>) -> TokenUsage {
    match final_usage {
        Some(u) if !u.is_zero() => u,
        _ => {
            let input_tokens = estimate_tokens(prompt);
            let output_tokens = estimate_tokens(accumulated);
            TokenUsage { input_tokens, output_tokens, total_tokens: input_tokens + output_tokens }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionResponse, LanguageModelProvider, Role as R, StreamChunk};
    use crate::store::SceneRow;

    struct FakeStreamingProvider;

    #[async_trait::async_trait]
    impl LanguageModelProvider for FakeStreamingProvider {
        fn name(&self) -> &str {
            "fake-stream"
        }

        async fn call(&self, _req: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            unimplemented!("only the streaming path is exercised by this fake")
        }

        async fn stream(&self, _req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
            let chunks = vec![
                Ok(StreamChunk { delta: "he".into(), finished: false, usage: None, finish_reason: FinishReason::Stop }),
                Ok(StreamChunk { delta: "llo".into(), finished: false, usage: None, finish_reason: FinishReason::Stop }),
                Ok(StreamChunk { delta: " world".into(), finished: true, usage: None, finish_reason: FinishReason::Stop }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    #[test]
    fn prompt_text_renders_role_brackets() {
        let messages = vec![Message::system("be helpful"), Message::user("hi")];
        assert_eq!(build_prompt_text(&messages), "[system]: be helpful\n[user]: hi");
        let _ = R::System;
    }

    #[test]
    fn estimate_tokens_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimate_tokens_floors_to_one_for_short_text() {
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[tokio::test]
    async fn provider_config_falls_back_to_default_when_unconfigured() {
        let store = Arc::new(crate::store::Store::open(":memory:").unwrap());
        let scenes = Arc::new(SceneResolver::new(store.clone()));
        let registry = Arc::new(ProviderRegistry::with_defaults());
        let gateway = LmGateway::new(store, scenes, registry);
        assert_eq!(gateway.provider_config("unified").api_endpoint, "");
    }

    #[tokio::test]
    async fn provider_config_uses_configured_endpoint_and_key() {
        let store = Arc::new(crate::store::Store::open(":memory:").unwrap());
        let scenes = Arc::new(SceneResolver::new(store.clone()));
        let registry = Arc::new(ProviderRegistry::with_defaults());
        let mut configs = std::collections::HashMap::new();
        configs.insert(
            "unified".to_string(),
            ProviderConfig { api_endpoint: "https://api.example.com".into(), api_key: "sk-test".into(), ..Default::default() },
        );
        let gateway = LmGateway::new(store, scenes, registry).with_provider_configs(configs);
        let config = gateway.provider_config("unified");
        assert_eq!(config.api_endpoint, "https://api.example.com");
        assert_eq!(config.api_key, "sk-test");
    }

    #[tokio::test]
    async fn call_streaming_stops_early_when_sink_reports_disconnect() {
        let store = Arc::new(crate::store::Store::open(":memory:").unwrap());
        store
            .upsert_scene(SceneRow {
                scene_code: "chat".into(),
                provider_code: "fake-stream".into(),
                model_code: "fake-model".into(),
                temperature: 0.7,
                max_tokens: 1024,
                enable_stream: true,
                system_prompt: "system".into(),
            })
            .await
            .unwrap();

        let scenes = Arc::new(SceneResolver::new(store.clone()));
        let registry = Arc::new(ProviderRegistry::new().register(FakeStreamingProvider));
        let gateway = LmGateway::new(store, scenes, registry);

        let mut seen = Vec::new();
        let outcome = gateway
            .call_streaming("chat", vec![Message::user("hi")], "user-1", |chunk| {
                seen.push(chunk.delta);
                false
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["he".to_string()]);
        assert_eq!(outcome.content, "he");
        assert_eq!(outcome.finish_reason, FinishReason::Other("client_disconnected".to_string()));
    }

    #[tokio::test]
    async fn call_streaming_runs_to_completion_when_sink_keeps_accepting() {
        let store = Arc::new(crate::store::Store::open(":memory:").unwrap());
        store
            .upsert_scene(SceneRow {
                scene_code: "chat".into(),
                provider_code: "fake-stream".into(),
                model_code: "fake-model".into(),
                temperature: 0.7,
                max_tokens: 1024,
                enable_stream: true,
                system_prompt: "system".into(),
            })
            .await
            .unwrap();

        let scenes = Arc::new(SceneResolver::new(store.clone()));
        let registry = Arc::new(ProviderRegistry::new().register(FakeStreamingProvider));
        let gateway = LmGateway::new(store, scenes, registry);

        let outcome = gateway.call_streaming("chat", vec![Message::user("hi")], "user-1", |_chunk| true).await.unwrap();

        assert_eq!(outcome.content, "hello world");
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn estimate_tokens_matches_worked_example_for_all_cjk_text() {
        let text: String = std::iter::repeat('\u{4e2d}').take(1000).collect();
        assert_eq!(estimate_tokens(&text), 666);
    }

    #[test]
    fn estimate_tokens_mixed_text_counts_each_bucket_separately() {
        let text = format!("{}{}", "\u{4e2d}".repeat(10), "a".repeat(8));
        // 10 CJK / 1.5 = 6.67, 8 other / 4 = 2.0 -> floor(8.67) = 8
        assert_eq!(estimate_tokens(&text), 8);
    }
}
