//! Chat orchestration: session lifecycle, query expansion, concurrent
//! retrieval fan-out, prompt assembly, and streamed completion.

use crate::gateway::{GatewayError, LmGateway};
use crate::provider::{EmbeddingProvider, Message, StreamChunk, TokenUsage, VectorStoreProvider};
use crate::scene::{ResolveError, SceneResolver};
use crate::store::{ChatSession, Store, StoreError};
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const TOP_K: usize = 3;
const MIN_SCORE: f32 = 0.5;

const QUERY_EXPANSION_SYSTEM_PROMPT: &str = "你是一个专业的查询扩展助手。请将用户的问题扩展为多个相关的检索关键词或短语，\n以提高向量检索的召回率。\n\n要求：\n1. 提取用户问题中的核心概念、同义词、相关术语\n2. 生成3-8个检索关键词或短语\n3. 返回JSON格式：{\"key_sentences\": [\"关键词1\", \"关键词2\", ...]}\n4. 只返回JSON，不要其他解释文字";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("message must not be empty")]
    Validation,

    #[error("session {0} belongs to a different scene")]
    SceneMismatch(i64),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upstream language model error: {0}")]
    Upstream(#[from] GatewayError),
}

/// Cooperative cancellation flag, checked at await points rather than
/// threaded through every future as a `Future` combinator — sufficient
/// since this crate never needs to interrupt an in-flight await, only to
/// skip starting the next best-effort step once the caller has moved on.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct UsageBlock {
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct ChatStreamChunk {
    pub session_id: i64,
    pub scene_code: String,
    pub delta: String,
    pub finished: bool,
    pub usage: Option<UsageBlock>,
}

#[derive(Debug, Clone)]
struct ExpansionResult {
    key_sentences: Vec<String>,
}

#[derive(serde::Deserialize)]
struct ExpansionPayload {
    key_sentences: Vec<String>,
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed.strip_prefix("```json").or_else(|| trimmed.strip_prefix("```")).unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Pulls every double-quoted substring out of `text`, used when the model
/// doesn't return valid JSON but still emits quoted phrases.
fn extract_quoted_fallback(text: &str) -> Vec<String> {
    let mut results = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            let mut buf = String::new();
            for next in chars.by_ref() {
                if next == '"' {
                    break;
                }
                buf.push(next);
            }
            if !buf.is_empty() {
                results.push(buf);
            }
        }
    }
    results
}

fn parse_expansion(raw: &str) -> ExpansionResult {
    let candidate = strip_code_fence(raw);

    if let Ok(payload) = serde_json::from_str::<ExpansionPayload>(candidate) {
        if !payload.key_sentences.is_empty() {
            return ExpansionResult { key_sentences: payload.key_sentences };
        }
    }

    let quoted = extract_quoted_fallback(candidate);
    if !quoted.is_empty() {
        return ExpansionResult { key_sentences: quoted };
    }

    let comma_split: Vec<String> =
        candidate.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    ExpansionResult { key_sentences: comma_split }
}

pub struct ChatOrchestrator {
    gateway: Arc<LmGateway>,
    scenes: Arc<SceneResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStoreProvider>,
    store: Arc<Store>,
}

impl ChatOrchestrator {
    pub fn new(
        gateway: Arc<LmGateway>,
        scenes: Arc<SceneResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStoreProvider>,
        store: Arc<Store>,
    ) -> Self {
        Self { gateway, scenes, embedder, vector_store, store }
    }

    async fn ensure_session(
        &self,
        session_id: Option<i64>,
        scene_code: &str,
        user_id: &str,
    ) -> Result<ChatSession, OrchestratorError> {
        if let Some(id) = session_id {
            if let Some(session) = self.store.find_session(id).await? {
                if session.scene_code != scene_code {
                    return Err(OrchestratorError::SceneMismatch(id));
                }
                return Ok(session);
            }
            // Not found: fall through to creation, silently, per the
            // original's "recover from a stale session id" behavior.
        }

        let name = format!("Chat-{}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let new_id = self.store.create_session(name.clone(), scene_code.to_string(), user_id.to_string()).await?;
        Ok(ChatSession { id: new_id, name, scene_code: scene_code.to_string(), user_id: user_id.to_string(), is_active: true })
    }

    async fn expand_query(&self, scene_code: &str, user_message: &str, user_id: &str) -> Vec<String> {
        let messages = vec![Message::system(QUERY_EXPANSION_SYSTEM_PROMPT), Message::user(user_message)];
        match self.gateway.call_unary(scene_code, messages, user_id).await {
            Ok(outcome) => parse_expansion(&outcome.content).key_sentences,
            Err(err) => {
                log::warn!("query expansion failed, proceeding without probes: {err}");
                Vec::new()
            }
        }
    }

    async fn retrieve(&self, collection: &str, probes: &[String]) -> Vec<String> {
        if probes.is_empty() {
            return Vec::new();
        }

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        for probe in probes.iter().cloned() {
            let embedder = self.embedder.clone();
            let vector_store = self.vector_store.clone();
            let lines = lines.clone();
            let collection = collection.to_string();

            tasks.push(tokio::spawn(async move {
                let vector = match embedder.embed(&probe).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::warn!("embedding probe '{probe}' failed, skipping: {err}");
                        return;
                    }
                };

                let results = match vector_store.search(&collection, &vector, TOP_K, MIN_SCORE).await {
                    Ok(r) => r,
                    Err(err) => {
                        log::warn!("vector search for probe '{probe}' failed, skipping: {err}");
                        return;
                    }
                };

                let mut guard = lines.lock().await;
                for result in results.into_iter().filter(|r| r.score >= MIN_SCORE) {
                    guard.push(format!("相关内容 (相似度: {:.2}): {}", result.score, result.content));
                }
            }));
        }

        futures::future::join_all(tasks).await;
        Arc::try_unwrap(lines).map(|m| m.into_inner()).unwrap_or_default()
    }

    /// Drives one full conversational turn, forwarding stream chunks to
    /// `sink` and performing the best-effort session bookkeeping afterward.
    pub async fn chat_stream<F>(
        &self,
        session_id: Option<i64>,
        scene_code: &str,
        user_message: &str,
        user_id: &str,
        collection: &str,
        cancellation: Cancellation,
        mut sink: F,
    ) -> Result<(), OrchestratorError>
    where
        F: FnMut(ChatStreamChunk) -> bool,
    {
        if user_message.trim().is_empty() {
            return Err(OrchestratorError::Validation);
        }
        if scene_code.is_empty() {
            return Err(OrchestratorError::Validation);
        }

        let scene = self.scenes.resolve(scene_code).await?;
        let session = self.ensure_session(session_id, scene_code, user_id).await?;

        let probes = self.expand_query(scene_code, user_message, user_id).await;
        let retrieval_lines = self.retrieve(collection, &probes).await;
        let retrieval_block = retrieval_lines.join("\n");

        let messages = vec![
            Message::system(scene.system_prompt.clone()),
            Message::system(String::new()), // reserved memory block; empty in this design
            Message::system(retrieval_block),
            Message::user(user_message),
        ];

        let session_id = session.id;
        let scene_code_owned = scene_code.to_string();
        let disconnect_cancellation = cancellation.clone();

        let outcome = self
            .gateway
            .call_streaming(scene_code, messages, user_id, |chunk: StreamChunk| {
                let usage = if chunk.finished && chunk.usage.is_some() {
                    chunk.usage.clone().map(|usage| UsageBlock { usage })
                } else {
                    None
                };
                let keep_going = sink(ChatStreamChunk {
                    session_id,
                    scene_code: scene_code_owned.clone(),
                    delta: chunk.delta,
                    finished: chunk.finished,
                    usage,
                });
                if !keep_going || disconnect_cancellation.is_cancelled() {
                    disconnect_cancellation.cancel();
                    false
                } else {
                    true
                }
            })
            .await?;
        let _ = outcome;

        if !cancellation.is_cancelled() {
            if let Err(err) = self.store.touch_session_interact_time(session_id).await {
                log::warn!("failed to touch session interact time for session {session_id}: {err}");
            }

            let sequence_num = Local::now().timestamp();
            if let Err(err) = self.store.insert_qa_marker(session_id, sequence_num, 0).await {
                log::warn!("failed to insert QA marker for session {session_id}: {err}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_markers() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn parse_expansion_prefers_valid_json() {
        let result = parse_expansion("```json\n{\"key_sentences\": [\"a\", \"b\"]}\n```");
        assert_eq!(result.key_sentences, vec!["a", "b"]);
    }

    #[test]
    fn parse_expansion_falls_back_to_quoted_substrings() {
        let result = parse_expansion("not json but \"alpha\" and \"beta\" are here");
        assert_eq!(result.key_sentences, vec!["alpha", "beta"]);
    }

    #[test]
    fn parse_expansion_falls_back_to_comma_split() {
        let result = parse_expansion("alpha, beta , gamma");
        assert_eq!(result.key_sentences, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn parse_expansion_empty_text_yields_zero_probes() {
        let result = parse_expansion("");
        assert!(result.key_sentences.is_empty());
    }

    #[test]
    fn cancellation_flag_reads_back_after_cancel() {
        let token = Cancellation::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
