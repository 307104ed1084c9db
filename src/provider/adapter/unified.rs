//! Adapter A: unified OpenAI-compatible chat-completions endpoint.
//!
//! `choices[0].delta.content` is forwarded verbatim as the delta; the stream
//! is finished once `choices[0].finish_reason` is non-empty, or on `[DONE]`.

use crate::provider::language_model::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

pub struct UnifiedChatProvider {
    client: reqwest::Client,
}

impl UnifiedChatProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for UnifiedChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: i64,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Clone)]
struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
}

#[derive(Deserialize)]
struct UnaryResponse {
    choices: Vec<UnaryChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct UnaryChoice {
    message: UnaryMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct UnaryMessage {
    #[serde(default)]
    content: String,
}

fn map_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        None | Some("") => FinishReason::Other(String::new()),
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}

fn build_request<'a>(req: &'a CompletionRequest) -> Request<'a> {
    Request {
        model: &req.model_code,
        messages: req
            .messages
            .iter()
            .map(|m| WireMessage { role: m.role.as_str(), content: &m.content })
            .collect(),
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream: req.stream,
    }
}

#[async_trait::async_trait]
impl LanguageModelProvider for UnifiedChatProvider {
    fn name(&self) -> &str {
        "unified"
    }

    async fn call(&self, req: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut body = build_request(req);
        body.stream = false;

        let response = self
            .client
            .post(&req.config.api_endpoint)
            .bearer_auth(&req.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let parsed: UnaryResponse = response.json().await.map_err(ProviderError::Network)?;
        let choice = parsed.choices.into_iter().next().ok_or(ProviderError::EmptyResponse)?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.prompt_tokens + u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content,
            model_code: req.model_code.clone(),
            usage,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let mut body = build_request(req);
        body.stream = true;

        let response = self
            .client
            .post(&req.config.api_endpoint)
            .bearer_auth(&req.config.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        yield Err(ProviderError::Other(format!("stream error: {err}")));
                        break;
                    }
                };

                if event.data.trim().is_empty() {
                    continue;
                }
                if event.data == "[DONE]" {
                    yield Ok(StreamChunk {
                        delta: String::new(),
                        finished: true,
                        usage: None,
                        finish_reason: FinishReason::Stop,
                    });
                    break;
                }

                let chunk: Chunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(ProviderError::Decode(err));
                        break;
                    }
                };

                if chunk.choices.is_empty() {
                    if let Some(usage) = chunk.usage {
                        yield Ok(StreamChunk {
                            delta: String::new(),
                            finished: true,
                            usage: Some(TokenUsage {
                                input_tokens: usage.prompt_tokens,
                                output_tokens: usage.completion_tokens,
                                total_tokens: usage.prompt_tokens + usage.completion_tokens,
                            }),
                            finish_reason: FinishReason::Stop,
                        });
                    }
                    continue;
                }

                for choice in chunk.choices {
                    let finished = matches!(choice.finish_reason.as_deref(), Some(reason) if !reason.is_empty());
                    yield Ok(StreamChunk {
                        delta: choice.delta.content.unwrap_or_default(),
                        finished,
                        usage: None,
                        finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
                    });
                    if finished {
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_maps_known_values() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("content_filter")), FinishReason::ContentFilter);
        assert_eq!(map_finish_reason(Some("")), FinishReason::Other(String::new()));
        assert_eq!(map_finish_reason(None), FinishReason::Other(String::new()));
    }

    #[test]
    fn chunk_without_choices_parses_as_usage_only() {
        let raw = r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let chunk: Chunk = serde_json::from_str(raw).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 7);
    }
}
