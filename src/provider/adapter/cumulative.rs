//! Adapter B: cumulative-text SSE endpoint (Bailian-shaped).
//!
//! Each `data:` line carries the full accumulated text so far, not a delta.
//! The reader keeps a per-stream `previous_text` cursor and computes
//! `delta = current[previous_text.len()..]`, updating the cursor even when
//! the delta is empty — the model can advance `finish_reason` without
//! emitting new characters.

use crate::provider::language_model::*;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

pub struct CumulativeTextProvider {
    client: reqwest::Client,
}

impl CumulativeTextProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for CumulativeTextProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    input: Input<'a>,
    parameters: Parameters,
}

#[derive(Serialize)]
struct Input<'a> {
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Parameters {
    temperature: f64,
    max_tokens: i64,
    top_p: f64,
    top_k: u32,
    #[serde(skip_serializing_if = "is_false")]
    stream: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Deserialize)]
struct UnaryResponse {
    output: Output,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Output {
    text: String,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Deserialize)]
struct StreamEnvelope {
    output: StreamOutput,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Deserialize, Clone)]
struct Usage {
    input_tokens: i64,
    output_tokens: i64,
}

/// `finish_reason` is non-terminal when absent, empty, or the literal string
/// `"null"` — the provider sometimes serializes a JSON null as text.
fn is_terminal(finish_reason: &str) -> bool {
    !finish_reason.is_empty() && finish_reason != "null"
}

fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

#[async_trait::async_trait]
impl LanguageModelProvider for CumulativeTextProvider {
    fn name(&self) -> &str {
        "cumulative"
    }

    async fn call(&self, req: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let body = Request {
            model: &req.model_code,
            input: Input {
                messages: req
                    .messages
                    .iter()
                    .map(|m| WireMessage { role: m.role.as_str(), content: &m.content })
                    .collect(),
            },
            parameters: Parameters {
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                top_p: 0.8,
                top_k: 50,
                stream: false,
            },
        };

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
        if parsed.output.text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: parsed.output.text,
            model_code: req.model_code.clone(),
            usage,
            finish_reason: map_finish_reason(&parsed.output.finish_reason),
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let body = Request {
            model: &req.model_code,
            input: Input {
                messages: req
                    .messages
                    .iter()
                    .map(|m| WireMessage { role: m.role.as_str(), content: &m.content })
                    .collect(),
            },
            parameters: Parameters {
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                top_p: 0.8,
                top_k: 50,
                stream: true,
            },
        };

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
            let mut previous_text = String::new();

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

                let envelope: StreamEnvelope = match serde_json::from_str(&event.data) {
                    Ok(envelope) => envelope,
                    Err(_) => continue,
                };

                let text = envelope.output.text;
                let delta = if text.len() > previous_text.len() {
                    text[previous_text.len()..].to_string()
                } else {
                    String::new()
                };
                previous_text = text;

                let finished = is_terminal(&envelope.output.finish_reason);
                if finished {
                    let usage = envelope.usage.map(|u| TokenUsage {
                        input_tokens: u.input_tokens,
                        output_tokens: u.output_tokens,
                        total_tokens: u.input_tokens + u.output_tokens,
                    });
                    yield Ok(StreamChunk {
                        delta,
                        finished: true,
                        usage,
                        finish_reason: map_finish_reason(&envelope.output.finish_reason),
                    });
                    return;
                }

                if !delta.is_empty() {
                    yield Ok(StreamChunk {
                        delta,
                        finished: false,
                        usage: None,
                        finish_reason: FinishReason::Other(String::new()),
                    });
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
    fn terminal_check_accepts_absent_and_null() {
        assert!(!is_terminal(""));
        assert!(!is_terminal("null"));
        assert!(is_terminal("stop"));
        assert!(is_terminal("length"));
    }

    #[test]
    fn cursor_advances_on_growing_cumulative_text() {
        let chunks = ["H", "He", "Hel", "Hello"];
        let mut previous = String::new();
        let mut deltas = Vec::new();
        for text in chunks {
            let delta = if text.len() > previous.len() {
                text[previous.len()..].to_string()
            } else {
                String::new()
            };
            previous = text.to_string();
            deltas.push(delta);
        }
        assert_eq!(deltas, vec!["H", "e", "l", "lo"]);
        assert_eq!(previous, "Hello");
    }

    #[test]
    fn cursor_holds_steady_on_zero_length_delta() {
        let mut previous = "Hello".to_string();
        let text = "Hello".to_string();
        let delta = if text.len() > previous.len() {
            text[previous.len()..].to_string()
        } else {
            String::new()
        };
        previous = text;
        assert_eq!(delta, "");
        assert_eq!(previous, "Hello");
    }
}
