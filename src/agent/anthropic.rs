//! Reference `Provider` implementation: Anthropic's Messages API.
//!
//! Tool invocation is carried purely as `<tool>` markup inside ordinary text
//! deltas (see `agent::parser`) rather than Anthropic's native `tool_use`
//! content blocks, so every `text_delta`/`thinking_delta` SSE event becomes a
//! [`super::provider::StreamChunk`] and `tool_use` blocks are never
//! requested or special-cased. SSE framing uses `eventsource-stream`.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::cancel::CancellationToken;
use super::message::{Message, Role};
use super::provider::{ChunkKind, Provider, ProviderModelInfo, StreamBox, StreamChunk};
use crate::error::ForgeError;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    http_client: reqwest::Client,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            api_key: api_key.into(),
            http_client: reqwest::Client::new(),
            model: model.into(),
            max_tokens,
        }
    }

    fn build_request_body(&self, messages: &[Message], stream: bool) -> serde_json::Value {
        let system: Vec<&Message> = messages.iter().filter(|m| m.role == Role::System).collect();
        let system_text = system
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::User | Role::Tool => "user",
                    Role::Assistant => "assistant",
                    Role::System => unreachable!(),
                };
                json!({
                    "role": role,
                    "content": [{"type": "text", "text": m.content}],
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": self.max_tokens,
            "stream": stream,
        });

        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }

        body
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http_client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_info(&self) -> ProviderModelInfo {
        ProviderModelInfo {
            name: self.model.clone(),
            max_tokens: self.max_tokens,
            supports_streaming: true,
        }
    }

    async fn complete(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<String, ForgeError> {
        let body = self.build_request_body(&messages, false);

        let response = tokio::select! {
            result = self.request(&body).send() => {
                result.map_err(|e| ForgeError::ProviderFailure(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_error_response(status.as_u16(), &text));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::ProviderFailure(e.to_string()))?;

        let text = parsed
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(text)
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<StreamBox, ForgeError> {
        let body = self.build_request_body(&messages, true);

        let response = tokio::select! {
            result = self.request(&body).send() => {
                result.map_err(|e| ForgeError::ProviderFailure(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(parse_error_response(status.as_u16(), &text));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, ForgeError>>(32);
        let mut event_stream = response.bytes_stream().eventsource();
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_task.cancelled() => {
                        let _ = tx.send(Err(ForgeError::Cancelled)).await;
                        break;
                    }
                    next = event_stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                if let Some(chunk) = parse_sse_event(&event.event, &event.data) {
                                    let done = chunk.finished;
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        break;
                                    }
                                    if done {
                                        break;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                let _ = tx.send(Err(ForgeError::ProviderFailure(e.to_string()))).await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let stream: StreamBox = Box::pin(ReceiverStream::new(rx));
        Ok(stream)
    }
}

/// Translate one decoded SSE event into a [`StreamChunk`], if it carries
/// content this core cares about. `thinking_delta` becomes a `Thinking`
/// chunk, `text_delta` a `Message` chunk; `message_stop` marks the stream
/// finished; everything else (pings, block start/stop, usage deltas) is
/// dropped.
fn parse_sse_event(event_type: &str, data: &str) -> Option<StreamChunk> {
    if data.is_empty() {
        return None;
    }
    let json: serde_json::Value = serde_json::from_str(data).ok()?;

    match event_type {
        "content_block_delta" => {
            let delta = &json["delta"];
            match delta["type"].as_str()? {
                "text_delta" => Some(StreamChunk {
                    content_delta: delta["text"].as_str()?.to_string(),
                    kind: ChunkKind::Message,
                    finished: false,
                }),
                "thinking_delta" => Some(StreamChunk {
                    content_delta: delta["thinking"].as_str()?.to_string(),
                    kind: ChunkKind::Thinking,
                    finished: false,
                }),
                _ => None,
            }
        }
        "message_stop" => Some(StreamChunk {
            content_delta: String::new(),
            kind: ChunkKind::Message,
            finished: true,
        }),
        "error" => {
            let _ = json; // message carried via returned error at call site
            None
        }
        _ => None,
    }
}

fn parse_error_response(status: u16, body: &str) -> ForgeError {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let message = json["error"]["message"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string();
        ForgeError::ProviderFailure(format!("{status}: {message}"))
    } else {
        ForgeError::ProviderFailure(format!("{status}: {body}"))
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let data = r#"{"delta":{"type":"text_delta","text":"Hello"}}"#;
        let chunk = parse_sse_event("content_block_delta", data).unwrap();
        assert_eq!(chunk.content_delta, "Hello");
        assert_eq!(chunk.kind, ChunkKind::Message);
        assert!(!chunk.finished);
    }

    #[test]
    fn parses_thinking_delta() {
        let data = r#"{"delta":{"type":"thinking_delta","thinking":"pondering"}}"#;
        let chunk = parse_sse_event("content_block_delta", data).unwrap();
        assert_eq!(chunk.kind, ChunkKind::Thinking);
    }

    #[test]
    fn message_stop_marks_finished() {
        let chunk = parse_sse_event("message_stop", "{}").unwrap();
        assert!(chunk.finished);
    }

    #[test]
    fn ping_event_is_ignored() {
        assert!(parse_sse_event("ping", "{}").is_none());
    }

    #[test]
    fn parses_error_body() {
        let body = r#"{"error":{"type":"authentication_error","message":"bad key"}}"#;
        let err = parse_error_response(401, body);
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn build_request_body_separates_system_text() {
        let provider = AnthropicProvider::new("key", "claude-sonnet-4-5-20250929", 4096);
        let messages = vec![
            Message::system("You are Forge.".to_string(), chrono::Utc::now()),
            Message::user("Hi".to_string(), chrono::Utc::now()),
        ];
        let body = provider.build_request_body(&messages, true);
        assert_eq!(body["system"], "You are Forge.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
