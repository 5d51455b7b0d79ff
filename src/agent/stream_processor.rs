//! Stream processor: turns a provider's chunk stream into one parsed
//! iteration outcome, emitting presentation events along the way per the
//! Idle/Thinking/Message/ToolCallBuffer state machine.

use futures::StreamExt;
use tokio::sync::broadcast;

use super::event::Event;
use super::parser::{self, ToolCall};
use super::provider::{ChunkKind, StreamBox};
use crate::error::ForgeError;

const TOOL_PREFIX: &str = "<tool";

/// What one iteration's stream resolved to.
pub enum IterationOutcome {
    /// No tool call was produced; `text` is the persisted assistant content.
    MessageOnly { text: String },
    /// A tool call was parsed; `raw_text` is the assistant content (the
    /// `<tool>`-bearing message, thinking excluded) to persist verbatim.
    ToolCall { call: ToolCall, raw_text: String },
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum State {
    Idle,
    Thinking,
    Message,
    ToolCallBuffer,
}

/// Drive `stream` to completion, emitting events on `events` and returning
/// the iteration's parsed outcome. Provider-level errors (network failure,
/// cancellation) propagate directly as `Err`.
pub async fn run(
    events: &broadcast::Sender<Event>,
    mut stream: StreamBox,
) -> Result<IterationOutcome, ForgeError> {
    let mut state = State::Idle;
    let mut message_buf = String::new();
    let mut tool_call_start_emitted = false;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if chunk.finished {
            break;
        }

        match chunk.kind {
            ChunkKind::Thinking => {
                if state == State::Idle {
                    let _ = events.send(Event::ThinkingStart);
                    state = State::Thinking;
                }
                let _ = events.send(Event::ThinkingChunk(chunk.content_delta));
            }
            ChunkKind::Message => {
                if state == State::Thinking {
                    let _ = events.send(Event::ThinkingEnd);
                    state = State::Idle;
                }

                if state == State::Idle {
                    state = if chunk.content_delta.trim_start().starts_with(TOOL_PREFIX) {
                        State::ToolCallBuffer
                    } else {
                        let _ = events.send(Event::MessageStart);
                        State::Message
                    };
                }

                match state {
                    State::Message => {
                        message_buf.push_str(&chunk.content_delta);
                        let _ = events.send(Event::MessageChunk(chunk.content_delta));
                    }
                    State::ToolCallBuffer => {
                        message_buf.push_str(&chunk.content_delta);
                        if !tool_call_start_emitted {
                            if let Some(name) = parser::early_detect_tool_name(&message_buf) {
                                let _ = events.send(Event::ToolCallStart {
                                    tool_name: Some(name),
                                    partial_args: None,
                                });
                                tool_call_start_emitted = true;
                            }
                        }
                        if let Some((start, end)) = parser::find_tool_block(&message_buf) {
                            let block = &message_buf[start..end];
                            let call = parser::parse_tool_call(block)?;
                            let raw_text = message_buf[..end].to_string();
                            if !tool_call_start_emitted {
                                let _ = events.send(Event::ToolCallStart {
                                    tool_name: Some(call.tool_name.clone()),
                                    partial_args: None,
                                });
                            }
                            // The target tool's schema isn't known here (the
                            // registry lookup happens later, in dispatch); decode
                            // with the untyped heuristic purely for this preview
                            // event, then re-decode schema-aware at dispatch time.
                            let _ = events.send(Event::ToolCall {
                                name: call.tool_name.clone(),
                                args: parser::decode_arguments(&call.arguments_xml, None)
                                    .unwrap_or(serde_json::Value::Null),
                            });
                            return Ok(IterationOutcome::ToolCall { call, raw_text });
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    match state {
        State::Thinking => {
            let _ = events.send(Event::ThinkingEnd);
        }
        State::ToolCallBuffer => {
            return Err(ForgeError::MalformedToolCall(
                "stream ended before </tool> closed".to_string(),
            ));
        }
        _ => {}
    }

    if state == State::Idle && !message_buf.is_empty() {
        let _ = events.send(Event::MessageStart);
    }
    let _ = events.send(Event::MessageEnd);
    Ok(IterationOutcome::MessageOnly { text: message_buf })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::StreamChunk;
    use futures::stream;

    fn make_stream(chunks: Vec<Result<StreamChunk, ForgeError>>) -> StreamBox {
        Box::pin(stream::iter(chunks))
    }

    fn msg(text: &str) -> Result<StreamChunk, ForgeError> {
        Ok(StreamChunk {
            content_delta: text.to_string(),
            kind: ChunkKind::Message,
            finished: false,
        })
    }

    fn thinking(text: &str) -> Result<StreamChunk, ForgeError> {
        Ok(StreamChunk {
            content_delta: text.to_string(),
            kind: ChunkKind::Thinking,
            finished: false,
        })
    }

    #[tokio::test]
    async fn message_only_outcome() {
        let (tx, mut rx) = broadcast::channel(64);
        let stream = make_stream(vec![msg("Hello"), msg(", world!")]);
        let outcome = run(&tx, stream).await.unwrap();
        match outcome {
            IterationOutcome::MessageOnly { text } => assert_eq!(text, "Hello, world!"),
            _ => panic!("expected message-only outcome"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Event::MessageStart));
    }

    #[tokio::test]
    async fn tool_call_outcome() {
        let (tx, _rx) = broadcast::channel(64);
        let stream = make_stream(vec![msg(
            "<tool><tool_name>converse</tool_name><arguments><message>hi</message></arguments></tool>",
        )]);
        let outcome = run(&tx, stream).await.unwrap();
        match outcome {
            IterationOutcome::ToolCall { call, .. } => assert_eq!(call.tool_name, "converse"),
            _ => panic!("expected tool-call outcome"),
        }
    }

    #[tokio::test]
    async fn thinking_then_message() {
        let (tx, mut rx) = broadcast::channel(64);
        let stream = make_stream(vec![thinking("pondering..."), msg("done")]);
        let outcome = run(&tx, stream).await.unwrap();
        assert!(matches!(outcome, IterationOutcome::MessageOnly { text } if text == "done"));
        assert!(matches!(rx.recv().await.unwrap(), Event::ThinkingStart));
        assert!(matches!(rx.recv().await.unwrap(), Event::ThinkingChunk(_)));
        assert!(matches!(rx.recv().await.unwrap(), Event::ThinkingEnd));
    }

    #[tokio::test]
    async fn tool_call_start_emitted_once() {
        let (tx, mut rx) = broadcast::channel(64);
        let stream = make_stream(vec![
            msg("<tool><tool_name>conv"),
            msg("erse</tool_name><arguments></arguments></tool>"),
        ]);
        let _ = run(&tx, stream).await.unwrap();
        let mut starts = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::ToolCallStart { .. }) {
                starts += 1;
            }
        }
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let (tx, _rx) = broadcast::channel(64);
        let stream = make_stream(vec![Err(ForgeError::Cancelled)]);
        let result = run(&tx, stream).await;
        assert!(matches!(result, Err(ForgeError::Cancelled)));
    }
}
