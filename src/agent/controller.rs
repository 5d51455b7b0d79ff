//! Agent loop controller.
//!
//! Owns the memory, prompt builder, provider, tool registry, and approval
//! gate, driven by one `run_turn` call per user input rather than a
//! hand-rolled poll loop, since there is no UI thread to hand control back
//! to between iterations.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;

use super::cancel::CancellationToken;
use super::context_strategies::ContextStrategies;
use super::event::Event;
use super::memory::Memory;
use super::message::Message;
use super::prompt::PromptBuilder;
use super::provider::Provider;
use super::stream_processor::{self, IterationOutcome};
use super::tools::{Dispatcher, ToolRegistry};
use crate::config::{ContextConfig, LoopLimits};
use crate::error::ForgeError;

/// Ring size for the circuit breaker's consecutive-identical-failure check.
const ERROR_RING_SIZE: usize = 5;

/// Outcome of a completed turn.
pub enum TurnOutcome {
    /// A loop-breaking tool produced this final text.
    Ok(String),
    /// The turn ended fatally: provider failure, cancellation, repeated
    /// identical errors, or the iteration cap.
    Fatal(ForgeError),
}

/// Orchestrates C3-C9 for one user turn.
pub struct AgentLoopController {
    memory: Arc<Memory>,
    prompt_builder: PromptBuilder,
    provider: Arc<dyn Provider>,
    dispatcher: Dispatcher,
    context_strategies: ContextStrategies,
    events: broadcast::Sender<Event>,
    loop_limits: LoopLimits,
    model: String,
}

impl AgentLoopController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory: Arc<Memory>,
        prompt_builder: PromptBuilder,
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn super::approval::ApprovalGate>,
        context_config: ContextConfig,
        loop_limits: LoopLimits,
        model: impl Into<String>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry, approval, events.clone());
        let context_strategies =
            ContextStrategies::new(context_config, memory.clone(), provider.clone(), events.clone());
        Self {
            memory,
            prompt_builder,
            provider,
            dispatcher,
            context_strategies,
            events,
            loop_limits,
            model,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Run one full turn to completion: append the user's input, loop
    /// through iterations until a loop-breaking tool fires or a limit
    /// trips, applying context strategies between iterations.
    pub async fn run_turn(&self, user_text: impl Into<String>, cancel: CancellationToken) -> TurnOutcome {
        self.memory.append(Message::user(user_text.into(), Utc::now()));
        let _ = self.events.send(Event::TurnStart);

        let mut error_context: Option<String> = None;
        let mut error_ring: VecDeque<u64> = VecDeque::with_capacity(ERROR_RING_SIZE);

        for iteration in 1..=self.loop_limits.max_iterations {
            let _ = self.events.send(Event::IterationStart { iteration });

            if cancel.is_cancelled() {
                return TurnOutcome::Fatal(ForgeError::Cancelled);
            }

            let tools = self.dispatcher.registry().schemas();
            let prompt_text = self.prompt_builder.build(&tools, error_context.as_deref());
            let mut turn_messages = vec![Message::system(prompt_text, Utc::now())];
            turn_messages.extend(self.memory.get_all().into_iter().filter(|m| m.role != super::message::Role::System));

            let stream = match self.provider.stream(turn_messages, cancel.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = self.events.send(Event::Error {
                        kind: "provider".to_string(),
                        detail: e.to_string(),
                    });
                    let _ = self.events.send(Event::TurnEnd);
                    return TurnOutcome::Fatal(e);
                }
            };

            let outcome = stream_processor::run(&self.events, stream).await;

            match outcome {
                Err(e) => {
                    let _ = self.events.send(Event::Error {
                        kind: "provider".to_string(),
                        detail: e.to_string(),
                    });
                    let _ = self.events.send(Event::TurnEnd);
                    return TurnOutcome::Fatal(e);
                }
                Ok(IterationOutcome::MessageOnly { text }) => {
                    self.memory.append(Message::assistant(text, Utc::now()));
                    let err = ForgeError::NoToolCall;
                    error_context = Some(err.render_context());
                    if let Some(fatal) = self.track_error(&mut error_ring, err) {
                        let _ = self.events.send(Event::TurnEnd);
                        return TurnOutcome::Fatal(fatal);
                    }
                }
                Ok(IterationOutcome::ToolCall { call, raw_text }) => {
                    self.memory.append(Message::assistant(raw_text, Utc::now()));
                    let tool_name = call.tool_name.clone();
                    let dispatch = self.dispatcher.dispatch(call, cancel.clone()).await;
                    match dispatch.result {
                        Ok(text) => {
                            self.memory.append(Message::tool(
                                text.clone(),
                                tool_name,
                                uuid::Uuid::new_v4().to_string(),
                                Utc::now(),
                            ));
                            error_context = None;
                            error_ring.clear();
                            if dispatch.loop_breaking {
                                let _ = self.events.send(Event::TurnEnd);
                                return TurnOutcome::Ok(text);
                            }
                        }
                        Err(e) => {
                            error_context = Some(e.render_context());
                            if let Some(fatal) = self.track_error(&mut error_ring, e) {
                                let _ = self.events.send(Event::TurnEnd);
                                return TurnOutcome::Fatal(fatal);
                            }
                        }
                    }
                }
            }

            if let Err(e) = self.context_strategies.apply(cancel.clone()).await {
                let _ = self.events.send(Event::Error {
                    kind: "summarization".to_string(),
                    detail: e.to_string(),
                });
            }

            let _ = self.events.send(Event::IterationEnd { iteration });
        }

        let err = ForgeError::IterationCapReached(self.loop_limits.max_iterations);
        let _ = self.events.send(Event::Error {
            kind: "iteration_cap".to_string(),
            detail: err.to_string(),
        });
        let _ = self.events.send(Event::TurnEnd);
        TurnOutcome::Fatal(err)
    }

    /// Hash `err`'s rendered context into the ring; returns the fatal
    /// circuit-breaker error once all slots hold the same hash.
    fn track_error(&self, ring: &mut VecDeque<u64>, err: ForgeError) -> Option<ForgeError> {
        let signature = err.signature();
        ring.push_back(signature);
        if ring.len() > ERROR_RING_SIZE {
            ring.pop_front();
        }
        if ring.len() == ERROR_RING_SIZE && ring.iter().all(|s| *s == signature) {
            return Some(ForgeError::CircuitBreakerTripped {
                count: ERROR_RING_SIZE,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::approval::AlwaysApprove;
    use crate::agent::models::ModelCatalog;
    use crate::agent::provider::{ChunkKind, ProviderModelInfo, StreamBox, StreamChunk};
    use crate::agent::tokens::DefaultTokenCounter;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<Vec<StreamChunk>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Vec<StreamChunk>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn model_info(&self) -> ProviderModelInfo {
            ProviderModelInfo {
                name: "scripted".to_string(),
                max_tokens: 1000,
                supports_streaming: true,
            }
        }
        async fn stream(
            &self,
            _messages: Vec<Message>,
            _cancel: CancellationToken,
        ) -> Result<StreamBox, ForgeError> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            let items: Vec<Result<StreamChunk, ForgeError>> = next.into_iter().map(Ok).collect();
            Ok(Box::pin(stream::iter(items)))
        }
        async fn complete(
            &self,
            _messages: Vec<Message>,
            _cancel: CancellationToken,
        ) -> Result<String, ForgeError> {
            Ok("summary".to_string())
        }
    }

    fn chunk(text: &str, finished: bool) -> StreamChunk {
        StreamChunk {
            content_delta: text.to_string(),
            kind: ChunkKind::Message,
            finished,
        }
    }

    fn build_controller(provider: Arc<dyn Provider>) -> AgentLoopController {
        let counter = Arc::new(DefaultTokenCounter::new(Arc::new(ModelCatalog::new())));
        let memory = Arc::new(Memory::new("claude-sonnet-4-5-20250929", counter));
        memory.append(Message::system("You are Forge.", Utc::now()));
        let prompt_builder = PromptBuilder::new("You are Forge.");
        let registry = Arc::new(ToolRegistry::new());
        let approval = Arc::new(AlwaysApprove);
        let (tx, _rx) = broadcast::channel(256);
        AgentLoopController::new(
            memory,
            prompt_builder,
            provider,
            registry,
            approval,
            ContextConfig {
                max_context_tokens: 150_000,
                messages_old_threshold: 20,
                min_tool_calls_to_summarize: 10,
                max_tool_call_distance: 40,
            },
            LoopLimits { max_iterations: 5 },
            "claude-sonnet-4-5-20250929",
            tx,
        )
    }

    #[tokio::test]
    async fn turn_completes_on_loop_breaking_tool() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![chunk(
            "<tool><tool_name>converse</tool_name><arguments><message>Hi!</message></arguments></tool>",
            false,
        )]]));
        let controller = build_controller(provider);
        let outcome = controller.run_turn("hello", CancellationToken::new()).await;
        match outcome {
            TurnOutcome::Ok(text) => assert_eq!(text, "Hi!"),
            TurnOutcome::Fatal(e) => panic!("expected success, got {e}"),
        }
    }

    #[tokio::test]
    async fn iteration_cap_is_fatal() {
        let responses = (0..5)
            .map(|_| vec![chunk("no tool here", true)])
            .collect();
        let provider = Arc::new(ScriptedProvider::new(responses));
        let controller = build_controller(provider);
        let outcome = controller.run_turn("hello", CancellationToken::new()).await;
        match outcome {
            TurnOutcome::Fatal(ForgeError::CircuitBreakerTripped { .. }) => {}
            TurnOutcome::Fatal(ForgeError::IterationCapReached(_)) => {}
            _ => panic!("expected a fatal outcome"),
        }
    }
}
