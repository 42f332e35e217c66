//! Core loop implementation.

use std::sync::Arc;

use hearth_tool::ToolRouter;
use hearth_types::{
    BoxProvider, ContentPart, Message, ProviderError, ProviderRequest, Role, TokenUsage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::LoopConfig;

/// A live transcript: the receiving end of one loop invocation.
///
/// Messages arrive in conversation order. Dropping the transcript cancels
/// the run; in-flight provider and tool work is released promptly.
pub struct Transcript {
    rx: mpsc::Receiver<Message>,
}

impl Transcript {
    /// Receive the next message, or `None` when the loop has finished.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Drain the remaining messages into a vector.
    pub async fn drain(mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(msg) = self.rx.recv().await {
            messages.push(msg);
        }
        messages
    }
}

/// Runs one conversation with tools to fixpoint.
///
/// The loop terminates when the model stops requesting tools, when the
/// iteration budget runs out, or when the provider times out twice in a
/// row. Provider failures never escape: they become a trailing synthetic
/// assistant message so the persisted transcript records what happened.
pub struct ToolLoop {
    provider: BoxProvider,
    router: Arc<ToolRouter>,
    config: LoopConfig,
}

impl ToolLoop {
    /// Create a loop over the given provider and tool router.
    pub fn new(provider: BoxProvider, router: Arc<ToolRouter>, config: LoopConfig) -> Self {
        Self {
            provider,
            router,
            config,
        }
    }

    /// Start the conversation and return its transcript.
    ///
    /// The user prompt is appended after `previous_messages` and emitted
    /// first. The run executes on its own task; cancel it through `cancel`
    /// or by dropping the transcript.
    pub fn run(
        self,
        system_prompt: Option<String>,
        user_prompt: impl Into<String>,
        previous_messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Transcript {
        let (tx, rx) = mpsc::channel(64);
        let user_message = Message::user(user_prompt);
        tokio::spawn(async move {
            self.drive(system_prompt, user_message, previous_messages, cancel, tx)
                .await;
        });
        Transcript { rx }
    }

    async fn drive(
        self,
        system_prompt: Option<String>,
        user_message: Message,
        previous_messages: Vec<Message>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Message>,
    ) {
        let mut messages = previous_messages;
        messages.push(user_message.clone());
        if tx.send(user_message).await.is_err() {
            return;
        }

        let mut total_usage = TokenUsage::default();
        let mut iterations = 0usize;
        let mut consecutive_timeouts = 0u32;

        loop {
            if iterations >= self.config.max_iterations {
                tracing::debug!(max = self.config.max_iterations, "iteration budget reached");
                break;
            }

            let request = ProviderRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: self.router.list_tools(),
                max_tokens: self.config.max_tokens,
                temperature: None,
                system: system_prompt.clone(),
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(
                    self.config.provider_timeout,
                    self.provider.complete_dyn(request),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_elapsed) => {
                        Err(ProviderError::Timeout(self.config.provider_timeout.as_secs()))
                    }
                },
            };

            let response = match response {
                Ok(response) => {
                    consecutive_timeouts = 0;
                    response
                }
                Err(err @ ProviderError::Timeout(_)) => {
                    consecutive_timeouts += 1;
                    let note = Message::assistant(format!("model timed out ({err})"));
                    messages.push(note.clone());
                    if tx.send(note).await.is_err() {
                        return;
                    }
                    if consecutive_timeouts >= 2 {
                        tracing::warn!("provider timed out twice in a row, terminating loop");
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    // Transient provider errors end the run with a trailing
                    // synthetic message rather than an exception.
                    tracing::warn!(error = %err, "provider call failed");
                    let note = Message::assistant(format!("model call failed: {err}"));
                    let _ = tx.send(note).await;
                    break;
                }
            };

            total_usage.accumulate(&response.usage);
            iterations += 1;

            let tool_calls = response.message.tool_uses();
            messages.push(response.message.clone());
            if tx.send(response.message).await.is_err() {
                return;
            }

            if tool_calls.is_empty() {
                break;
            }

            // Execute in the model's emission order, one result block per
            // tool_use, all collected into a single user message.
            let mut result_parts = Vec::with_capacity(tool_calls.len());
            for (call_id, tool_name, input) in tool_calls {
                if cancel.is_cancelled() {
                    return;
                }
                let (content, is_error) = self.router.dispatch(&tool_name, input).await;
                result_parts.push(ContentPart::ToolResult {
                    tool_use_id: call_id,
                    content,
                    is_error,
                });
            }

            let results = Message {
                role: Role::User,
                content: result_parts,
            };
            messages.push(results.clone());
            if tx.send(results).await.is_err() {
                return;
            }
        }

        tracing::debug!(
            iterations,
            input_tokens = total_usage.input_tokens,
            output_tokens = total_usage.output_tokens,
            "loop finished"
        );
    }
}
