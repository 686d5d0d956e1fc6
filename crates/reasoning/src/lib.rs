//! Reasoning loop — bounded think/act rounds over streaming LLM
//! responses with interleaved parallel tool execution.
//!
//! Each round launches a producer that streams one model input through
//! the router, drains the delta channel until the adapter is done
//! (never cancelling the producer early), then either commits the
//! round's text or executes its tool calls and queues a follow-up
//! input built from the updated session buffer.

pub mod buffer;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_domain::config::ReasoningConfig;
use chorus_domain::message::ChatMessage;
use chorus_domain::stream::{DeltaBatch, ModelInput, SelectedModel};
use chorus_domain::tool::ToolCall;
use chorus_domain::{Error, Result};
use chorus_providers::ModelRouter;
use chorus_tools::{ToolExecutor, ToolRegistry};

pub use buffer::SessionBuffer;

pub struct ReasoningLoop {
    router: Arc<ModelRouter>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    cfg: ReasoningConfig,
    default_model: SelectedModel,
}

/// What one round of stream draining produced.
struct RoundOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    error: Option<String>,
}

impl ReasoningLoop {
    pub fn new(
        router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        cfg: ReasoningConfig,
        default_model: SelectedModel,
    ) -> Self {
        Self {
            router,
            tools,
            executor,
            cfg,
            default_model,
        }
    }

    /// Run the loop to completion.
    ///
    /// `out`, when supplied, receives the user-visible assistant text
    /// as single-delta batches; it is closed exactly once, when this
    /// function returns. Returns the final assistant text (possibly
    /// empty when the tool budget cut the loop short).
    pub async fn run(
        &self,
        cancel: CancellationToken,
        initial: Vec<ChatMessage>,
        out: Option<mpsc::Sender<DeltaBatch>>,
    ) -> Result<String> {
        let buffer = SessionBuffer::new(initial);
        let mut queue: VecDeque<ModelInput> = VecDeque::new();
        queue.push_back(self.next_input(&buffer));

        let mut tool_calls_count = 0usize;
        let mut final_text = String::new();

        while let Some(input) = queue.pop_front() {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.run_round(&cancel, input, out.as_ref()).await;

            if let Some(message) = outcome.error {
                tracing::warn!(error = %message, "round aborted by provider error");
                return Err(Error::Provider {
                    model: self.default_model.canonical(),
                    message,
                });
            }

            if outcome.tool_calls.is_empty() {
                if !outcome.text.is_empty() {
                    final_text = outcome.text.clone();
                    buffer.append(ChatMessage::assistant(outcome.text));
                }
                continue;
            }

            // Tool round: run every call in parallel, append the
            // results as tool messages, then queue a follow-up input.
            let call_count = outcome.tool_calls.len();
            tracing::debug!(calls = call_count, "dispatching tool calls");

            let executions = outcome.tool_calls.into_iter().map(|call| {
                let executor = self.executor.clone();
                let tools = self.tools.clone();
                let cancel = cancel.clone();
                async move { executor.execute(cancel, &tools, call).await }
            });
            let outcomes = futures_util::future::join_all(executions).await;

            for result in outcomes {
                let tool_outcome = result?;
                buffer.append(ChatMessage::tool(tool_outcome.message_text()));
            }

            tool_calls_count += call_count;
            if tool_calls_count >= self.cfg.max_tool_calls {
                tracing::warn!(
                    used = tool_calls_count,
                    limit = self.cfg.max_tool_calls,
                    "tool-call budget reached; stopping"
                );
                break;
            }

            queue.push_back(self.next_input(&buffer));
        }

        // `out` drops here: the loop is the sole closer of the
        // user-visible channel.
        Ok(final_text)
    }

    fn next_input(&self, buffer: &SessionBuffer) -> ModelInput {
        ModelInput::new(
            buffer.snapshot(),
            self.tools.contract_tools(),
            self.default_model.clone(),
        )
    }

    /// Drain one provider round: launch the producer, read until a
    /// done delta, channel close, cancellation, or the protective
    /// timeout, then cancel the round scope.
    async fn run_round(
        &self,
        cancel: &CancellationToken,
        input: ModelInput,
        out: Option<&mpsc::Sender<DeltaBatch>>,
    ) -> RoundOutcome {
        let round = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<DeltaBatch>(self.cfg.delta_channel_capacity);

        let router = self.router.clone();
        let producer_cancel = round.clone();
        let producer =
            tokio::spawn(async move { router.stream(producer_cancel, input, tx).await });

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.cfg.round_timeout_secs);

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut saw_tool_calls = false;
        let mut error: Option<String> = None;

        'read: loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break 'read,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("round read timeout");
                    break 'read;
                }
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break 'read,
                },
            };

            let mut saw_done = false;
            for delta in batch {
                if let Some(message) = delta.error {
                    error = Some(message);
                    break 'read;
                }
                if !delta.tool_calls.is_empty() {
                    // Strict tool mode: a tool call voids any text
                    // accumulated this round. Keep draining so the
                    // adapter terminates cleanly.
                    tool_calls.extend(delta.tool_calls);
                    saw_tool_calls = true;
                    text.clear();
                    continue;
                }
                if delta.done {
                    saw_done = true;
                    continue;
                }
                if saw_tool_calls {
                    continue;
                }
                if let Some(chunk) = &delta.msg {
                    text.push_str(chunk);
                    if let Some(out_tx) = out {
                        let fwd = vec![delta.clone()];
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            sent = out_tx.send(fwd) => {
                                if sent.is_err() {
                                    tracing::debug!("user-visible channel dropped");
                                }
                            }
                        }
                    }
                }
            }
            if saw_done {
                break 'read;
            }
        }

        // The round scope is cancelled only after channel exhaustion.
        round.cancel();
        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "producer finished with error"),
            Err(e) => tracing::warn!(error = %e, "producer task panicked"),
        }

        RoundOutcome {
            text,
            tool_calls,
            error,
        }
    }
}
