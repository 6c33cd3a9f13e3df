// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The provider adapter contract: `(Model, Context, Options) -> stream of events`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::{AssistantMessageEvent, BlockKind};
use crate::stream::EventStream;
use crate::types::{AssistantMessage, CompletionOptions, Context, ContentBlock, Model, StopReason, Usage};

/// A running assistant-message stream: the wire-level [`AssistantMessageEvent`]s
/// as a `futures::Stream`, plus a result that resolves once a `Done`,
/// `MaxTokens` or `Error` event has been observed.
pub type AssistantMessageEventStream = EventStream<AssistantMessageEvent, AssistantMessage>;

/// Build the stream every adapter wires its push loop into, given a
/// closure that reads the final message out of state the adapter has
/// been accumulating as it pushes block/tool-call events.
pub fn new_assistant_message_stream(
    build_result: impl Fn(&AssistantMessageEvent) -> Option<AssistantMessage> + Send + Sync + 'static,
) -> AssistantMessageEventStream {
    EventStream::new(
        |e| {
            matches!(
                e,
                AssistantMessageEvent::Done
                    | AssistantMessageEvent::MaxTokens
                    | AssistantMessageEvent::Error { .. }
            )
        },
        build_result,
    )
}

/// Assembles a single [`AssistantMessage`] out of the sequence of
/// [`AssistantMessageEvent`]s an adapter pushes. Every adapter keeps one of
/// these behind a lock, calling [`Self::apply`] as it pushes each event,
/// then reads [`Self::finish`] from the `build_result` closure passed to
/// [`new_assistant_message_stream`].
#[derive(Debug, Clone)]
pub struct AssistantMessageAccumulator {
    model_id: String,
    api: String,
    provider: String,
    content: Vec<ContentBlock>,
    usage: Usage,
    stop_reason: StopReason,
    error_message: Option<String>,
}

impl AssistantMessageAccumulator {
    pub fn new(model: &Model) -> Self {
        AssistantMessageAccumulator {
            model_id: model.id.clone(),
            api: model.api.clone(),
            provider: model.provider.clone(),
            content: Vec::new(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
        }
    }

    /// Fold one event into the accumulated message state.
    pub fn apply(&mut self, event: &AssistantMessageEvent) {
        match event {
            AssistantMessageEvent::BlockStart { kind, .. } => {
                self.content.push(match kind {
                    BlockKind::Text => ContentBlock::Text { text: String::new() },
                    BlockKind::Thinking => ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
            }
            AssistantMessageEvent::BlockDelta { index, text } => {
                if let Some(block) = self.content.get_mut(*index) {
                    match block {
                        ContentBlock::Text { text: t } => t.push_str(text),
                        ContentBlock::Thinking { thinking, .. } => thinking.push_str(text),
                        _ => {}
                    }
                }
            }
            AssistantMessageEvent::BlockEnd { index, signature } => {
                if let Some(signature) = signature {
                    if let Some(ContentBlock::Thinking { signature: s, .. }) = self.content.get_mut(*index) {
                        *s = Some(signature.clone());
                    }
                }
            }
            AssistantMessageEvent::ToolcallStart { index, id, name } => {
                let needed = index + 1;
                while self.content.len() < needed {
                    self.content.push(ContentBlock::Text { text: String::new() });
                }
                self.content[*index] = ContentBlock::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: serde_json::Value::Null,
                    thought_signature: None,
                };
            }
            AssistantMessageEvent::ToolcallEnd { index, arguments, signature } => {
                if let Some(ContentBlock::ToolCall { arguments: a, thought_signature, .. }) =
                    self.content.get_mut(*index)
                {
                    *a = arguments.clone();
                    if signature.is_some() {
                        *thought_signature = signature.clone();
                    }
                }
            }
            AssistantMessageEvent::Usage { usage } => {
                self.usage = usage.clone();
            }
            AssistantMessageEvent::MaxTokens => {
                self.stop_reason = StopReason::Length;
            }
            AssistantMessageEvent::Error { message } => {
                self.stop_reason = StopReason::Error;
                self.error_message = Some(message.clone());
            }
            AssistantMessageEvent::Done => {
                if self.content.iter().any(ContentBlock::is_tool_call) {
                    self.stop_reason = StopReason::ToolUse;
                }
            }
            _ => {}
        }
    }

    pub fn finish(&self) -> AssistantMessage {
        AssistantMessage {
            content: self.content.clone(),
            api: self.api.clone(),
            provider: self.provider.clone(),
            model: self.model_id.clone(),
            usage: self.usage.clone(),
            stop_reason: self.stop_reason,
            error_message: self.error_message.clone(),
            timestamp: crate::now_millis(),
        }
    }
}

/// A driver for one wire protocol ("api" in the data model, e.g.
/// `"openai-compat"`, `"anthropic"`, `"google"`). One adapter instance is
/// registered per api tag and is shared across every model/provider pair
/// that speaks that protocol.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// The api tag this adapter handles, e.g. `"openai-compat"`.
    fn api(&self) -> &str;

    /// Start streaming a completion. Returns immediately; the returned
    /// stream is driven by a background task that the adapter spawns.
    /// `cancel` aborts the in-flight HTTP request and tool-call assembly
    /// when triggered.
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream>;
}
