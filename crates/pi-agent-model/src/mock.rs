// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic adapters for tests: no network, scripted or echoing
//! responses.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::{AssistantMessageEvent, BlockKind};
use crate::provider::{
    new_assistant_message_stream, AssistantMessageAccumulator, AssistantMessageEventStream,
    ModelAdapter,
};
use crate::types::{CompletionOptions, Context, Message, Model, Usage};

/// Echoes the last user message back as a single text block. Useful as a
/// smoke-test adapter with no setup.
#[derive(Default)]
pub struct EchoMockAdapter;

#[async_trait]
impl ModelAdapter for EchoMockAdapter {
    fn api(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        _options: &CompletionOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream> {
        let reply = context
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User(u) => u.content.iter().find_map(|b| b.as_text()),
                _ => None,
            })
            .unwrap_or("[no input]")
            .to_string();

        let acc = Arc::new(Mutex::new(AssistantMessageAccumulator::new(model)));
        let acc_for_result = acc.clone();
        let stream = new_assistant_message_stream(move |_| Some(acc_for_result.lock().unwrap().finish()));

        let mut push = |event: AssistantMessageEvent| {
            acc.lock().unwrap().apply(&event);
            stream.push(event);
        };
        push(AssistantMessageEvent::Start);
        push(AssistantMessageEvent::BlockStart { index: 0, kind: BlockKind::Text });
        push(AssistantMessageEvent::BlockDelta {
            index: 0,
            text: format!("MOCK: {reply}"),
        });
        push(AssistantMessageEvent::BlockEnd { index: 0, signature: None });
        push(AssistantMessageEvent::Usage {
            usage: Usage { input: 10, output: 10, total: 20, ..Default::default() },
        });
        push(AssistantMessageEvent::Done);
        Ok(stream)
    }
}

/// A pre-scripted adapter. Each call to `stream` pops the next script
/// (a sequence of events to replay) from the front of the queue, so tests
/// can specify exact event sequences — including tool calls — without
/// network access.
pub struct ScriptedMockAdapter {
    scripts: Arc<Mutex<Vec<Vec<AssistantMessageEvent>>>>,
    /// The last [`Context`] seen by this adapter, for test assertions.
    pub last_context: Arc<Mutex<Option<Context>>>,
}

impl ScriptedMockAdapter {
    pub fn new(scripts: Vec<Vec<AssistantMessageEvent>>) -> Self {
        ScriptedMockAdapter {
            scripts: Arc::new(Mutex::new(scripts)),
            last_context: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: adapter that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            AssistantMessageEvent::Start,
            AssistantMessageEvent::BlockStart { index: 0, kind: BlockKind::Text },
            AssistantMessageEvent::BlockDelta { index: 0, text: reply.into() },
            AssistantMessageEvent::BlockEnd { index: 0, signature: None },
            AssistantMessageEvent::Done,
        ]])
    }

    /// Convenience: adapter that emits one tool call, then (on the next
    /// call) a text reply — the shape of a single tool-use round trip.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                AssistantMessageEvent::Start,
                AssistantMessageEvent::ToolcallStart {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                },
                AssistantMessageEvent::ToolcallEnd { index: 0, arguments, signature: None },
                AssistantMessageEvent::Done,
            ],
            vec![
                AssistantMessageEvent::Start,
                AssistantMessageEvent::BlockStart { index: 0, kind: BlockKind::Text },
                AssistantMessageEvent::BlockDelta { index: 0, text: final_text.into() },
                AssistantMessageEvent::BlockEnd { index: 0, signature: None },
                AssistantMessageEvent::Done,
            ],
        ])
    }
}

#[async_trait]
impl ModelAdapter for ScriptedMockAdapter {
    fn api(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        _options: &CompletionOptions,
        _cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream> {
        *self.last_context.lock().unwrap() = Some(context.clone());
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    AssistantMessageEvent::Start,
                    AssistantMessageEvent::BlockStart { index: 0, kind: BlockKind::Text },
                    AssistantMessageEvent::BlockDelta {
                        index: 0,
                        text: "[no more scripts]".into(),
                    },
                    AssistantMessageEvent::BlockEnd { index: 0, signature: None },
                    AssistantMessageEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };

        let acc = Arc::new(Mutex::new(AssistantMessageAccumulator::new(model)));
        let acc_for_result = acc.clone();
        let stream = new_assistant_message_stream(move |_| Some(acc_for_result.lock().unwrap().finish()));
        for event in events {
            acc.lock().unwrap().apply(&event);
            stream.push(event);
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn ctx(text: &str) -> Context {
        Context { messages: vec![Message::user(text, 0)], ..Default::default() }
    }

    #[tokio::test]
    async fn echo_adapter_echoes_last_user_message() {
        let adapter = EchoMockAdapter;
        let model = Model::default();
        let mut stream = adapter
            .stream(&model, &ctx("hi"), &CompletionOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        let mut saw_delta = false;
        while let Some(event) = stream.next().await {
            if let AssistantMessageEvent::BlockDelta { text, .. } = event {
                saw_delta = true;
                assert!(text.contains("MOCK: hi"));
            }
        }
        assert!(saw_delta);
        let message = stream.result().await;
        assert_eq!(message.as_text(), "MOCK: hi");
    }

    #[tokio::test]
    async fn scripted_adapter_replays_tool_then_text_across_two_calls() {
        let adapter = ScriptedMockAdapter::tool_then_text(
            "call-1",
            "shell",
            serde_json::json!({"command": "ls"}),
            "done",
        );
        let model = Model::default();
        let opts = CompletionOptions::default();

        let mut first = adapter
            .stream(&model, &ctx("run ls"), &opts, CancellationToken::new())
            .await
            .unwrap();
        while first.next().await.is_some() {}
        let first_msg = first.result().await;
        assert!(first_msg.has_tool_calls());

        let mut second = adapter
            .stream(&model, &ctx("continue"), &opts, CancellationToken::new())
            .await
            .unwrap();
        while second.next().await.is_some() {}
        assert_eq!(second.result().await.as_text(), "done");
    }

    #[tokio::test]
    async fn scripted_adapter_falls_back_when_exhausted() {
        let adapter = ScriptedMockAdapter::new(vec![]);
        let model = Model::default();
        let mut stream = adapter
            .stream(&model, &ctx("x"), &CompletionOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        assert!(stream.result().await.as_text().contains("no more scripts"));
    }
}
