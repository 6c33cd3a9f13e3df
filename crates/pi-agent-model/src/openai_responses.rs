// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for OpenAI's `/responses` wire shape (spec §6 table), used by
//! reasoning-capable models (o1/o3/gpt-5-family) and by Azure OpenAI
//! deployments, which speak the same `/responses` framing against a
//! deployment-scoped URL. One adapter instance is registered per api tag,
//! mirroring [`crate::openai_compat::OpenAiCompatAdapter`]'s one-struct-
//! many-tags shape, since the two tags differ only in default base URL —
//! both consume the same request/event shape.
//!
//! Distinct from `/chat/completions` (spec §4.C.2): the conversation is a
//! flat `input` array of typed items (`message`, `function_call`,
//! `function_call_output`) rather than a `messages` array with inline
//! `tool_calls`; tool schemas are flat (`{type:"function", name, ...}`,
//! no nested `function` key); and the SSE payload is a sequence of typed
//! `response.*` events rather than OpenAI-compat's undifferentiated delta
//! chunks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{AssistantMessageEvent, BlockKind};
use crate::provider::{
    new_assistant_message_stream, AssistantMessageAccumulator, AssistantMessageEventStream,
    ModelAdapter,
};
use crate::reasoning::openai_reasoning_effort;
use crate::types::{CompletionOptions, ContentBlock, Context as LlmContext, Message, Model, ToolSchema, Usage};

fn default_base_url(api_tag: &str) -> Option<&'static str> {
    match api_tag {
        "openai-responses" => Some("https://api.openai.com/v1"),
        _ => None,
    }
}

pub struct OpenAiResponsesAdapter {
    api_tag: String,
    client: reqwest::Client,
}

impl OpenAiResponsesAdapter {
    pub fn new(api_tag: impl Into<String>) -> Self {
        OpenAiResponsesAdapter { api_tag: api_tag.into(), client: reqwest::Client::new() }
    }
}

impl Default for OpenAiResponsesAdapter {
    fn default() -> Self {
        Self::new("openai-responses")
    }
}

#[async_trait]
impl ModelAdapter for OpenAiResponsesAdapter {
    fn api(&self) -> &str {
        &self.api_tag
    }

    async fn stream(
        &self,
        model: &Model,
        context: &LlmContext,
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream> {
        let base = model
            .base_url
            .as_deref()
            .or_else(|| default_base_url(&self.api_tag))
            .with_context(|| format!("no base_url configured for '{}' model '{}'", self.api_tag, model.id))?;
        let url = format!("{}/responses", base.trim_end_matches('/'));

        let input = build_input(context);
        let tools = context.tools.as_deref().map(build_tools).unwrap_or_default();

        let mut body = json!({
            "model": model.id,
            "input": input,
            "stream": true,
            "max_output_tokens": options.max_tokens.unwrap_or(model.max_tokens).max(1),
        });
        if let Some(sys) = &context.system_prompt {
            if !sys.is_empty() {
                body["instructions"] = json!(sys);
            }
        }
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(effort) = openai_reasoning_effort(options) {
            body["reasoning"] = json!({ "effort": effort });
        }

        debug!(
            api = %self.api_tag,
            model = %model.id,
            tool_count = tools.len(),
            input_count = input.len(),
            "dispatching responses request"
        );

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &options.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(headers) = &model.headers {
            for (k, v) in headers {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        if let Some(headers) = &options.headers {
            for (k, v) in headers {
                req = req.header(k.as_str(), v.as_str());
            }
        }

        let resp = req.send().await.with_context(|| format!("{} request failed", self.api_tag))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.api_tag);
        }

        let acc = Arc::new(Mutex::new(AssistantMessageAccumulator::new(model)));
        let acc_for_result = acc.clone();
        let stream = new_assistant_message_stream(move |_| Some(acc_for_result.lock().unwrap().finish()));
        let stream_for_task = stream.clone();

        tokio::spawn(run_sse_loop(resp, stream_for_task, acc, cancel));

        Ok(stream)
    }
}

/// Drain complete `\n`-terminated SSE lines from `buf`. Responses SSE
/// frames carry an `event: <type>` line followed by a `data: {...}` line;
/// the type is also echoed in the payload's own `type` field, so only the
/// `data:` line is needed to dispatch.
fn drain_data_lines(buf: &mut String) -> Vec<anyhow::Result<Value>> {
    let mut out = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => out.push(Ok(v)),
            Err(e) => out.push(Err(anyhow::anyhow!(e))),
        }
    }
    out
}

/// Tracks the content index assigned to each `output_index` the Responses
/// API reports, since a text block and any number of function-call blocks
/// interleave by `output_index`/`item_id` rather than the compat family's
/// flat delta stream.
#[derive(Default)]
struct StreamState {
    index_by_output: HashMap<u64, usize>,
    tool_names: HashMap<u64, String>,
    next_index: usize,
}

impl StreamState {
    fn index_for(&mut self, output_index: u64) -> usize {
        *self.index_by_output.entry(output_index).or_insert_with(|| {
            let idx = self.next_index;
            self.next_index += 1;
            idx
        })
    }
}

async fn run_sse_loop(
    resp: reqwest::Response,
    stream: AssistantMessageEventStream,
    acc: Arc<Mutex<AssistantMessageAccumulator>>,
    cancel: CancellationToken,
) {
    let mut push = move |event: AssistantMessageEvent| {
        acc.lock().unwrap().apply(&event);
        stream.push(event);
    };
    push(AssistantMessageEvent::Start);

    let mut state = StreamState::default();
    let mut buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                push(AssistantMessageEvent::Error { message: "aborted".into() });
                return;
            }
            next = byte_stream.next() => next,
        };
        let Some(chunk) = chunk else {
            push(AssistantMessageEvent::Error { message: "stream ended without response.completed".into() });
            return;
        };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                push(AssistantMessageEvent::Error { message: e.to_string() });
                return;
            }
        };
        buf.push_str(&String::from_utf8_lossy(&bytes));
        for line in drain_data_lines(&mut buf) {
            let v = match line {
                Ok(v) => v,
                Err(e) => {
                    push(AssistantMessageEvent::Error { message: e.to_string() });
                    return;
                }
            };
            match apply_event(&v, &mut state, &mut push) {
                Outcome::Continue => {}
                Outcome::Done => return,
            }
        }
    }
}

enum Outcome {
    Continue,
    Done,
}

fn apply_event(v: &Value, state: &mut StreamState, push: &mut impl FnMut(AssistantMessageEvent)) -> Outcome {
    match v["type"].as_str().unwrap_or("") {
        "response.output_item.added" => {
            let item = &v["item"];
            let output_index = v["output_index"].as_u64().unwrap_or(0);
            if item["type"].as_str() == Some("function_call") {
                let idx = state.index_for(output_index);
                let name = item["name"].as_str().unwrap_or("").to_string();
                let id = item["call_id"].as_str().unwrap_or("").to_string();
                state.tool_names.insert(output_index, name.clone());
                push(AssistantMessageEvent::ToolcallStart { index: idx, id, name });
            }
        }
        "response.output_text.delta" => {
            let output_index = v["output_index"].as_u64().unwrap_or(0);
            let delta = v["delta"].as_str().unwrap_or("");
            if !state.index_by_output.contains_key(&output_index) {
                let idx = state.index_for(output_index);
                push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Text });
            }
            let idx = state.index_for(output_index);
            if !delta.is_empty() {
                push(AssistantMessageEvent::BlockDelta { index: idx, text: delta.to_string() });
            }
        }
        "response.reasoning_summary_text.delta" => {
            let output_index = v["output_index"].as_u64().unwrap_or(0);
            let delta = v["delta"].as_str().unwrap_or("");
            if !state.index_by_output.contains_key(&output_index) {
                let idx = state.index_for(output_index);
                push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Thinking });
            }
            let idx = state.index_for(output_index);
            if !delta.is_empty() {
                push(AssistantMessageEvent::BlockDelta { index: idx, text: delta.to_string() });
            }
        }
        "response.function_call_arguments.delta" => {
            let output_index = v["output_index"].as_u64().unwrap_or(0);
            let idx = state.index_for(output_index);
            let delta = v["delta"].as_str().unwrap_or("");
            if !delta.is_empty() {
                push(AssistantMessageEvent::ToolcallDelta { index: idx, text: delta.to_string() });
            }
        }
        "response.output_item.done" => {
            let item = &v["item"];
            let output_index = v["output_index"].as_u64().unwrap_or(0);
            match item["type"].as_str() {
                Some("function_call") => {
                    let idx = state.index_for(output_index);
                    let raw = item["arguments"].as_str().unwrap_or("{}");
                    let arguments = serde_json::from_str(raw).unwrap_or_else(|_| json!({}));
                    push(AssistantMessageEvent::ToolcallEnd { index: idx, arguments, signature: None });
                }
                Some("reasoning") => {
                    let idx = state.index_for(output_index);
                    let signature = item["encrypted_content"].as_str().map(str::to_string);
                    push(AssistantMessageEvent::BlockEnd { index: idx, signature });
                }
                _ => {}
            }
        }
        "response.incomplete" => {
            let reason = v["response"]["incomplete_details"]["reason"].as_str().unwrap_or("");
            if reason == "max_output_tokens" {
                push(AssistantMessageEvent::MaxTokens);
            } else {
                push(AssistantMessageEvent::Error { message: format!("incomplete: {reason}") });
            }
            return Outcome::Done;
        }
        "response.completed" => {
            if let Some(usage) = v["response"].get("usage") {
                push(AssistantMessageEvent::Usage { usage: parse_usage(usage) });
            }
            push(AssistantMessageEvent::Done);
            return Outcome::Done;
        }
        "response.failed" | "error" => {
            let message = v["response"]["error"]["message"]
                .as_str()
                .or_else(|| v["error"]["message"].as_str())
                .unwrap_or("responses stream failed")
                .to_string();
            push(AssistantMessageEvent::Error { message });
            return Outcome::Done;
        }
        other => {
            if other.starts_with("response.") {
                warn!(event_type = other, "unhandled responses event type");
            }
        }
    }
    Outcome::Continue
}

fn parse_usage(usage: &Value) -> Usage {
    let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
    let output = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
    let cache_read = usage["input_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0) as u32;
    Usage { input, output, cache_read, cache_write: 0, total: input + output + cache_read, cost: Default::default() }
}

fn content_block_to_input_part(b: &ContentBlock, output: bool) -> Option<Value> {
    let text_type = if output { "output_text" } else { "input_text" };
    match b {
        ContentBlock::Text { text } => Some(json!({ "type": text_type, "text": text })),
        ContentBlock::Image { data, mime } => {
            let url = if data.starts_with("data:") || data.starts_with("http") {
                data.clone()
            } else {
                format!("data:{mime};base64,{data}")
            };
            Some(json!({ "type": "input_image", "image_url": url }))
        }
        ContentBlock::Thinking { .. } | ContentBlock::ToolCall { .. } => None,
    }
}

/// Flatten the canonical history into the Responses API's `input` array:
/// plain messages stay messages; a tool call surfaces as its own
/// `function_call` item; a tool result surfaces as its own
/// `function_call_output` item (spec §4.C.1 "tool-result maps to ...
/// a dedicated role/part depending on provider").
fn build_input(context: &LlmContext) -> Vec<Value> {
    let mut out = Vec::with_capacity(context.messages.len());
    for message in &context.messages {
        match message {
            Message::User(m) => {
                let parts: Vec<Value> =
                    m.content.iter().filter_map(|b| content_block_to_input_part(b, false)).collect();
                out.push(json!({ "type": "message", "role": "user", "content": parts }));
            }
            Message::Assistant(m) => {
                let text_parts: Vec<Value> = m
                    .content
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::Text { .. }))
                    .filter_map(|b| content_block_to_input_part(b, true))
                    .collect();
                if !text_parts.is_empty() {
                    out.push(json!({ "type": "message", "role": "assistant", "content": text_parts }));
                }
                for b in &m.content {
                    match b {
                        ContentBlock::ToolCall { id, name, arguments, .. } => {
                            out.push(json!({
                                "type": "function_call",
                                "call_id": id,
                                "name": name,
                                "arguments": serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string()),
                            }));
                        }
                        ContentBlock::Thinking { signature: Some(sig), .. } => {
                            out.push(json!({ "type": "reasoning", "encrypted_content": sig }));
                        }
                        _ => {}
                    }
                }
            }
            Message::ToolResult(m) => {
                let text: String = m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                out.push(json!({
                    "type": "function_call_output",
                    "call_id": m.tool_call_id,
                    "output": text,
                }));
            }
        }
    }
    out
}

/// Responses tool schemas are flat (`{type:"function", name, description,
/// parameters}`), unlike compat's nested `function: {...}` wrapper.
fn build_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "type": "function", "name": t.name, "description": t.description, "parameters": t.parameters }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, ContentBlock, StopReason, ToolResultMessage, UserMessage};

    fn collect(v: Value, state: &mut StreamState) -> (Vec<AssistantMessageEvent>, Outcome) {
        let mut events = Vec::new();
        let outcome = apply_event(&v, state, &mut |e| events.push(e));
        (events, outcome)
    }

    #[test]
    fn output_text_delta_opens_and_extends_a_text_block() {
        let mut state = StreamState::default();
        let (events, _) = collect(
            json!({"type":"response.output_text.delta","output_index":0,"delta":"Hi"}),
            &mut state,
        );
        assert!(matches!(&events[0], AssistantMessageEvent::BlockStart { kind: BlockKind::Text, .. }));
        assert!(matches!(&events[1], AssistantMessageEvent::BlockDelta { text, .. } if text == "Hi"));
    }

    #[test]
    fn function_call_lifecycle_opens_deltas_and_closes_with_parsed_args() {
        let mut state = StreamState::default();
        let (start, _) = collect(
            json!({"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","call_id":"c1","name":"echo"}}),
            &mut state,
        );
        assert!(matches!(&start[0], AssistantMessageEvent::ToolcallStart{ id, name, .. } if id == "c1" && name == "echo"));

        let (delta, _) = collect(
            json!({"type":"response.function_call_arguments.delta","output_index":0,"delta":"{\"x\":1}"}),
            &mut state,
        );
        assert!(matches!(&delta[0], AssistantMessageEvent::ToolcallDelta { text, .. } if text == "{\"x\":1}"));

        let (end, _) = collect(
            json!({"type":"response.output_item.done","output_index":0,"item":{"type":"function_call","arguments":"{\"x\":1}"}}),
            &mut state,
        );
        assert!(matches!(&end[0], AssistantMessageEvent::ToolcallEnd { arguments, signature: None, .. } if arguments == &json!({"x":1})));
    }

    #[test]
    fn reasoning_item_done_carries_encrypted_content_as_signature() {
        let mut state = StreamState::default();
        collect(
            json!({"type":"response.reasoning_summary_text.delta","output_index":0,"delta":"thinking..."}),
            &mut state,
        );
        let (end, _) = collect(
            json!({"type":"response.output_item.done","output_index":0,"item":{"type":"reasoning","encrypted_content":"enc-1"}}),
            &mut state,
        );
        assert!(matches!(&end[0], AssistantMessageEvent::BlockEnd { signature: Some(sig), .. } if sig == "enc-1"));
    }

    #[test]
    fn incomplete_max_output_tokens_maps_to_max_tokens_event() {
        let mut state = StreamState::default();
        let (events, outcome) = collect(
            json!({"type":"response.incomplete","response":{"incomplete_details":{"reason":"max_output_tokens"}}}),
            &mut state,
        );
        assert!(matches!(events[0], AssistantMessageEvent::MaxTokens));
        assert!(matches!(outcome, Outcome::Done));
    }

    #[test]
    fn completed_event_carries_usage_and_ends_the_stream() {
        let mut state = StreamState::default();
        let (events, outcome) = collect(
            json!({"type":"response.completed","response":{"usage":{"input_tokens":10,"output_tokens":5}}}),
            &mut state,
        );
        assert!(matches!(&events[0], AssistantMessageEvent::Usage { usage } if usage.input == 10 && usage.output == 5));
        assert!(matches!(events[1], AssistantMessageEvent::Done));
        assert!(matches!(outcome, Outcome::Done));
    }

    #[test]
    fn failed_event_maps_to_error() {
        let mut state = StreamState::default();
        let (events, outcome) = collect(
            json!({"type":"response.failed","response":{"error":{"message":"boom"}}}),
            &mut state,
        );
        assert!(matches!(&events[0], AssistantMessageEvent::Error { message } if message == "boom"));
        assert!(matches!(outcome, Outcome::Done));
    }

    #[test]
    fn build_input_flattens_tool_call_and_tool_result_into_their_own_items() {
        let context = LlmContext {
            system_prompt: None,
            messages: vec![
                Message::User(UserMessage { content: vec![ContentBlock::Text { text: "hi".into() }], timestamp: 0 }),
                Message::Assistant(AssistantMessage {
                    content: vec![ContentBlock::ToolCall {
                        id: "c1".into(),
                        name: "echo".into(),
                        arguments: json!({"x": 1}),
                        thought_signature: None,
                    }],
                    api: "openai-responses".into(),
                    provider: "openai".into(),
                    model: "o3".into(),
                    usage: Usage::default(),
                    stop_reason: StopReason::ToolUse,
                    error_message: None,
                    timestamp: 0,
                }),
                Message::ToolResult(ToolResultMessage {
                    tool_call_id: "c1".into(),
                    tool_name: "echo".into(),
                    content: vec![ContentBlock::Text { text: "x=1".into() }],
                    details: None,
                    is_error: false,
                    timestamp: 0,
                }),
            ],
            tools: None,
        };
        let input = build_input(&context);
        assert_eq!(input.len(), 3);
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "c1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "x=1");
    }

    #[test]
    fn build_tools_is_flat_not_nested_under_function() {
        let tools = vec![ToolSchema { name: "grep".into(), description: "search".into(), parameters: json!({}) }];
        let wire = build_tools(&tools);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["name"], "grep");
        assert!(wire[0].get("function").is_none());
    }
}
