// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for Anthropic's Messages API (spec §6 table): typed SSE events,
//! `x-api-key`/`anthropic-version` headers, and prompt caching via
//! `cache_control` blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{AssistantMessageEvent, BlockKind};
use crate::provider::{
    new_assistant_message_stream, AssistantMessageAccumulator, AssistantMessageEventStream,
    ModelAdapter,
};
use crate::types::{
    CacheRetention, CompletionOptions, ContentBlock, Context as LlmContext, Message, Model,
    ToolSchema, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        AnthropicAdapter { client: reqwest::Client::new() }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// The `cache_control` object to attach for a given retention tier, or
/// `None` when caching is off for this call.
fn cache_control_for(retention: Option<CacheRetention>) -> Option<Value> {
    match retention {
        None | Some(CacheRetention::None) => None,
        Some(CacheRetention::Short) => Some(json!({ "type": "ephemeral" })),
        Some(CacheRetention::Long) => Some(json!({ "type": "ephemeral", "ttl": "1h" })),
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn api(&self) -> &str {
        "anthropic-messages"
    }

    async fn stream(
        &self,
        model: &Model,
        context: &LlmContext,
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream> {
        let key = options.api_key.as_deref().context("API key not set for Anthropic model")?;
        let base = model.base_url.as_deref().unwrap_or("https://api.anthropic.com");
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));

        let cache_ctrl = cache_control_for(options.cache_retention);

        let mut messages = build_messages(context);
        if let Some(ctrl) = &cache_ctrl {
            attach_cache_control_to_last_block(&mut messages, ctrl);
        }

        let tools = context
            .tools
            .as_deref()
            .map(|ts| build_tools(ts, cache_ctrl.as_ref()))
            .unwrap_or_default();

        let mut body = json!({
            "model": model.id,
            "messages": messages,
            "max_tokens": options.max_tokens.unwrap_or(model.max_tokens).max(1),
            "stream": true,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(sys) = build_system(context.system_prompt.as_deref(), cache_ctrl.as_ref()) {
            body["system"] = sys;
        }
        if let Some(budget) = crate::reasoning::anthropic_thinking_budget(options) {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }

        debug!(model = %model.id, caching = cache_ctrl.is_some(), tool_count = tools.len(), "dispatching anthropic messages request");

        let mut req = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if cache_ctrl.is_some() {
            req = req.header("anthropic-beta", "prompt-caching-2024-07-31,extended-cache-ttl-2025-04-11");
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

        let resp = req.json(&body).send().await.context("Anthropic request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        let acc = Arc::new(Mutex::new(AssistantMessageAccumulator::new(model)));
        let acc_for_result = acc.clone();
        let stream = new_assistant_message_stream(move |_| Some(acc_for_result.lock().unwrap().finish()));
        let stream_for_task = stream.clone();

        tokio::spawn(run_sse_loop(resp, stream_for_task, acc, cancel));

        Ok(stream)
    }
}

#[derive(Debug)]
enum SseLine {
    Data(Value),
}

fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<SseLine>> {
    let mut out = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => out.push(Ok(SseLine::Data(v))),
            Err(e) => out.push(Err(anyhow::anyhow!(e))),
        }
    }
    out
}

/// Tracks per-index state across `content_block_start`/`_delta`/`_stop`.
/// Anthropic assigns indices in strictly increasing order as each block
/// opens, so the wire index is reused verbatim as our content index.
#[derive(Default)]
struct AnthropicStreamState {
    tool_args: HashMap<u64, String>,
    signatures: HashMap<u64, String>,
}

impl AnthropicStreamState {
    fn close_tool(&mut self, index: u64, push: &mut impl FnMut(AssistantMessageEvent)) {
        if let Some(buf) = self.tool_args.remove(&index) {
            let arguments = serde_json::from_str(&buf).unwrap_or_else(|_| json!({}));
            let signature = self.signatures.remove(&index);
            push(AssistantMessageEvent::ToolcallEnd { index: index as usize, arguments, signature });
        }
    }

    fn close_all(&mut self, push: &mut impl FnMut(AssistantMessageEvent)) {
        let mut indices: Vec<u64> = self.tool_args.keys().copied().collect();
        indices.sort_unstable();
        for idx in indices {
            self.close_tool(idx, push);
        }
    }

    /// Returns `true` when this event ended the stream (message_stop or a
    /// max-tokens message_delta).
    fn apply_event(&mut self, v: &Value, push: &mut impl FnMut(AssistantMessageEvent)) -> bool {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    push(AssistantMessageEvent::Usage { usage: parse_message_start_usage(usage) });
                }
                false
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        self.tool_args.insert(index, String::new());
                        push(AssistantMessageEvent::ToolcallStart {
                            index: index as usize,
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                        });
                    }
                    "thinking" => {
                        push(AssistantMessageEvent::BlockStart { index: index as usize, kind: BlockKind::Thinking });
                    }
                    _ => {
                        push(AssistantMessageEvent::BlockStart { index: index as usize, kind: BlockKind::Text });
                    }
                }
                false
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if !text.is_empty() {
                            push(AssistantMessageEvent::BlockDelta { index: index as usize, text: text.to_string() });
                        }
                    }
                    "thinking_delta" => {
                        let text = delta["thinking"].as_str().unwrap_or("");
                        if !text.is_empty() {
                            push(AssistantMessageEvent::BlockDelta { index: index as usize, text: text.to_string() });
                        }
                    }
                    "input_json_delta" => {
                        let fragment = delta["partial_json"].as_str().unwrap_or("");
                        if !fragment.is_empty() {
                            self.tool_args.entry(index).or_default().push_str(fragment);
                            push(AssistantMessageEvent::ToolcallDelta { index: index as usize, text: fragment.to_string() });
                        }
                    }
                    "signature_delta" => {
                        if let Some(sig) = delta["signature"].as_str() {
                            self.signatures.insert(index, sig.to_string());
                        }
                    }
                    _ => {}
                }
                false
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                self.close_tool(index, push);
                let signature = self.signatures.remove(&index);
                push(AssistantMessageEvent::BlockEnd { index: index as usize, signature });
                false
            }
            "message_delta" => {
                if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                    self.close_all(push);
                    push(AssistantMessageEvent::MaxTokens);
                    return true;
                }
                if let Some(output_tokens) = v["usage"].get("output_tokens").and_then(|t| t.as_u64()) {
                    push(AssistantMessageEvent::Usage {
                        usage: Usage { output: output_tokens as u32, total: output_tokens as u32, ..Default::default() },
                    });
                }
                false
            }
            "message_stop" => {
                self.close_all(push);
                push(AssistantMessageEvent::Done);
                true
            }
            _ => false,
        }
    }
}

fn parse_message_start_usage(usage: &Value) -> Usage {
    let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
    let cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
    let cache_write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
    Usage { input, output: 0, cache_read, cache_write, total: input + cache_read + cache_write, cost: Default::default() }
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

    let mut state = AnthropicStreamState::default();
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
            push(AssistantMessageEvent::Error { message: "stream ended without message_stop".into() });
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
        for line in drain_complete_sse_lines(&mut buf) {
            match line {
                Ok(SseLine::Data(v)) => {
                    if state.apply_event(&v, &mut push) {
                        return;
                    }
                }
                Err(e) => {
                    push(AssistantMessageEvent::Error { message: e.to_string() });
                    return;
                }
            }
        }
    }
}

fn image_source(data: &str, mime: &str) -> Value {
    if data.starts_with("http") {
        json!({ "type": "url", "url": data })
    } else {
        let raw = data.strip_prefix("data:").and_then(|s| s.split(',').nth(1)).unwrap_or(data);
        json!({ "type": "base64", "media_type": mime, "data": raw })
    }
}

fn content_block_to_wire(b: &ContentBlock) -> Option<Value> {
    match b {
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Thinking { thinking, signature } => {
            let mut block = json!({ "type": "thinking", "thinking": thinking });
            if let Some(sig) = signature {
                block["signature"] = json!(sig);
            }
            Some(block)
        }
        ContentBlock::Image { data, mime } => Some(json!({ "type": "image", "source": image_source(data, mime) })),
        ContentBlock::ToolCall { id, name, arguments, .. } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        })),
    }
}

fn blocks_to_wire(blocks: &[ContentBlock]) -> Value {
    let parts: Vec<Value> = blocks.iter().filter_map(content_block_to_wire).collect();
    if let [only] = parts.as_slice() {
        if only["type"] == "text" {
            return only["text"].clone();
        }
    }
    json!(parts)
}

fn build_system(system_prompt: Option<&str>, cache_ctrl: Option<&Value>) -> Option<Value> {
    let text = system_prompt?;
    if text.is_empty() {
        return None;
    }
    match cache_ctrl {
        Some(ctrl) => Some(json!([{ "type": "text", "text": text, "cache_control": ctrl }])),
        None => Some(json!(text)),
    }
}

fn build_messages(context: &LlmContext) -> Vec<Value> {
    context
        .messages
        .iter()
        .map(|message| match message {
            Message::User(m) => json!({ "role": "user", "content": blocks_to_wire(&m.content) }),
            Message::Assistant(m) => json!({ "role": "assistant", "content": blocks_to_wire(&m.content) }),
            Message::ToolResult(m) => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id,
                    "content": blocks_to_wire(&m.content),
                });
                if m.is_error {
                    block["is_error"] = json!(true);
                }
                json!({ "role": "user", "content": [block] })
            }
        })
        .collect()
}

fn build_tools(tools: &[ToolSchema], cache_ctrl: Option<&Value>) -> Vec<Value> {
    let last = tools.len().saturating_sub(1);
    tools
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut wire = json!({ "name": t.name, "description": t.description, "input_schema": t.parameters });
            if i == last {
                if let Some(ctrl) = cache_ctrl {
                    wire["cache_control"] = ctrl.clone();
                }
            }
            wire
        })
        .collect()
}

/// Mark the last content block of the last message with `cache_control` so
/// Anthropic caches the whole conversation prefix up to this point.
fn attach_cache_control_to_last_block(messages: &mut [Value], cache_ctrl: &Value) {
    let Some(last) = messages.last_mut() else { return };
    let content = &mut last["content"];
    if content.is_string() {
        let text = content.as_str().unwrap_or_default().to_string();
        *content = json!([{ "type": "text", "text": text, "cache_control": cache_ctrl }]);
        return;
    }
    if let Some(arr) = content.as_array_mut() {
        if let Some(block) = arr.last_mut() {
            block["cache_control"] = cache_ctrl.clone();
        }
    }
}
