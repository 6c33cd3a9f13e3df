// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for every provider that speaks the OpenAI `/chat/completions`
//! SSE wire format unmodified (spec §6 table): OpenAI itself, Mistral,
//! xAI, OpenRouter, Zhipu.
//!
//! One [`OpenAiCompatAdapter`] instance is registered per api tag; all
//! instances share the same request/response translation and differ only
//! in which tag they answer to. Endpoint and authentication per call come
//! from the [`Model`] and [`CompletionOptions`] passed to `stream`, not
//! from adapter construction, since a single process may hold models from
//! several providers in this family at once.

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
use crate::tool_call_id::pad_to_nine_alphanumeric;
use crate::types::{CompletionOptions, ContentBlock, Context as LlmContext, Message, Model, ToolSchema, Usage};

/// Default base URL per provider id, used when [`Model::base_url`] is unset.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        _ => None,
    }
}

/// Providers in this family that reject tool-call ids other than exactly
/// nine alphanumeric characters (spec §9).
fn needs_id_padding(provider: &str) -> bool {
    matches!(provider, "mistral" | "zhipu")
}

pub struct OpenAiCompatAdapter {
    api_tag: String,
    client: reqwest::Client,
}

impl OpenAiCompatAdapter {
    pub fn new(api_tag: impl Into<String>) -> Self {
        OpenAiCompatAdapter { api_tag: api_tag.into(), client: reqwest::Client::new() }
    }
}

impl Default for OpenAiCompatAdapter {
    fn default() -> Self {
        Self::new("openai-completions")
    }
}

#[async_trait]
impl ModelAdapter for OpenAiCompatAdapter {
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
            .or_else(|| default_base_url(&model.provider))
            .with_context(|| format!("no base_url configured for provider '{}'", model.provider))?;
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));

        let messages = build_messages(context);
        let tools = context.tools.as_deref().map(build_tools).unwrap_or_default();

        let max_tokens = options.max_tokens.unwrap_or(model.max_tokens).max(1);
        let mut body = json!({
            "model": model.id,
            "messages": messages,
            "stream": true,
            "max_tokens": max_tokens,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(tc) = &options.tool_choice {
            body["tool_choice"] = json!(tc);
        }
        if let Some(effort) = crate::reasoning::openai_reasoning_effort(options) {
            body["reasoning_effort"] = json!(effort);
        }
        if self.api_tag == "openrouter-chat" {
            if let Some(session_id) = &options.session_id {
                body["prompt_cache_key"] = json!(session_id);
            }
        }

        debug!(
            api = %self.api_tag,
            model = %model.id,
            tool_count = tools.len(),
            message_count = messages.len(),
            "dispatching chat completion request"
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
        let pad_ids = needs_id_padding(&model.provider);

        tokio::spawn(run_sse_loop(resp, stream_for_task, acc, pad_ids, cancel));

        Ok(stream)
    }
}

/// One line of a chat-completions SSE body, already split and JSON-decoded.
#[derive(Debug)]
enum SseLine {
    Data(Value),
    Done,
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, leaving any
/// trailing partial line for the next chunk to extend. An SSE event may be
/// split across TCP packets; dropping a half-parsed line here would corrupt
/// tool-call argument accumulation downstream.
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
        if data == "[DONE]" {
            out.push(Ok(SseLine::Done));
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => out.push(Ok(SseLine::Data(v))),
            Err(e) => out.push(Err(anyhow::anyhow!(e))),
        }
    }
    out
}

/// Tracks which content index a text block, thinking block, or each
/// parallel tool call maps to, since text/thinking share an implicit slot
/// on the wire while tool calls carry their own `index` per parallel call.
#[derive(Default)]
struct StreamState {
    text_index: Option<usize>,
    thinking_index: Option<usize>,
    tool_index_map: HashMap<u64, usize>,
    tool_args: HashMap<usize, String>,
    next_index: usize,
}

impl StreamState {
    fn open_tool(
        &mut self,
        provider_index: u64,
        id: String,
        name: String,
        pad_ids: bool,
        push: &mut impl FnMut(AssistantMessageEvent),
    ) -> usize {
        if let Some(&idx) = self.tool_index_map.get(&provider_index) {
            return idx;
        }
        let idx = self.next_index;
        self.next_index += 1;
        self.tool_index_map.insert(provider_index, idx);
        self.tool_args.insert(idx, String::new());
        let id = if pad_ids { pad_to_nine_alphanumeric(&id) } else { id };
        push(AssistantMessageEvent::ToolcallStart { index: idx, id, name });
        idx
    }

    /// Fold one parsed SSE chunk into block/tool-call events. Returns `true`
    /// when the chunk signalled truncation (`finish_reason: "length"`), at
    /// which point the caller must stop reading and emit `MaxTokens`.
    fn apply_chunk(
        &mut self,
        v: &Value,
        pad_ids: bool,
        push: &mut impl FnMut(AssistantMessageEvent),
    ) -> bool {
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            push(AssistantMessageEvent::Usage { usage: parse_usage(usage) });
            return false;
        }
        if let Some(timings) = v.get("timings") {
            push(AssistantMessageEvent::Usage { usage: parse_timings(timings) });
            return false;
        }

        let choice = &v["choices"][0];
        if choice["finish_reason"].as_str() == Some("length") {
            self.close_open_tool_calls(push);
            return true;
        }

        let delta = &choice["delta"];

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let provider_index = tc["index"].as_u64().unwrap_or(0);
                let id = tc["id"].as_str().unwrap_or("").to_string();
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                let args_fragment = tc["function"]["arguments"].as_str().unwrap_or("");
                let idx = self.open_tool(provider_index, id, name, pad_ids, push);
                if !args_fragment.is_empty() {
                    self.tool_args.get_mut(&idx).unwrap().push_str(args_fragment);
                    push(AssistantMessageEvent::ToolcallDelta { index: idx, text: args_fragment.to_string() });
                }
            }
        }

        let thinking_text = delta
            .get("reasoning_content")
            .and_then(|c| c.as_str())
            .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
        if let Some(t) = thinking_text {
            if !t.is_empty() {
                if self.thinking_index.is_none() {
                    let idx = self.next_index;
                    self.next_index += 1;
                    self.thinking_index = Some(idx);
                    push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Thinking });
                }
                push(AssistantMessageEvent::BlockDelta { index: self.thinking_index.unwrap(), text: t.to_string() });
            }
        }

        if let Some(t) = delta.get("content").and_then(|c| c.as_str()) {
            if !t.is_empty() {
                if self.text_index.is_none() {
                    let idx = self.next_index;
                    self.next_index += 1;
                    self.text_index = Some(idx);
                    push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Text });
                }
                push(AssistantMessageEvent::BlockDelta { index: self.text_index.unwrap(), text: t.to_string() });
            }
        }

        false
    }

    /// Best-effort close of every tool call still open when the stream
    /// ends (via `[DONE]` or truncation): parse its accumulated argument
    /// buffer, falling back to an empty object if it never completed.
    fn close_open_tool_calls(&mut self, push: &mut impl FnMut(AssistantMessageEvent)) {
        let mut indices: Vec<usize> = self.tool_args.keys().copied().collect();
        indices.sort_unstable();
        for idx in indices {
            let buf = self.tool_args.remove(&idx).unwrap_or_default();
            let arguments = serde_json::from_str(&buf).unwrap_or_else(|_| json!({}));
            push(AssistantMessageEvent::ToolcallEnd { index: idx, arguments, signature: None });
        }
    }
}

/// OpenAI reports cached tokens in `prompt_tokens_details.cached_tokens`;
/// DeepSeek V3 reports them as `prompt_cache_hit_tokens` on the root usage
/// object. Both are tried so either provider's accounting is captured.
fn parse_usage(usage: &Value) -> Usage {
    let cache_read = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|t| t.as_u64())
        .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
        .unwrap_or(0) as u32;
    let input = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let output = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
    Usage { input, output, cache_read, cache_write: 0, total: input + output + cache_read, cost: Default::default() }
}

/// llama.cpp reports cache hits and fresh prompt tokens separately in a
/// top-level `timings` object on the final chunk instead of `usage`.
fn parse_timings(timings: &Value) -> Usage {
    let cache_n = timings["cache_n"].as_u64().unwrap_or(0) as u32;
    let prompt_n = timings["prompt_n"].as_u64().unwrap_or(0) as u32;
    let predicted_n = timings["predicted_n"].as_u64().unwrap_or(0) as u32;
    Usage {
        input: cache_n + prompt_n,
        output: predicted_n,
        cache_read: cache_n,
        cache_write: 0,
        total: cache_n + prompt_n + predicted_n,
        cost: Default::default(),
    }
}

async fn run_sse_loop(
    resp: reqwest::Response,
    stream: AssistantMessageEventStream,
    acc: Arc<Mutex<AssistantMessageAccumulator>>,
    pad_ids: bool,
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
            push(AssistantMessageEvent::Error { message: "stream ended without [DONE]".into() });
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
                Ok(SseLine::Done) => {
                    state.close_open_tool_calls(&mut push);
                    push(AssistantMessageEvent::Done);
                    return;
                }
                Ok(SseLine::Data(v)) => {
                    if state.apply_chunk(&v, pad_ids, &mut push) {
                        push(AssistantMessageEvent::MaxTokens);
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

fn content_block_to_wire_part(b: &ContentBlock) -> Option<Value> {
    match b {
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Image { data, mime } => {
            let url = if data.starts_with("data:") || data.starts_with("http") {
                data.clone()
            } else {
                format!("data:{mime};base64,{data}")
            };
            Some(json!({ "type": "image_url", "image_url": { "url": url } }))
        }
        ContentBlock::Thinking { .. } | ContentBlock::ToolCall { .. } => None,
    }
}

/// Collapse a block list to a plain string when it is a single text block
/// (the common case), otherwise emit the OpenAI multi-part content array.
fn blocks_to_wire_content(blocks: &[ContentBlock]) -> Value {
    let parts: Vec<Value> = blocks.iter().filter_map(content_block_to_wire_part).collect();
    if let [only] = parts.as_slice() {
        if only["type"] == "text" {
            return only["text"].clone();
        }
    }
    if parts.is_empty() {
        return json!("");
    }
    json!(parts)
}

fn tool_call_to_wire(id: &str, name: &str, arguments: &Value) -> Value {
    let args_str = if arguments.is_null() {
        "{}".to_string()
    } else {
        serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string())
    };
    json!({
        "id": id,
        "type": "function",
        "function": { "name": name, "arguments": args_str },
    })
}

/// Convert canonical messages plus the system prompt into the OpenAI
/// `/chat/completions` wire array. Every tool call from one turn already
/// lives as multiple `ContentBlock::ToolCall` entries inside a single
/// `AssistantMessage`, so no cross-message coalescing is needed here.
fn build_messages(context: &LlmContext) -> Vec<Value> {
    let mut out = Vec::with_capacity(context.messages.len() + 1);
    if let Some(sys) = &context.system_prompt {
        out.push(json!({ "role": "system", "content": sys }));
    }

    for message in &context.messages {
        match message {
            Message::User(m) => {
                out.push(json!({ "role": "user", "content": blocks_to_wire_content(&m.content) }));
            }
            Message::ToolResult(m) => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": blocks_to_wire_content(&m.content),
                }));
            }
            Message::Assistant(m) => {
                let text: String = m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                let calls: Vec<Value> = m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall { id, name, arguments, .. } => {
                            Some(tool_call_to_wire(id, name, arguments))
                        }
                        _ => None,
                    })
                    .collect();
                let mut wire = json!({ "role": "assistant" });
                if !text.is_empty() || calls.is_empty() {
                    wire["content"] = json!(text);
                }
                if !calls.is_empty() {
                    wire["tool_calls"] = json!(calls);
                }
                out.push(wire);
            }
        }
    }
    out
}

fn build_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
            })
        })
        .collect()
}
