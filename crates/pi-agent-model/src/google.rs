// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for Google's Generative Language API (spec §6 table): NDJSON
//! framing, `x-goog-api-key` header auth, and function-call ids fabricated
//! from the function name since Gemini never assigns them.

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
use crate::tool_call_id::fabricate_from_name;
use crate::types::{CompletionOptions, ContentBlock, Context as LlmContext, Message, Model, ToolSchema};

pub struct GoogleAdapter {
    client: reqwest::Client,
}

impl GoogleAdapter {
    pub fn new() -> Self {
        GoogleAdapter { client: reqwest::Client::new() }
    }
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelAdapter for GoogleAdapter {
    fn api(&self) -> &str {
        "google-generative-ai"
    }

    async fn stream(
        &self,
        model: &Model,
        context: &LlmContext,
        options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<AssistantMessageEventStream> {
        let key = options.api_key.as_deref().context("API key not set for Google model")?;
        let base = model.base_url.as_deref().unwrap_or("https://generativelanguage.googleapis.com");
        let url = format!("{}/v1beta/models/{}:streamGenerateContent", base.trim_end_matches('/'), model.id);

        let name_map = build_tool_name_map(context);
        let contents = build_contents(context, &name_map);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": options.max_tokens.unwrap_or(model.max_tokens).max(1),
            },
        });
        if let Some(t) = options.temperature {
            body["generationConfig"]["temperature"] = json!(t);
        }
        if let Some(budget) = crate::reasoning::google_thinking_budget(options) {
            body["generationConfig"]["thinkingConfig"] = json!({
                "thinkingBudget": budget,
                "includeThoughts": true,
            });
        }
        if let Some(sys) = &context.system_prompt {
            if !sys.is_empty() {
                body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
            }
        }
        if let Some(tools) = context.tools.as_deref() {
            if !tools.is_empty() {
                body["tools"] = json!([{ "functionDeclarations": build_function_declarations(tools) }]);
            }
        }

        debug!(model = %model.id, "dispatching google generateContent request");

        let mut req = self.client.post(&url).header("x-goog-api-key", key);
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

        let resp = req.json(&body).send().await.context("Google request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Google error {status}: {text}");
        }

        let acc = Arc::new(Mutex::new(AssistantMessageAccumulator::new(model)));
        let acc_for_result = acc.clone();
        let stream = new_assistant_message_stream(move |_| Some(acc_for_result.lock().unwrap().finish()));
        let stream_for_task = stream.clone();

        tokio::spawn(run_ndjson_loop(resp, stream_for_task, acc, cancel));

        Ok(stream)
    }
}

/// Extract every complete top-level JSON object from `buf`, leaving a
/// trailing partial object (or array punctuation) for the next chunk to
/// extend. Gemini's non-SSE `streamGenerateContent` body is a JSON array
/// whose elements arrive incrementally; this walks brace depth (respecting
/// quoted strings) rather than assuming line-delimited framing.
fn extract_json_objects(buf: &mut String) -> Vec<Value> {
    let mut out = Vec::new();
    loop {
        let Some(start) = buf.find(|c: char| !c.is_whitespace() && c != '[' && c != ']' && c != ',') else {
            buf.clear();
            break;
        };
        if buf.as_bytes()[start] != b'{' {
            *buf = buf[start + 1..].to_string();
            continue;
        }
        let bytes = buf.as_bytes();
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape = false;
        let mut end = None;
        for (i, &byte) in bytes.iter().enumerate().skip(start) {
            let c = byte as char;
            if in_string {
                if escape {
                    escape = false;
                } else if c == '\\' {
                    escape = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(end) = end else { break };
        if let Ok(v) = serde_json::from_str::<Value>(&buf[start..=end]) {
            out.push(v);
        }
        *buf = buf[end + 1..].to_string();
    }
    out
}

/// Outcome of folding one parsed Gemini chunk.
enum ChunkOutcome {
    Continue,
    Done,
    MaxTokens,
}

#[derive(Default)]
struct GoogleStreamState {
    text_index: Option<usize>,
    thinking_index: Option<usize>,
    next_index: usize,
    tool_call_counter: usize,
}

impl GoogleStreamState {
    fn apply_chunk(&mut self, v: &Value, push: &mut impl FnMut(AssistantMessageEvent)) -> ChunkOutcome {
        if let Some(meta) = v.get("usageMetadata") {
            let input = meta["promptTokenCount"].as_u64().unwrap_or(0) as u32;
            let output = meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
            let cache_read = meta["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32;
            push(AssistantMessageEvent::Usage {
                usage: crate::types::Usage {
                    input,
                    output,
                    cache_read,
                    cache_write: 0,
                    total: input + output + cache_read,
                    cost: Default::default(),
                },
            });
        }

        let candidate = &v["candidates"][0];
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    if let Some(text) = part["text"].as_str() {
                        if !text.is_empty() {
                            if self.thinking_index.is_none() {
                                let idx = self.next_index;
                                self.next_index += 1;
                                self.thinking_index = Some(idx);
                                push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Thinking });
                            }
                            push(AssistantMessageEvent::BlockDelta { index: self.thinking_index.unwrap(), text: text.to_string() });
                        }
                    }
                    continue;
                }
                if let Some(fc) = part.get("functionCall") {
                    let name = fc["name"].as_str().unwrap_or("").to_string();
                    let id = fabricate_from_name(&name, self.tool_call_counter);
                    self.tool_call_counter += 1;
                    let idx = self.next_index;
                    self.next_index += 1;
                    let signature = fc.get("thoughtSignature").and_then(|s| s.as_str()).map(str::to_string)
                        .or_else(|| part.get("thoughtSignature").and_then(|s| s.as_str()).map(str::to_string));
                    push(AssistantMessageEvent::ToolcallStart { index: idx, id, name });
                    push(AssistantMessageEvent::ToolcallEnd { index: idx, arguments: fc["args"].clone(), signature });
                    continue;
                }
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        if self.text_index.is_none() {
                            let idx = self.next_index;
                            self.next_index += 1;
                            self.text_index = Some(idx);
                            push(AssistantMessageEvent::BlockStart { index: idx, kind: BlockKind::Text });
                        }
                        push(AssistantMessageEvent::BlockDelta { index: self.text_index.unwrap(), text: text.to_string() });
                    }
                }
            }
        }

        match candidate["finishReason"].as_str() {
            Some("MAX_TOKENS") => ChunkOutcome::MaxTokens,
            Some(_) => ChunkOutcome::Done,
            None => ChunkOutcome::Continue,
        }
    }
}

async fn run_ndjson_loop(
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

    let mut state = GoogleStreamState::default();
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
            push(AssistantMessageEvent::Error { message: "stream ended without a finishReason".into() });
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
        for v in extract_json_objects(&mut buf) {
            match state.apply_chunk(&v, &mut push) {
                ChunkOutcome::Continue => {}
                ChunkOutcome::Done => {
                    push(AssistantMessageEvent::Done);
                    return;
                }
                ChunkOutcome::MaxTokens => {
                    push(AssistantMessageEvent::MaxTokens);
                    return;
                }
            }
        }
    }
}

/// Gemini resolves `functionResponse` parts to the call they answer by
/// function name, not an opaque id, so every prior tool call's id/name is
/// indexed up front.
fn build_tool_name_map(context: &LlmContext) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for message in &context.messages {
        if let Message::Assistant(m) = message {
            for block in &m.content {
                if let ContentBlock::ToolCall { id, name, .. } = block {
                    map.insert(id.clone(), name.clone());
                }
            }
        }
    }
    map
}

fn image_part(data: &str, mime: &str) -> Value {
    if data.starts_with("http") {
        json!({ "file_data": { "file_uri": data, "mime_type": mime } })
    } else {
        let raw = data.strip_prefix("data:").and_then(|s| s.split(',').nth(1)).unwrap_or(data);
        json!({ "inline_data": { "mime_type": mime, "data": raw } })
    }
}

fn content_block_to_parts(b: &ContentBlock) -> Vec<Value> {
    match b {
        ContentBlock::Text { text } => vec![json!({ "text": text })],
        ContentBlock::Thinking { thinking, signature } => {
            let mut part = json!({ "text": thinking, "thought": true });
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
            vec![part]
        }
        ContentBlock::Image { data, mime } => vec![image_part(data, mime)],
        ContentBlock::ToolCall { name, arguments, thought_signature, .. } => {
            let mut part = json!({ "functionCall": { "name": name, "args": arguments } });
            if let Some(sig) = thought_signature {
                part["thoughtSignature"] = json!(sig);
            }
            vec![part]
        }
    }
}

fn tool_result_to_parts(tool_call_id: &str, tool_name: &str, content: &[ContentBlock], name_map: &HashMap<String, String>) -> Vec<Value> {
    let fn_name = name_map.get(tool_call_id).map(|s| s.as_str()).unwrap_or(tool_name);
    let text: String = content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let output = if text.is_empty() { "[see attached images]".to_string() } else { text };

    let mut parts = vec![json!({ "functionResponse": { "name": fn_name, "response": { "output": output } } })];
    for b in content {
        if let ContentBlock::Image { data, mime } = b {
            parts.push(image_part(data, mime));
        }
    }
    parts
}

fn build_contents(context: &LlmContext, name_map: &HashMap<String, String>) -> Vec<Value> {
    context
        .messages
        .iter()
        .map(|message| match message {
            Message::User(m) => {
                let parts: Vec<Value> = m.content.iter().flat_map(content_block_to_parts).collect();
                json!({ "role": "user", "parts": parts })
            }
            Message::Assistant(m) => {
                let parts: Vec<Value> = m.content.iter().flat_map(content_block_to_parts).collect();
                json!({ "role": "model", "parts": parts })
            }
            Message::ToolResult(m) => {
                let parts = tool_result_to_parts(&m.tool_call_id, &m.tool_name, &m.content, name_map);
                json!({ "role": "user", "parts": parts })
            }
        })
        .collect()
}

fn build_function_declarations(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, StopReason, ToolResultMessage, Usage, UserMessage};

    // ── extract_json_objects ───────────────────────────────────────────────

    #[test]
    fn extract_single_complete_object() {
        let mut buf = "[{\"a\":1}]".to_string();
        let objs = extract_json_objects(&mut buf);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0]["a"], 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_retains_incomplete_trailing_object() {
        let mut buf = "[{\"a\":1},{\"b\":2".to_string();
        let objs = extract_json_objects(&mut buf);
        assert_eq!(objs.len(), 1);
        assert_eq!(buf, "{\"b\":2");
    }

    #[test]
    fn extract_ignores_braces_inside_strings() {
        let mut buf = "[{\"text\":\"a{b}c\"}]".to_string();
        let objs = extract_json_objects(&mut buf);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0]["text"], "a{b}c");
    }

    #[test]
    fn extract_multiple_objects_across_two_chunks() {
        let mut buf = "[{\"a\":1},".to_string();
        let first = extract_json_objects(&mut buf);
        assert_eq!(first.len(), 1);
        buf.push_str("{\"b\":2}]");
        let second = extract_json_objects(&mut buf);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["b"], 2);
    }

    // ── GoogleStreamState::apply_chunk ──────────────────────────────────────

    fn collect(v: Value, state: &mut GoogleStreamState) -> (Vec<AssistantMessageEvent>, bool, bool) {
        let mut out = Vec::new();
        let outcome = state.apply_chunk(&v, &mut |e| out.push(e));
        let (done, max) = match outcome {
            ChunkOutcome::Continue => (false, false),
            ChunkOutcome::Done => (true, false),
            ChunkOutcome::MaxTokens => (false, true),
        };
        (out, done, max)
    }

    #[test]
    fn usage_metadata_emits_usage_event() {
        let mut state = GoogleStreamState::default();
        let (events, ..) = collect(json!({"usageMetadata":{"promptTokenCount":100,"candidatesTokenCount":50,"cachedContentTokenCount":10}}), &mut state);
        assert!(matches!(&events[0], AssistantMessageEvent::Usage { usage } if usage.input == 100 && usage.output == 50 && usage.cache_read == 10));
    }

    #[test]
    fn text_part_opens_block_and_streams_delta() {
        let mut state = GoogleStreamState::default();
        let (events, ..) = collect(json!({"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}), &mut state);
        assert!(matches!(&events[0], AssistantMessageEvent::BlockStart { kind: BlockKind::Text, .. }));
        assert!(matches!(&events[1], AssistantMessageEvent::BlockDelta { text, .. } if text == "hello"));
    }

    #[test]
    fn thought_part_opens_thinking_block() {
        let mut state = GoogleStreamState::default();
        let (events, ..) = collect(json!({"candidates":[{"content":{"parts":[{"text":"reasoning","thought":true}]}}]}), &mut state);
        assert!(matches!(&events[0], AssistantMessageEvent::BlockStart { kind: BlockKind::Thinking, .. }));
    }

    #[test]
    fn function_call_fabricates_id_and_closes_immediately() {
        let mut state = GoogleStreamState::default();
        let (events, ..) = collect(
            json!({"candidates":[{"content":{"parts":[{"functionCall":{"name":"shell","args":{"cmd":"ls"}}}]}}]}),
            &mut state,
        );
        assert!(matches!(&events[0], AssistantMessageEvent::ToolcallStart { id, name, .. } if id == "shell_0" && name == "shell"));
        assert!(matches!(&events[1], AssistantMessageEvent::ToolcallEnd { arguments, .. } if arguments["cmd"] == "ls"));
    }

    #[test]
    fn function_call_thought_signature_is_carried_onto_toolcall_end() {
        let mut state = GoogleStreamState::default();
        let (events, ..) = collect(
            json!({"candidates":[{"content":{"parts":[{"functionCall":{"name":"shell","args":{}},"thoughtSignature":"sig-1"}]}}]}),
            &mut state,
        );
        assert!(matches!(&events[1], AssistantMessageEvent::ToolcallEnd { signature: Some(sig), .. } if sig == "sig-1"));
    }

    #[test]
    fn two_function_calls_get_distinct_fabricated_ids() {
        let mut state = GoogleStreamState::default();
        collect(json!({"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{}}}]}}]}), &mut state);
        let (events, ..) = collect(json!({"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{}}}]}}]}), &mut state);
        assert!(matches!(&events[0], AssistantMessageEvent::ToolcallStart { id, .. } if id == "f_1"));
    }

    #[test]
    fn finish_reason_max_tokens_signals_truncation() {
        let mut state = GoogleStreamState::default();
        let (_, done, max) = collect(json!({"candidates":[{"finishReason":"MAX_TOKENS"}]}), &mut state);
        assert!(!done);
        assert!(max);
    }

    #[test]
    fn finish_reason_stop_signals_done() {
        let mut state = GoogleStreamState::default();
        let (_, done, max) = collect(json!({"candidates":[{"finishReason":"STOP"}]}), &mut state);
        assert!(done);
        assert!(!max);
    }

    // ── message building ────────────────────────────────────────────────

    #[test]
    fn tool_result_uses_function_name_not_call_id() {
        let assistant = Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::ToolCall {
                id: "call_opaque_123".into(),
                name: "read_file".into(),
                arguments: json!({}),
                thought_signature: None,
            }],
            api: "google-generative-ai".into(),
            provider: "google".into(),
            model: "gemini-2.0-flash".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 0,
        });
        let tool_result = Message::ToolResult(ToolResultMessage {
            tool_call_id: "call_opaque_123".into(),
            tool_name: "read_file".into(),
            content: vec![ContentBlock::Text { text: "contents".into() }],
            details: None,
            is_error: false,
            timestamp: 0,
        });
        let ctx = LlmContext { system_prompt: None, messages: vec![assistant, tool_result], tools: None };
        let name_map = build_tool_name_map(&ctx);
        let contents = build_contents(&ctx, &name_map);
        assert_eq!(contents[1]["parts"][0]["functionResponse"]["name"], "read_file");
    }

    #[test]
    fn tool_result_falls_back_to_call_id_when_unmapped() {
        let tool_result = Message::ToolResult(ToolResultMessage {
            tool_call_id: "unmapped".into(),
            tool_name: "unmapped".into(),
            content: vec![ContentBlock::Text { text: "result".into() }],
            details: None,
            is_error: false,
            timestamp: 0,
        });
        let ctx = LlmContext { system_prompt: None, messages: vec![tool_result], tools: None };
        let contents = build_contents(&ctx, &HashMap::new());
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["name"], "unmapped");
    }

    #[test]
    fn image_only_tool_result_uses_placeholder_text() {
        let tool_result = Message::ToolResult(ToolResultMessage {
            tool_call_id: "tc-1".into(),
            tool_name: "screenshot".into(),
            content: vec![ContentBlock::Image { data: "abc=".into(), mime: "image/png".into() }],
            details: None,
            is_error: false,
            timestamp: 0,
        });
        let ctx = LlmContext { system_prompt: None, messages: vec![tool_result], tools: None };
        let contents = build_contents(&ctx, &HashMap::new());
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["response"]["output"], "[see attached images]");
        assert_eq!(contents[0]["parts"][1]["inline_data"]["mime_type"], "image/png");
    }

    #[test]
    fn user_message_with_image_uses_inline_data() {
        let msg = Message::User(UserMessage {
            content: vec![ContentBlock::Text { text: "look".into() }, ContentBlock::Image { data: "abc=".into(), mime: "image/png".into() }],
            timestamp: 0,
        });
        let ctx = LlmContext { system_prompt: None, messages: vec![msg], tools: None };
        let contents = build_contents(&ctx, &HashMap::new());
        assert_eq!(contents[0]["parts"][0]["text"], "look");
        assert_eq!(contents[0]["parts"][1]["inline_data"]["mime_type"], "image/png");
    }
}
