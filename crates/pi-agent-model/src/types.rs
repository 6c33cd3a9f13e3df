// SPDX-License-Identifier: MIT
//! The canonical message/content data model (spec §3, §4.A) and cost
//! accounting. Content blocks and messages are tagged sums matched
//! exhaustively throughout the crate, not duck-typed records — see
//! `DESIGN.md`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single content unit inside a message.
///
/// Snake_case on the wire; adapters translate to provider-specific casing
/// (see `openai_compat.rs`, `anthropic.rs`, `google.rs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Chain-of-thought content. Some providers (Anthropic, Google 2.5/3)
    /// require `signature` to be echoed back verbatim on subsequent turns;
    /// it is treated as opaque bytes, never inspected or regenerated.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// `data` is either a raw base64 payload or a `data:`/`https:` URL,
    /// depending on what the adapter that produced it embeds.
    Image {
        data: String,
        mime: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime: impl Into<String>) -> Self {
        ContentBlock::Image { data: data.into(), mime: mime.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Thinking { thinking, .. } => Some(thinking),
            _ => None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentBlock::ToolCall { .. })
    }
}

/// `stop | length | tool_use | error | aborted` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

/// Per-category monetary cost, in whatever currency the model's price
/// table is denominated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Integer token counts plus the derived monetary cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
    pub total: u32,
    pub cost: UsageCost,
}

impl Usage {
    /// Combine two usage records, re-deriving `total` and `cost` from the
    /// summed components (cost-linearity, spec §8 property 4).
    pub fn combine(&self, other: &Usage) -> Usage {
        Usage {
            input: self.input + other.input,
            output: self.output + other.output,
            cache_read: self.cache_read + other.cache_read,
            cache_write: self.cache_write + other.cache_write,
            total: self.input
                + other.input
                + self.output
                + other.output
                + self.cache_read
                + other.cache_read
                + self.cache_write
                + other.cache_write,
            cost: UsageCost {
                input: self.cost.input + other.cost.input,
                output: self.cost.output + other.cost.output,
                cache_read: self.cost.cache_read + other.cost.cache_read,
                cache_write: self.cost.cache_write + other.cost.cache_write,
                total: self.cost.total + other.cost.total,
            },
        }
    }
}

/// Per-million-token prices for each usage category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputModality {
    Text,
    Image,
}

/// A provider/model descriptor. `api` selects the registered adapter
/// (§4.D); `provider` is the credential namespace (§6 Authentication).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub api: String,
    pub provider: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub input_modalities: Vec<InputModality>,
    #[serde(default)]
    pub cost: ModelCost,
    pub context_window: u32,
    pub max_tokens: u32,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// Compute the monetary cost of a [`Usage`] record under a [`Model`]'s price
/// table: `token_count x (price_per_million / 1_000_000)` per category
/// (spec §3). Pure function of its two inputs; cost-linearity (spec §8
/// property 4) follows directly from this being linear in each token count.
pub fn compute_cost(usage: &Usage, model: &Model) -> UsageCost {
    let per_token = |price_per_million: f64| price_per_million / 1_000_000.0;
    let input = usage.input as f64 * per_token(model.cost.input);
    let output = usage.output as f64 * per_token(model.cost.output);
    let cache_read = usage.cache_read as f64 * per_token(model.cost.cache_read);
    let cache_write = usage.cache_write as f64 * per_token(model.cost.cache_write);
    UsageCost { input, output, cache_read, cache_write, total: input + output + cache_read + cache_write }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolCall { id, name, arguments, .. } => {
                Some((id.as_str(), name.as_str(), arguments))
            }
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_call)
    }

    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub is_error: bool,
    pub timestamp: i64,
}

/// A single message in a conversation history. Tagged on `role` to match
/// the wire-level discriminated union the original implementation uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Message::User(UserMessage { content: vec![ContentBlock::text(text)], timestamp })
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Message::User(m) => m.timestamp,
            Message::Assistant(m) => m.timestamp,
            Message::ToolResult(m) => m.timestamp,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant(_))
    }
}

/// A tool descriptor as presented to the model (JSON Schema parameters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// `none | short | long` prompt-cache retention hint (SPEC_FULL §1 item 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRetention {
    None,
    Short,
    Long,
}

/// Per-thinking-level token budgets (SPEC_FULL §1 item 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBudgets {
    pub minimal: Option<u32>,
    pub low: Option<u32>,
    pub medium: Option<u32>,
    pub high: Option<u32>,
}

/// The full set of knobs a caller may pass down to an adapter. Adapters
/// ignore fields they don't support.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub cache_retention: Option<CacheRetention>,
    pub session_id: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub max_retry_delay_ms: Option<u64>,
    pub tool_choice: Option<String>,
    pub reasoning: Option<String>,
    pub thinking_budgets: Option<ThinkingBudgets>,
}

/// The conversation as handed to a provider adapter.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSchema>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priced_model() -> Model {
        Model {
            id: "m".into(),
            name: "m".into(),
            api: "openai-completions".into(),
            provider: "openai".into(),
            base_url: None,
            reasoning: false,
            input_modalities: vec![InputModality::Text],
            cost: ModelCost { input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 },
            context_window: 128_000,
            max_tokens: 4096,
            headers: None,
        }
    }

    #[test]
    fn cost_is_linear_in_usage() {
        let model = priced_model();
        let u1 = Usage { input: 100, output: 50, cache_read: 10, cache_write: 5, total: 165, cost: UsageCost::default() };
        let u2 = Usage { input: 200, output: 20, cache_read: 0, cache_write: 0, total: 220, cost: UsageCost::default() };

        let c1 = compute_cost(&u1, &model);
        let c2 = compute_cost(&u2, &model);
        let mut u1_with_cost = u1;
        u1_with_cost.cost = c1;
        let summed = u1_with_cost.combine(&Usage { cost: c2, ..u2 });

        let direct = compute_cost(
            &Usage {
                input: u1.input + u2.input,
                output: u1.output + u2.output,
                cache_read: u1.cache_read + u2.cache_read,
                cache_write: u1.cache_write + u2.cache_write,
                total: 0,
                cost: UsageCost::default(),
            },
            &model,
        );
        assert!((summed.cost.total - direct.total).abs() < 1e-9);
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::Assistant(AssistantMessage {
            content: vec![
                ContentBlock::text("hi"),
                ContentBlock::ToolCall {
                    id: "t1".into(),
                    name: "echo".into(),
                    arguments: serde_json::json!({"x": 1}),
                    thought_signature: None,
                },
            ],
            api: "openai-completions".into(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 1234,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn tool_calls_iterates_only_tool_call_blocks() {
        let msg = AssistantMessage {
            content: vec![
                ContentBlock::text("thinking aloud"),
                ContentBlock::ToolCall {
                    id: "a".into(),
                    name: "n".into(),
                    arguments: serde_json::json!({}),
                    thought_signature: None,
                },
            ],
            api: "x".into(),
            provider: "x".into(),
            model: "x".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 0,
        };
        let calls: Vec<_> = msg.tool_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "a");
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StopReason::ToolUse).unwrap(), "\"tool_use\"");
        assert_eq!(serde_json::to_string(&StopReason::Aborted).unwrap(), "\"aborted\"");
    }
}
