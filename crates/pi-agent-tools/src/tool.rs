// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool contract (spec §4.E / §6): `execute(call_id, args, cancel_token,
//! on_update) -> ToolResult`, cooperative with cancellation and able to
//! stream partial progress before it finishes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use pi_agent_model::ContentBlock;

/// The result of a single tool invocation. `content` holds only `Text` and
/// `Image` blocks, per the tool contract in spec §6.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub details: Option<Value>,
}

impl ToolResult {
    /// A single plain-text result.
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult { content: vec![ContentBlock::text(text)], details: None }
    }

    /// A result carrying structured `details` alongside its text.
    pub fn text_with_details(text: impl Into<String>, details: Value) -> Self {
        ToolResult { content: vec![ContentBlock::text(text)], details: Some(details) }
    }

    /// Concatenate all `Text` blocks into one string, for logging/display.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Streams a partial [`ToolResult`] out of a running [`Tool::execute`] call.
/// The executor turns each invocation into a `ToolExecutionUpdate` event
/// (spec §6). Calling it is synchronous and non-blocking — tools that want
/// to await something between updates should do so on their own task, not
/// inside the callback.
pub type OnUpdate = Arc<dyn Fn(ToolResult) + Send + Sync>;

/// Trait every tool — built-in or user-supplied — implements.
///
/// The executor (`crate::executor`) is the only caller of `execute`; it is
/// responsible for argument validation (`crate::validate`), timeouts, and
/// translating the outcome into a `ToolResultMessage`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the shape of `args`.
    fn parameters_schema(&self) -> Value;
    /// Human-readable label (e.g. for a UI); defaults to the tool's name.
    fn label(&self) -> &str {
        self.name()
    }

    /// Run the tool. Implementations must treat `cancel` cooperatively —
    /// check it at natural suspension points and return promptly once it is
    /// triggered. Returning `Err` is the "tool-exception" path of spec §7:
    /// the executor turns it into an error `ToolResult` and the loop
    /// continues.
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: CancellationToken,
        on_update: OnUpdate,
    ) -> anyhow::Result<ToolResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _call_id: &str,
            args: &Value,
            _cancel: CancellationToken,
            _on_update: OnUpdate,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::text(args.to_string()))
        }
    }

    #[test]
    fn label_defaults_to_name() {
        assert_eq!(EchoTool.label(), "echo");
    }

    #[test]
    fn as_text_joins_text_blocks() {
        let r = ToolResult {
            content: vec![ContentBlock::text("a"), ContentBlock::text("b")],
            details: None,
        };
        assert_eq!(r.as_text(), "a\nb");
    }

    #[tokio::test]
    async fn execute_roundtrips_args() {
        let out = EchoTool
            .execute("c1", &json!({"x": 1}), CancellationToken::new(), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(out.as_text(), r#"{"x":1}"#);
    }
}
