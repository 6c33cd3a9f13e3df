// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A function-based [`Tool`] builder (SPEC_FULL §1 item 5), for callers who
//! have a closure instead of a type implementing the trait. Grounded in
//! `original_source/pi_agent/tools.py::create_tool`, including its
//! automatic-validation wrapping — but here validation is already the
//! executor's job (`crate::validate`), so this just saves boilerplate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tool::{OnUpdate, Tool, ToolResult};

type ExecuteFn = Arc<
    dyn Fn(String, Value, CancellationToken, OnUpdate) -> Pin<Box<dyn Future<Output = anyhow::Result<ToolResult>> + Send>>
        + Send
        + Sync,
>;

/// A [`Tool`] assembled from plain data plus a closure, for one-off or
/// dynamically-defined tools that don't warrant their own type.
pub struct FunctionTool {
    name: String,
    description: String,
    label: String,
    parameters: Value,
    execute_fn: ExecuteFn,
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }
    fn label(&self) -> &str {
        &self.label
    }
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        cancel: CancellationToken,
        on_update: OnUpdate,
    ) -> anyhow::Result<ToolResult> {
        (self.execute_fn)(call_id.to_string(), args.clone(), cancel, on_update).await
    }
}

/// Build a [`Tool`] from a name, description, JSON Schema, and an async
/// execute function, without writing out a struct and `impl Tool` by hand.
///
/// ```ignore
/// let tool = create_tool(
///     "add",
///     "Add two numbers",
///     json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}}),
///     |_call_id, args, _cancel, _on_update| async move {
///         Ok(ToolResult::text((args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap()).to_string()))
///     },
/// );
/// ```
pub fn create_tool<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: Value,
    execute_fn: F,
) -> FunctionTool
where
    F: Fn(String, Value, CancellationToken, OnUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ToolResult>> + Send + 'static,
{
    let name = name.into();
    FunctionTool {
        label: name.clone(),
        name,
        description: description.into(),
        parameters,
        execute_fn: Arc::new(move |call_id, args, cancel, on_update| {
            Box::pin(execute_fn(call_id, args, cancel, on_update))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_tool_wires_execute_closure() {
        let tool = create_tool("add", "adds two numbers", json!({"type": "object"}), |_id, args, _cancel, _on_update| async move {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            Ok(ToolResult::text((a + b).to_string()))
        });

        assert_eq!(tool.name(), "add");
        assert_eq!(tool.label(), "add");

        let out = tool
            .execute("c1", &json!({"a": 2, "b": 3}), CancellationToken::new(), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(out.as_text(), "5");
    }
}
