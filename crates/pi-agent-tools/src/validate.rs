// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Argument validation against a tool's JSON Schema before it runs
//! (SPEC_FULL §1 item 4, grounded in `original_source/pi_agent/tools.py`'s
//! `validate_tool_call`). A validation failure is treated exactly like the
//! "tool-exception" path of spec §7: it becomes an error `ToolResult`, not
//! a panic or a loop abort.

use serde_json::Value;
use thiserror::Error;

use crate::tool::Tool;

#[derive(Debug, Error)]
#[error("tool '{tool_name}' parameter validation failed: {}", .errors.join(", "))]
pub struct ToolValidationError {
    pub tool_name: String,
    pub errors: Vec<String>,
}

/// Validate `args` against `tool`'s `parameters_schema()`. An empty or
/// absent schema (`{}` or missing `type`) always validates.
pub fn validate_tool_call(tool: &dyn Tool, args: &Value) -> Result<(), ToolValidationError> {
    let schema = tool.parameters_schema();
    if schema_is_trivial(&schema) {
        return Ok(());
    }

    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        // A tool that ships an uncompilable schema is a tool bug, not a
        // call-site error; don't block execution on it.
        Err(e) => {
            tracing::warn!(tool = tool.name(), error = %e, "tool parameter schema failed to compile");
            return Ok(());
        }
    };

    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolValidationError { tool_name: tool.name().to_string(), errors })
    }
}

fn schema_is_trivial(schema: &Value) -> bool {
    match schema.as_object() {
        None => true,
        Some(obj) => obj.is_empty() || (obj.len() == 1 && obj.get("type").and_then(Value::as_str) == Some("object") && obj.get("properties").is_none()),
    }
}
