// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod create_tool;
pub mod events;
pub mod executor;
pub mod registry;
pub mod tool;
pub mod validate;

pub use create_tool::{create_tool, FunctionTool};
pub use events::ToolExecutionEvent;
pub use executor::{execute_tool_calls, ToolExecutionOutcome};
pub use registry::ToolRegistry;
pub use tool::{OnUpdate, Tool, ToolResult};
pub use validate::{validate_tool_call, ToolValidationError};
