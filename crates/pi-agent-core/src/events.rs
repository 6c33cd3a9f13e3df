// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent's outward event stream (spec §6 "Events"). Listeners
//! registered on the facade (`crate::agent::Agent`) see these, totally
//! ordered, once per activation, matching the ordering grammar in
//! spec §5.

use pi_agent_model::{AssistantMessage, AssistantMessageEvent, Message, ToolResultMessage};
use pi_agent_tools::{ToolExecutionEvent, ToolResult};
use serde_json::Value;

/// One event in an activation's trace. See spec §5 "Ordering" for the
/// grammar these are emitted in:
/// `AgentStart TurnStart MessageStart* MessageUpdate* MessageEnd
/// (ToolExecutionStart ToolExecutionUpdate* ToolExecutionEnd MessageStart
/// MessageEnd)* TurnEnd ... AgentEnd`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Emitted exactly once, at the start of an activation.
    AgentStart,
    /// Emitted exactly once, at the end of an activation (normal or error).
    AgentEnd { messages: Vec<Message> },
    /// One per turn, except the very first (which is implied by `AgentStart`).
    TurnStart,
    /// One per turn: the assistant message that ended it, plus any tool
    /// results produced along the way.
    TurnEnd { message: AssistantMessage, tool_results: Vec<ToolResultMessage> },
    /// A message has begun: a queued user/steering message, a streaming
    /// assistant response (partial snapshot), or a synthesized tool result.
    MessageStart { message: Message },
    /// An incremental update to a streaming assistant message.
    MessageUpdate { message: Message, assistant_message_event: AssistantMessageEvent },
    /// A message is final.
    MessageEnd { message: Message },
    ToolExecutionStart { tool_call_id: String, tool_name: String, args: Value },
    ToolExecutionUpdate { tool_call_id: String, tool_name: String, args: Value, partial_result: ToolResult },
    ToolExecutionEnd { tool_call_id: String, tool_name: String, result: ToolResult, is_error: bool },
}

impl AgentEvent {
    /// Lift a tool-executor lifecycle event into the agent's own event
    /// type, for forwarding to listeners (spec §4.E / §6).
    pub fn from_tool_event(event: ToolExecutionEvent) -> Self {
        match event {
            ToolExecutionEvent::Start { tool_call_id, tool_name, args } => {
                AgentEvent::ToolExecutionStart { tool_call_id, tool_name, args }
            }
            ToolExecutionEvent::Update { tool_call_id, tool_name, args, partial_result } => {
                AgentEvent::ToolExecutionUpdate { tool_call_id, tool_name, args, partial_result }
            }
            ToolExecutionEvent::End { tool_call_id, tool_name, result, is_error } => {
                AgentEvent::ToolExecutionEnd { tool_call_id, tool_name, result, is_error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_event_lifts_into_agent_event() {
        let tool_event = ToolExecutionEvent::Start {
            tool_call_id: "t1".into(),
            tool_name: "echo".into(),
            args: json!({"x": 1}),
        };
        match AgentEvent::from_tool_event(tool_event) {
            AgentEvent::ToolExecutionStart { tool_call_id, .. } => assert_eq!(tool_call_id, "t1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
