// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session state (spec §3 "Agent state"). Owned by the facade
//! (`crate::agent::Agent`); mutated only in response to loop events
//! (spec §4.G "State mutations driven by loop events").

use std::collections::HashSet;

use pi_agent_model::{Message, Model};

/// A provider-abstract chain-of-thought knob, translated to each
/// provider's own vocabulary by the adapter (spec §4.C.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl ThinkingLevel {
    pub fn as_reasoning_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::XHigh => "xhigh",
        }
    }
}

/// How a queue is drained: one message at a time, or all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueDrainMode {
    #[default]
    OneAtATime,
    All,
}

impl QueueDrainMode {
    /// Remove and return the messages this mode dequeues from `queue`.
    pub fn drain(&self, queue: &mut Vec<Message>) -> Vec<Message> {
        match self {
            QueueDrainMode::OneAtATime => {
                if queue.is_empty() {
                    Vec::new()
                } else {
                    vec![queue.remove(0)]
                }
            }
            QueueDrainMode::All => std::mem::take(queue),
        }
    }
}

/// The facade's session state (spec §3 "Agent state").
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub system_prompt: String,
    pub model: Option<Model>,
    pub thinking_level: ThinkingLevel,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub stream_message: Option<Message>,
    pub pending_tool_calls: HashSet<String>,
    pub error: Option<String>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid iff `continue_()` may be called: history is non-empty and
    /// the last message is not an assistant message (spec §4.F).
    pub fn can_continue(&self) -> bool {
        match self.messages.last() {
            None => false,
            Some(message) => !message.is_assistant(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_cannot_continue() {
        assert!(!AgentState::new().can_continue());
    }

    #[test]
    fn can_continue_when_last_message_is_not_assistant() {
        let mut state = AgentState::new();
        state.messages.push(Message::user("hi", 0));
        assert!(state.can_continue());
    }

    #[test]
    fn cannot_continue_when_last_message_is_assistant() {
        let mut state = AgentState::new();
        state.messages.push(Message::user("hi", 0));
        state.messages.push(Message::Assistant(pi_agent_model::AssistantMessage {
            content: vec![],
            api: "mock".into(),
            provider: "mock".into(),
            model: "mock".into(),
            usage: Default::default(),
            stop_reason: pi_agent_model::StopReason::Stop,
            error_message: None,
            timestamp: 0,
        }));
        assert!(!state.can_continue());
    }

    #[test]
    fn one_at_a_time_drains_a_single_message() {
        let mut queue = vec![Message::user("a", 0), Message::user("b", 1)];
        let drained = QueueDrainMode::OneAtATime.drain(&mut queue);
        assert_eq!(drained.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn all_drains_everything() {
        let mut queue = vec![Message::user("a", 0), Message::user("b", 1)];
        let drained = QueueDrainMode::All.drain(&mut queue);
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
