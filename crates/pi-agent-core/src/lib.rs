// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod events;
mod loop_;
mod state;

pub use agent::{Agent, AgentError, PromptInput};
pub use events::AgentEvent;
pub use loop_::{run_loop, LoopConfig, LoopSeed};
pub use state::{AgentState, QueueDrainMode, ThinkingLevel};
