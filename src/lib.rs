// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin facade over the `pi-agent-*` crates.
//!
//! This crate re-exports the public surface of [`pi_agent_config`],
//! [`pi_agent_model`], [`pi_agent_tools`] and [`pi_agent_core`] so a caller
//! can depend on one crate instead of four, and provides
//! [`install_default_providers`], the one place that wires the adapters
//! this repo ships into the process-wide registry (spec §6 table). Mirrors
//! how the teacher's `sven-bootstrap` crate exists purely to give its
//! frontends a single canonical wiring point instead of each inlining its
//! own registration loop.

pub use pi_agent_config as config;
pub use pi_agent_core as core;
pub use pi_agent_model as model;
pub use pi_agent_tools as tools;

pub use pi_agent_config::{load, Config, ModelConfig};
pub use pi_agent_core::{run_loop, Agent, AgentError, AgentEvent, LoopConfig, LoopSeed, PromptInput, QueueDrainMode, ThinkingLevel};
pub use pi_agent_model::{
    default_api_key_env, fabricate_from_name, new_assistant_message_stream,
    pad_to_nine_alphanumeric, register_api_provider, resolve_api_key, resolve_model_from_config,
    unregister_api_providers, AnthropicAdapter, AssistantMessageAccumulator,
    AssistantMessageEvent, AssistantMessageEventStream, BlockKind, EchoMockAdapter, EventStream,
    GoogleAdapter, Model, ModelAdapter, OpenAiCompatAdapter, OpenAiResponsesAdapter,
    ScriptedMockAdapter,
};
pub use pi_agent_tools::{
    create_tool, execute_tool_calls, validate_tool_call, FunctionTool, OnUpdate, Tool,
    ToolExecutionEvent, ToolExecutionOutcome, ToolRegistry, ToolResult, ToolValidationError,
};

/// The api tags every bundled driver answers to, and the adapter
/// constructor that serves them, in the shape `install_default_providers`
/// wires into the registry. OpenAI-compatible family members all share one
/// [`OpenAiCompatAdapter`] type, parameterized by the tag they're
/// registered under (spec §6 table).
const OPENAI_COMPAT_TAGS: &[&str] = &[
    "openai-completions",
    "mistral-chat",
    "xai-chat",
    "openrouter-chat",
    "zhipu-chat",
    "groq-chat",
];

/// The `/responses`-shaped api tags (reasoning OpenAI models, and Azure
/// OpenAI deployments which speak the same framing per spec §6 table).
const OPENAI_RESPONSES_TAGS: &[&str] = &["openai-responses", "azure-openai-responses"];

/// Register the adapters this repo ships (OpenAI-compat family, the
/// OpenAI/Azure `/responses` family, Anthropic, Google, and the
/// deterministic mock) under their default api tags, so
/// `resolve_model_from_config` + `get_api_provider` work out of the box.
///
/// Idempotent: re-registering a tag simply replaces the previous entry
/// (see [`pi_agent_model::register_api_provider`]). A caller that wants a
/// narrower surface (e.g. only the mock adapter in tests) can skip this
/// and register adapters itself instead.
pub fn install_default_providers() {
    for &tag in OPENAI_COMPAT_TAGS {
        register_api_provider(std::sync::Arc::new(OpenAiCompatAdapter::new(tag)), None);
    }
    for &tag in OPENAI_RESPONSES_TAGS {
        register_api_provider(std::sync::Arc::new(OpenAiResponsesAdapter::new(tag)), None);
    }
    register_api_provider(std::sync::Arc::new(AnthropicAdapter::new()), None);
    register_api_provider(std::sync::Arc::new(GoogleAdapter::new()), None);
    register_api_provider(std::sync::Arc::new(EchoMockAdapter), None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_default_providers_registers_every_bundled_tag() {
        install_default_providers();
        let apis = pi_agent_model::registered_apis();
        for &tag in OPENAI_COMPAT_TAGS {
            assert!(apis.contains(&tag.to_string()), "missing {tag}");
        }
        for &tag in OPENAI_RESPONSES_TAGS {
            assert!(apis.contains(&tag.to_string()), "missing {tag}");
        }
        assert!(apis.contains(&"anthropic-messages".to_string()));
        assert!(apis.contains(&"google-generative-ai".to_string()));
        assert!(apis.contains(&"mock".to_string()));
    }
}
