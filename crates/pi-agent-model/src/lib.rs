// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod events;
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod registry;
pub mod resolve;
pub mod sanitize;
pub mod stream;
pub mod types;

mod anthropic;
mod google;
mod openai_compat;
mod openai_responses;
mod tool_call_id;

pub use events::{AssistantMessageEvent, BlockKind};
pub use mock::{EchoMockAdapter, ScriptedMockAdapter};
pub use provider::{
    new_assistant_message_stream, AssistantMessageAccumulator, AssistantMessageEventStream,
    ModelAdapter,
};
pub use registry::{
    clear_api_providers, get_api_provider, register_api_provider, registered_apis,
    unregister_api_providers,
};
pub use resolve::{default_api_key_env, resolve_api_key, resolve_model_from_config};
pub use stream::EventStream;
pub use types::*;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai_compat::OpenAiCompatAdapter;
pub use openai_responses::OpenAiResponsesAdapter;
pub use tool_call_id::{fabricate_from_name, pad_to_nine_alphanumeric};

/// Current wall-clock time in milliseconds, used for message timestamps.
///
/// Centralized so the rest of the crate never calls `chrono`/`SystemTime`
/// directly — keeps timestamp generation mockable in one place.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
