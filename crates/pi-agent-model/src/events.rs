// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Events emitted by a [`crate::ModelAdapter`] while streaming an assistant response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Usage;

/// One event in the wire-level stream produced by a provider adapter.
///
/// Adapters emit a `Start`, followed by any number of block/tool-call
/// lifecycle events, and end with exactly one of `Done`, `MaxTokens` or
/// `Error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    /// The response has begun; no content has arrived yet.
    Start,

    /// A text or thinking block has begun at `index`.
    BlockStart { index: usize, kind: BlockKind },
    /// An incremental delta for the block at `index`.
    BlockDelta { index: usize, text: String },
    /// The block at `index` is complete. `signature` carries the opaque
    /// integrity blob some providers attach to a thinking block (Anthropic's
    /// `signature_delta`, Gemini's `thoughtSignature`) that must be echoed
    /// back verbatim on a later turn (spec §3, §9); `None` for blocks the
    /// provider never signs, or for providers that don't use this scheme.
    BlockEnd {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// A tool call has begun at `index`.
    ToolcallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// An incremental fragment of a tool call's JSON arguments.
    ToolcallDelta { index: usize, text: String },
    /// The tool call at `index` is complete; `arguments` is the fully
    /// parsed argument object (empty object if the call took no args).
    /// `signature` carries a provider's opaque thought-signature for this
    /// call (Gemini's `thoughtSignature`), `None` where the provider
    /// doesn't attach one.
    ToolcallEnd {
        index: usize,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    /// Usage accounting became available (may arrive mid-stream or only
    /// at the end, depending on provider).
    Usage { usage: Usage },

    /// The model stopped because it hit its output token limit. Distinct
    /// from `Done` so callers can distinguish truncation from a clean stop.
    MaxTokens,

    /// The stream completed normally.
    Done,

    /// The stream failed; `message` is a human-readable description.
    Error { message: String },
}

/// The kind of content block a `BlockStart`/`BlockEnd` pair wraps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Thinking,
}
