// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Translates the provider-abstract `thinking_level`/`reasoning` knob into
//! each provider's own vocabulary (spec §4.C.1, §9 "Thinking content").
//!
//! `CompletionOptions::reasoning` carries one of `off|minimal|low|medium|
//! high|xhigh` (the agent loop's [`crate` consumer]'s `ThinkingLevel`,
//! stringified before it reaches the adapter boundary). `off` or `None`
//! means "don't ask for extended thinking at all" everywhere; every other
//! level is mapped per-provider below.

use crate::types::{CompletionOptions, ThinkingBudgets};

/// `reasoning_effort` value OpenAI-family `/chat/completions` and
/// `/responses` accept: `minimal|low|medium|high`. There's no `xhigh` in
/// this vocabulary, so it collapses onto `high`.
pub fn openai_reasoning_effort(options: &CompletionOptions) -> Option<&'static str> {
    match options.reasoning.as_deref() {
        None | Some("off") => None,
        Some("minimal") => Some("minimal"),
        Some("low") => Some("low"),
        Some("medium") => Some("medium"),
        Some("high") | Some("xhigh") => Some("high"),
        Some(_) => None,
    }
}

/// The per-level token budget configured via `thinking_budgets`, falling
/// back to a sane default when the caller didn't configure one (providers
/// that require an explicit `budget_tokens`/`thinkingBudget` reject a
/// request with thinking enabled and no budget).
fn budget_for(level: &str, budgets: Option<&ThinkingBudgets>) -> Option<u32> {
    let configured = budgets.and_then(|b| match level {
        "minimal" => b.minimal,
        "low" => b.low,
        "medium" => b.medium,
        "high" | "xhigh" => b.high,
        _ => None,
    });
    configured.or(match level {
        "minimal" => Some(1024),
        "low" => Some(2048),
        "medium" => Some(8192),
        "high" => Some(16384),
        "xhigh" => Some(32768),
        _ => None,
    })
}

/// Anthropic's `thinking` request block: `{"type": "enabled", "budget_tokens": N}`,
/// or `None` when thinking is off. Anthropic requires `budget_tokens` to be
/// strictly less than `max_tokens`; callers are expected to have sized
/// `max_tokens` accordingly (out of scope here — this only derives the
/// requested budget).
pub fn anthropic_thinking_budget(options: &CompletionOptions) -> Option<u32> {
    match options.reasoning.as_deref() {
        None | Some("off") => None,
        Some(level) => budget_for(level, options.thinking_budgets.as_ref()),
    }
}

/// Google's `thinkingConfig.thinkingBudget`, in the same units as
/// Anthropic's `budget_tokens` (the Gemini API reuses a token budget, not
/// an effort enum).
pub fn google_thinking_budget(options: &CompletionOptions) -> Option<u32> {
    anthropic_thinking_budget(options)
}
