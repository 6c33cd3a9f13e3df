// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn cycle (spec §4.F): steering → assistant stream → tool exec →
//! repeat, draining follow-ups once the tool-calling chain goes idle.
//! Grounded on `original_source/pi_agent/loop.py`.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pi_agent_model::{
    get_api_provider, now_millis, AssistantMessage, AssistantMessageAccumulator,
    AssistantMessageEvent, CompletionOptions, Context, Message, Model, StopReason,
};
use pi_agent_tools::{execute_tool_calls, ToolRegistry};

use crate::events::AgentEvent;
use crate::state::ThinkingLevel;

/// Knobs threaded through one activation of [`run_loop`]. Built by the
/// facade (`crate::agent`) from its configuration and current model.
#[derive(Clone)]
pub struct LoopConfig {
    pub model: Model,
    pub thinking_level: ThinkingLevel,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub session_id: Option<String>,
    pub cache_retention: Option<pi_agent_model::CacheRetention>,
    pub thinking_budgets: Option<pi_agent_model::ThinkingBudgets>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_on_rate_limit: bool,
    pub max_retry_delay_ms: u64,
    pub tool_timeout_ms: Option<u64>,
    pub llm_timeout_ms: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            model: Model::default(),
            thinking_level: ThinkingLevel::Off,
            temperature: None,
            max_tokens: None,
            api_key: None,
            session_id: None,
            cache_retention: None,
            thinking_budgets: None,
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_on_rate_limit: true,
            max_retry_delay_ms: 30_000,
            tool_timeout_ms: Some(60_000),
            llm_timeout_ms: Some(120_000),
        }
    }
}

/// What `pending` should be seeded with when an activation starts.
pub enum LoopSeed {
    /// A fresh prompt, or a continuation already holding the messages to
    /// feed in (e.g. a dequeued steering/follow-up batch).
    Messages(Vec<Message>),
    /// Bare `continue_()`: drain the steering queue to find the seed.
    DrainSteering,
}

fn is_retriable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate") || lower.contains("limit") || lower.contains("429")
}

fn error_message(model: &Model, text: String, stop_reason: StopReason) -> AssistantMessage {
    AssistantMessage {
        content: Vec::new(),
        api: model.api.clone(),
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: pi_agent_model::Usage::default(),
        stop_reason,
        error_message: Some(text),
        timestamp: now_millis(),
    }
}

async fn backoff(attempt: u32, config: &LoopConfig, cancel: &CancellationToken) {
    let base = config.retry_delay_ms.saturating_mul(1u64 << attempt.min(20));
    let jitter = (now_millis().unsigned_abs()) % 1000;
    let delay_ms = base.saturating_add(jitter).min(config.max_retry_delay_ms);
    debug!(attempt, delay_ms, "backing off before retry");
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
    }
}

/// Stream one assistant turn, retrying on transport/timeout/rate-limit
/// failures up to `config.max_retries` (spec §4.F "Retry and backoff").
async fn stream_assistant<Emit>(
    system_prompt: &str,
    tools: &ToolRegistry,
    history: &[Message],
    config: &LoopConfig,
    cancel: CancellationToken,
    emit: &mut Emit,
) -> AssistantMessage
where
    Emit: FnMut(AgentEvent),
{
    let Some(adapter) = get_api_provider(&config.model.api) else {
        return error_message(
            &config.model,
            format!("no adapter registered for api '{}'", config.model.api),
            StopReason::Error,
        );
    };

    let context = Context {
        system_prompt: Some(system_prompt.to_string()),
        messages: history.to_vec(),
        tools: if tools.is_empty() { None } else { Some(tools.schemas()) },
    };

    let options = CompletionOptions {
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        api_key: config.api_key.clone(),
        cache_retention: config.cache_retention,
        session_id: config.session_id.clone(),
        headers: config.model.headers.clone(),
        max_retry_delay_ms: Some(config.max_retry_delay_ms),
        tool_choice: None,
        reasoning: Some(config.thinking_level.as_reasoning_str().to_string()),
        thinking_budgets: config.thinking_budgets,
    };

    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return error_message(&config.model, "aborted".into(), StopReason::Aborted);
        }

        let acquire = adapter.stream(&config.model, &context, &options, cancel.clone());
        let acquired = match config.llm_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), acquire).await,
            None => Ok(acquire.await),
        };

        let mut stream = match acquired {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let text = e.to_string();
                if attempt < config.max_retries && config.retry_on_rate_limit && is_retriable_message(&text) {
                    warn!(attempt, error = %text, "retriable transport error, backing off");
                    attempt += 1;
                    backoff(attempt, config, &cancel).await;
                    continue;
                }
                return error_message(&config.model, text, StopReason::Error);
            }
            Err(_) => {
                if attempt < config.max_retries {
                    warn!(attempt, "llm request timed out, retrying");
                    attempt += 1;
                    backoff(attempt, config, &cancel).await;
                    continue;
                }
                return error_message(&config.model, "LLM request timed out".into(), StopReason::Error);
            }
        };

        let mut acc = AssistantMessageAccumulator::new(&config.model);
        let mut final_msg: Option<AssistantMessage> = None;
        while let Some(event) = stream.next().await {
            acc.apply(&event);
            let partial = acc.finish();
            match &event {
                AssistantMessageEvent::Start => {
                    emit(AgentEvent::MessageStart { message: Message::Assistant(partial) });
                }
                AssistantMessageEvent::Done | AssistantMessageEvent::MaxTokens | AssistantMessageEvent::Error { .. } => {
                    let resolved = stream.result().await;
                    emit(AgentEvent::MessageEnd { message: Message::Assistant(resolved.clone()) });
                    final_msg = Some(resolved);
                }
                _ => {
                    emit(AgentEvent::MessageUpdate { message: Message::Assistant(partial), assistant_message_event: event });
                }
            }
        }

        let mut resolved = match final_msg {
            Some(m) => m,
            None => stream.result().await,
        };

        // Cancellation is authoritative over whatever the adapter reported:
        // an adapter that observes `cancel` mid-stream has no event variant
        // dedicated to "aborted", so it reports a plain `Error`. Reconcile
        // that here rather than asking every adapter to know about `StopReason`.
        if cancel.is_cancelled() && resolved.stop_reason == StopReason::Error {
            resolved.stop_reason = StopReason::Aborted;
            if resolved.error_message.is_none() {
                resolved.error_message = Some("aborted".into());
            }
            return resolved;
        }

        if resolved.stop_reason == StopReason::Error {
            let text = resolved.error_message.clone().unwrap_or_default();
            if attempt < config.max_retries && config.retry_on_rate_limit && is_retriable_message(&text) {
                warn!(attempt, error = %text, "retriable stream error, backing off");
                attempt += 1;
                backoff(attempt, config, &cancel).await;
                continue;
            }
        }

        return resolved;
    }
}

/// Run one activation of the agent loop: steering → assistant stream →
/// tool exec → repeat, then drain follow-ups before finishing.
///
/// `history` is the canonical session history; messages produced during
/// this activation are appended to it in place. The same messages,
/// isolated from the rest of the session, are also returned (spec §7:
/// "`AgentEnd.messages` contains exactly the messages produced during this
/// activation").
pub async fn run_loop<Emit, Steer, SteerFut, Follow, FollowFut>(
    system_prompt: &str,
    tools: &ToolRegistry,
    history: &mut Vec<Message>,
    seed: LoopSeed,
    config: &LoopConfig,
    cancel: CancellationToken,
    mut emit: Emit,
    mut get_steering: Steer,
    mut get_follow_up: Follow,
) -> Vec<Message>
where
    Emit: FnMut(AgentEvent),
    Steer: FnMut() -> SteerFut,
    SteerFut: Future<Output = Vec<Message>>,
    Follow: FnMut() -> FollowFut,
    FollowFut: Future<Output = Vec<Message>>,
{
    emit(AgentEvent::AgentStart);

    let mut new_messages: Vec<Message> = Vec::new();
    let mut pending: Vec<Message> = match seed {
        LoopSeed::Messages(messages) => messages,
        LoopSeed::DrainSteering => get_steering().await,
    };
    let mut first_turn = true;

    'outer: loop {
        let mut more_tools = true;

        while more_tools || !pending.is_empty() {
            if !first_turn {
                emit(AgentEvent::TurnStart);
            }
            first_turn = false;

            for message in pending.drain(..) {
                emit(AgentEvent::MessageStart { message: message.clone() });
                history.push(message.clone());
                new_messages.push(message.clone());
                emit(AgentEvent::MessageEnd { message });
            }

            let assistant_message =
                stream_assistant(system_prompt, tools, history, config, cancel.clone(), &mut emit).await;
            history.push(Message::Assistant(assistant_message.clone()));
            new_messages.push(Message::Assistant(assistant_message.clone()));

            if matches!(assistant_message.stop_reason, StopReason::Error | StopReason::Aborted) {
                emit(AgentEvent::TurnEnd { message: assistant_message, tool_results: Vec::new() });
                emit(AgentEvent::AgentEnd { messages: new_messages.clone() });
                return new_messages;
            }

            more_tools = assistant_message.has_tool_calls();
            let mut tool_results = Vec::new();
            let mut steering_after_tools: Vec<Message> = Vec::new();

            if more_tools {
                let outcome = execute_tool_calls(
                    tools,
                    &assistant_message,
                    cancel.clone(),
                    config.tool_timeout_ms,
                    |event| emit(AgentEvent::from_tool_event(event)),
                    &mut get_steering,
                )
                .await;
                tool_results = outcome.results;
                steering_after_tools = outcome.steering;

                for result in &tool_results {
                    let message = Message::ToolResult(result.clone());
                    emit(AgentEvent::MessageStart { message: message.clone() });
                    history.push(message.clone());
                    new_messages.push(message.clone());
                    emit(AgentEvent::MessageEnd { message });
                }
            }

            emit(AgentEvent::TurnEnd { message: assistant_message, tool_results });

            pending = if !steering_after_tools.is_empty() {
                steering_after_tools
            } else {
                get_steering().await
            };
        }

        let follow_up = get_follow_up().await;
        if !follow_up.is_empty() {
            pending = follow_up;
            continue 'outer;
        }
        break;
    }

    emit(AgentEvent::AgentEnd { messages: new_messages.clone() });
    new_messages
}
