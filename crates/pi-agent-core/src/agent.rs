// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent facade (spec §4.G). Owns session state, enforces the
//! single-flight invariant, fans events out to listeners, and exposes the
//! prompt/continue/steer/follow-up/abort surface. Grounded on
//! `original_source/pi_agent/agent.py`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

use pi_agent_model::{
    CacheRetention, ContentBlock, Message, Model, ThinkingBudgets, UserMessage,
};
use pi_agent_tools::{Tool, ToolRegistry};

use crate::events::AgentEvent;
use crate::loop_::{run_loop, LoopConfig, LoopSeed};
use crate::state::{AgentState, QueueDrainMode, ThinkingLevel};

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;
type ApiKeyResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// What a caller hands to [`Agent::prompt`].
pub enum PromptInput {
    Text(String),
    Message(Message),
    Messages(Vec<Message>),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        PromptInput::Text(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        PromptInput::Text(text)
    }
}

/// Errors the facade itself raises, distinct from anything a turn's
/// assistant message can carry (spec §7 "configuration" row).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("an activation is already in flight")]
    AlreadyStreaming,
    #[error("no model configured")]
    NoModelConfigured,
    #[error("cannot continue: history is empty")]
    EmptyHistory,
    #[error("cannot continue from message role: assistant")]
    CannotContinueFromAssistant,
}

#[derive(Clone)]
struct Queues {
    steering: Vec<Message>,
    follow_up: Vec<Message>,
    steering_mode: QueueDrainMode,
    follow_up_mode: QueueDrainMode,
}

impl Default for Queues {
    fn default() -> Self {
        Queues {
            steering: Vec::new(),
            follow_up: Vec::new(),
            steering_mode: QueueDrainMode::OneAtATime,
            follow_up_mode: QueueDrainMode::OneAtATime,
        }
    }
}

#[derive(Clone)]
struct Settings {
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    session_id: Option<String>,
    cache_retention: Option<CacheRetention>,
    thinking_budgets: Option<ThinkingBudgets>,
    max_retries: u32,
    retry_delay_ms: u64,
    retry_on_rate_limit: bool,
    max_retry_delay_ms: u64,
    tool_timeout_ms: Option<u64>,
    llm_timeout_ms: Option<u64>,
    api_key_resolver: ApiKeyResolver,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = LoopConfig::default();
        Settings {
            temperature: None,
            max_tokens: None,
            session_id: None,
            cache_retention: None,
            thinking_budgets: None,
            max_retries: defaults.max_retries,
            retry_delay_ms: defaults.retry_delay_ms,
            retry_on_rate_limit: defaults.retry_on_rate_limit,
            max_retry_delay_ms: defaults.max_retry_delay_ms,
            tool_timeout_ms: defaults.tool_timeout_ms,
            llm_timeout_ms: defaults.llm_timeout_ms,
            api_key_resolver: Arc::new(|_: &str| None),
        }
    }
}

/// The agent facade. Cheap to clone — every clone shares the same
/// underlying session; `steer()`/`abort()`/listener registration all work
/// correctly while an activation from another clone is in flight.
#[derive(Clone)]
pub struct Agent {
    state: Arc<Mutex<AgentState>>,
    tools: Arc<Mutex<ToolRegistry>>,
    queues: Arc<Mutex<Queues>>,
    listeners: Arc<Mutex<Vec<(u64, Listener)>>>,
    next_listener_id: Arc<AtomicU64>,
    cancel: Arc<Mutex<CancellationToken>>,
    running: Arc<tokio::sync::Mutex<()>>,
    settings: Arc<Mutex<Settings>>,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        Agent {
            state: Arc::new(Mutex::new(AgentState::new())),
            tools: Arc::new(Mutex::new(ToolRegistry::new())),
            queues: Arc::new(Mutex::new(Queues::default())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: Arc::new(AtomicU64::new(0)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            running: Arc::new(tokio::sync::Mutex::new(())),
            settings: Arc::new(Mutex::new(Settings::default())),
        }
    }

    // ---- configuration --------------------------------------------------

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.state.lock().unwrap().system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: Model) {
        self.state.lock().unwrap().model = Some(model);
    }

    pub fn model(&self) -> Option<Model> {
        self.state.lock().unwrap().model.clone()
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.state.lock().unwrap().thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register_arc(tool);
        }
        *self.tools.lock().unwrap() = registry;
    }

    pub fn replace_messages(&self, messages: Vec<Message>) {
        self.state.lock().unwrap().messages = messages;
    }

    pub fn append_message(&self, message: Message) {
        self.state.lock().unwrap().messages.push(message);
    }

    pub fn clear_messages(&self) {
        self.state.lock().unwrap().messages.clear();
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.settings.lock().unwrap().session_id = session_id;
    }

    pub fn session_id(&self) -> Option<String> {
        self.settings.lock().unwrap().session_id.clone()
    }

    pub fn set_thinking_budgets(&self, budgets: Option<ThinkingBudgets>) {
        self.settings.lock().unwrap().thinking_budgets = budgets;
    }

    pub fn thinking_budgets(&self) -> Option<ThinkingBudgets> {
        self.settings.lock().unwrap().thinking_budgets
    }

    pub fn set_max_retry_delay_ms(&self, ms: u64) {
        self.settings.lock().unwrap().max_retry_delay_ms = ms;
    }

    pub fn max_retry_delay_ms(&self) -> u64 {
        self.settings.lock().unwrap().max_retry_delay_ms
    }

    pub fn set_temperature(&self, temperature: Option<f32>) {
        self.settings.lock().unwrap().temperature = temperature;
    }

    pub fn set_max_tokens(&self, max_tokens: Option<u32>) {
        self.settings.lock().unwrap().max_tokens = max_tokens;
    }

    pub fn set_cache_retention(&self, retention: Option<CacheRetention>) {
        self.settings.lock().unwrap().cache_retention = retention;
    }

    pub fn set_max_retries(&self, max_retries: u32) {
        self.settings.lock().unwrap().max_retries = max_retries;
    }

    pub fn set_retry_delay_ms(&self, ms: u64) {
        self.settings.lock().unwrap().retry_delay_ms = ms;
    }

    pub fn set_retry_on_rate_limit(&self, retry: bool) {
        self.settings.lock().unwrap().retry_on_rate_limit = retry;
    }

    pub fn set_tool_timeout_ms(&self, ms: Option<u64>) {
        self.settings.lock().unwrap().tool_timeout_ms = ms;
    }

    pub fn set_llm_timeout_ms(&self, ms: Option<u64>) {
        self.settings.lock().unwrap().llm_timeout_ms = ms;
    }

    pub fn set_api_key_resolver(&self, resolver: impl Fn(&str) -> Option<String> + Send + Sync + 'static) {
        self.settings.lock().unwrap().api_key_resolver = Arc::new(resolver);
    }

    /// A read-only snapshot of the session state, for inspection by a
    /// caller (e.g. a TUI rendering the current partial message).
    pub fn state(&self) -> AgentState {
        self.state.lock().unwrap().clone()
    }

    // ---- listeners --------------------------------------------------------

    pub fn subscribe(&self, listener: impl Fn(&AgentEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.listeners.lock().unwrap().retain(|(existing, _)| *existing != id);
    }

    // ---- queues -----------------------------------------------------------

    pub fn steer(&self, message: Message) {
        self.queues.lock().unwrap().steering.push(message);
    }

    pub fn follow_up(&self, message: Message) {
        self.queues.lock().unwrap().follow_up.push(message);
    }

    pub fn set_steering_mode(&self, mode: QueueDrainMode) {
        self.queues.lock().unwrap().steering_mode = mode;
    }

    pub fn get_steering_mode(&self) -> QueueDrainMode {
        self.queues.lock().unwrap().steering_mode
    }

    pub fn set_follow_up_mode(&self, mode: QueueDrainMode) {
        self.queues.lock().unwrap().follow_up_mode = mode;
    }

    pub fn get_follow_up_mode(&self) -> QueueDrainMode {
        self.queues.lock().unwrap().follow_up_mode
    }

    pub fn clear_steering_queue(&self) {
        self.queues.lock().unwrap().steering.clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.queues.lock().unwrap().follow_up.clear();
    }

    pub fn clear_all_queues(&self) {
        let mut queues = self.queues.lock().unwrap();
        queues.steering.clear();
        queues.follow_up.clear();
    }

    pub fn has_queued_messages(&self) -> bool {
        let queues = self.queues.lock().unwrap();
        !queues.steering.is_empty() || !queues.follow_up.is_empty()
    }

    async fn drain_steering(&self) -> Vec<Message> {
        let mut queues = self.queues.lock().unwrap();
        let mode = queues.steering_mode;
        mode.drain(&mut queues.steering)
    }

    async fn drain_follow_up(&self) -> Vec<Message> {
        let mut queues = self.queues.lock().unwrap();
        let mode = queues.follow_up_mode;
        mode.drain(&mut queues.follow_up)
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Resolves once no activation is in flight.
    pub async fn wait_for_idle(&self) {
        let _ = self.running.lock().await;
    }

    /// Clear all state except configuration (system prompt, model, tools,
    /// settings survive; history/queues/streaming flags do not).
    pub fn reset(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.messages.clear();
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls = HashSet::new();
            state.error = None;
        }
        self.clear_all_queues();
    }

    // ---- driving an activation -----------------------------------------

    pub async fn prompt(
        &self,
        input: impl Into<PromptInput>,
        images: Option<Vec<ContentBlock>>,
    ) -> Result<Vec<Message>, AgentError> {
        let guard = self.running.try_lock().map_err(|_| AgentError::AlreadyStreaming)?;

        let seed = match input.into() {
            PromptInput::Text(text) => {
                let mut content = vec![ContentBlock::text(text)];
                if let Some(images) = images {
                    content.extend(images);
                }
                vec![Message::User(UserMessage { content, timestamp: pi_agent_model::now_millis() })]
            }
            PromptInput::Message(message) => vec![message],
            PromptInput::Messages(messages) => messages,
        };

        self.run_activation_locked(guard, LoopSeed::Messages(seed), false).await
    }

    /// Resume a stalled conversation (spec §4.F "Continue"). Valid iff
    /// history is non-empty and the last message is not an assistant
    /// message; if the last message *is* assistant, resumes from whatever
    /// is queued (steering takes priority over follow-up).
    pub async fn continue_(&self) -> Result<Vec<Message>, AgentError> {
        let guard = self.running.try_lock().map_err(|_| AgentError::AlreadyStreaming)?;

        let last_is_assistant = {
            let state = self.state.lock().unwrap();
            if state.messages.is_empty() {
                return Err(AgentError::EmptyHistory);
            }
            state.messages.last().map(Message::is_assistant).unwrap_or(false)
        };

        if last_is_assistant {
            let queued_steering = self.drain_steering().await;
            if !queued_steering.is_empty() {
                return self.run_activation_locked(guard, LoopSeed::Messages(queued_steering), true).await;
            }
            let queued_follow_up = self.drain_follow_up().await;
            if !queued_follow_up.is_empty() {
                return self.run_activation_locked(guard, LoopSeed::Messages(queued_follow_up), false).await;
            }
            return Err(AgentError::CannotContinueFromAssistant);
        }

        self.run_activation_locked(guard, LoopSeed::DrainSteering, false).await
    }

    async fn run_activation_locked(
        &self,
        _guard: tokio::sync::MutexGuard<'_, ()>,
        seed: LoopSeed,
        skip_initial_steering: bool,
    ) -> Result<Vec<Message>, AgentError> {
        let model = self.state.lock().unwrap().model.clone().ok_or(AgentError::NoModelConfigured)?;

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let (system_prompt, thinking_level, mut history) = {
            let mut state = self.state.lock().unwrap();
            state.is_streaming = true;
            state.error = None;
            (state.system_prompt.clone(), state.thinking_level, state.messages.clone())
        };

        let config = {
            let settings = self.settings.lock().unwrap();
            let api_key = (settings.api_key_resolver)(&model.provider);
            LoopConfig {
                model,
                thinking_level,
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
                api_key,
                session_id: settings.session_id.clone(),
                cache_retention: settings.cache_retention,
                thinking_budgets: settings.thinking_budgets,
                max_retries: settings.max_retries,
                retry_delay_ms: settings.retry_delay_ms,
                retry_on_rate_limit: settings.retry_on_rate_limit,
                max_retry_delay_ms: settings.max_retry_delay_ms,
                tool_timeout_ms: settings.tool_timeout_ms,
                llm_timeout_ms: settings.llm_timeout_ms,
            }
        };

        let tools = self.tools.lock().unwrap().clone();

        let skip_first = std::sync::atomic::AtomicBool::new(skip_initial_steering);
        let steer_self = self.clone();
        let get_steering = move || {
            let skip_now = skip_first.swap(false, Ordering::Relaxed);
            let steer_self = steer_self.clone();
            async move {
                if skip_now {
                    Vec::new()
                } else {
                    steer_self.drain_steering().await
                }
            }
        };

        let follow_up_self = self.clone();
        let get_follow_up = move || {
            let follow_up_self = follow_up_self.clone();
            async move { follow_up_self.drain_follow_up().await }
        };

        let new_messages = run_loop(
            &system_prompt,
            &tools,
            &mut history,
            seed,
            &config,
            cancel,
            |event| self.emit(event),
            get_steering,
            get_follow_up,
        )
        .await;

        {
            let mut state = self.state.lock().unwrap();
            state.messages = history;
            state.is_streaming = false;
            state.stream_message = None;
            state.pending_tool_calls.clear();
        }

        Ok(new_messages)
    }

    fn emit(&self, event: AgentEvent) {
        self.apply_state_mutation(&event);
        let listeners = self.listeners.lock().unwrap().clone();
        for (_, listener) in listeners {
            let event_ref = &event;
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event_ref))).is_err() {
                error!("agent event listener panicked; continuing dispatch");
            }
        }
    }

    fn apply_state_mutation(&self, event: &AgentEvent) {
        let mut state = self.state.lock().unwrap();
        match event {
            AgentEvent::MessageStart { message } | AgentEvent::MessageUpdate { message, .. } => {
                if message.is_assistant() {
                    state.stream_message = Some(message.clone());
                }
            }
            AgentEvent::MessageEnd { message } => {
                if message.is_assistant() {
                    state.stream_message = None;
                }
            }
            AgentEvent::ToolExecutionStart { tool_call_id, .. } => {
                state.pending_tool_calls.insert(tool_call_id.clone());
            }
            AgentEvent::ToolExecutionEnd { tool_call_id, .. } => {
                state.pending_tool_calls.remove(tool_call_id);
            }
            AgentEvent::TurnEnd { message, .. } => {
                if message.stop_reason == pi_agent_model::StopReason::Error {
                    state.error = message.error_message.clone();
                }
            }
            AgentEvent::AgentEnd { .. } => {
                state.is_streaming = false;
                state.stream_message = None;
            }
            _ => {}
        }
    }
}
