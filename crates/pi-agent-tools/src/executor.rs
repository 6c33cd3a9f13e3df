// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool executor (spec §4.E): runs every tool call in an assistant
//! message sequentially, in order, so steering interruption and event
//! ordering stay well-defined. Grounded on
//! `original_source/pi_agent/loop.py::_execute_tool_calls`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pi_agent_model::{now_millis, AssistantMessage, Message, ToolResultMessage};

use crate::events::ToolExecutionEvent;
use crate::registry::ToolRegistry;
use crate::tool::ToolResult;
use crate::validate::validate_tool_call;

/// The fully-assembled outcome of a tool-call batch: the
/// [`ToolResultMessage`]s to append to history, and any steering messages
/// that interrupted the batch (spec §4.E "Steering interruption").
#[derive(Debug, Default)]
pub struct ToolExecutionOutcome {
    pub results: Vec<ToolResultMessage>,
    pub steering: Vec<Message>,
}

/// Run every `ToolCall` block in `message` in order.
///
/// `emit` receives each [`ToolExecutionEvent`] as it happens. `poll_steering`
/// is invoked after every completed call; a non-empty return interrupts the
/// remaining calls in the batch (they are synthesized as skipped errors)
/// and is returned as [`ToolExecutionOutcome::steering`].
pub async fn execute_tool_calls<Emit, Poll, PollFut>(
    registry: &ToolRegistry,
    message: &AssistantMessage,
    cancel: CancellationToken,
    tool_timeout_ms: Option<u64>,
    mut emit: Emit,
    mut poll_steering: Poll,
) -> ToolExecutionOutcome
where
    Emit: FnMut(ToolExecutionEvent),
    Poll: FnMut() -> PollFut,
    PollFut: Future<Output = Vec<Message>>,
{
    let tool_calls: Vec<(&str, &str, &serde_json::Value)> = message.tool_calls().collect();
    let mut results = Vec::with_capacity(tool_calls.len());
    let mut steering = Vec::new();

    for (index, (call_id, name, args)) in tool_calls.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        emit(ToolExecutionEvent::Start {
            tool_call_id: call_id.to_string(),
            tool_name: name.to_string(),
            args: (*args).clone(),
        });

        let (result, is_error) = run_one(registry, call_id, name, args, cancel.clone(), tool_timeout_ms, &mut emit).await;

        emit(ToolExecutionEvent::End {
            tool_call_id: call_id.to_string(),
            tool_name: name.to_string(),
            result: result.clone(),
            is_error,
        });

        results.push(to_message(call_id, name, result, is_error));

        let drained = poll_steering().await;
        if !drained.is_empty() {
            steering = drained;
            for (skip_id, skip_name, skip_args) in &tool_calls[index + 1..] {
                results.push(skip_tool_call(&mut emit, skip_id, skip_name, skip_args));
            }
            break;
        }
    }

    ToolExecutionOutcome { results, steering }
}

async fn run_one<Emit>(
    registry: &ToolRegistry,
    call_id: &str,
    name: &str,
    args: &serde_json::Value,
    cancel: CancellationToken,
    tool_timeout_ms: Option<u64>,
    emit: &mut Emit,
) -> (ToolResult, bool)
where
    Emit: FnMut(ToolExecutionEvent),
{
    let Some(tool) = registry.get(name) else {
        warn!(tool = name, "tool not found");
        return (ToolResult::text(format!("Tool '{name}' not found")), true);
    };

    if let Err(e) = validate_tool_call(tool.as_ref(), args) {
        debug!(tool = name, error = %e, "tool argument validation failed");
        return (
            ToolResult::text_with_details(
                e.to_string(),
                serde_json::json!({ "validation_errors": e.errors }),
            ),
            true,
        );
    }

    let (update_tx, mut update_rx) = tokio::sync::mpsc::unbounded_channel::<ToolResult>();
    let on_update: crate::tool::OnUpdate = Arc::new(move |partial: ToolResult| {
        let _ = update_tx.send(partial);
    });

    let fut = tool.execute(call_id, args, cancel, on_update);
    tokio::pin!(fut);

    // Polls the execute future and the update channel side by side so each
    // `on_update` partial is emitted as it arrives rather than buffered
    // until the tool finishes.
    let run = async {
        loop {
            tokio::select! {
                biased;
                Some(partial) = update_rx.recv() => {
                    emit(ToolExecutionEvent::Update {
                        tool_call_id: call_id.to_string(),
                        tool_name: name.to_string(),
                        args: args.clone(),
                        partial_result: partial,
                    });
                }
                result = &mut fut => break result,
            }
        }
    };

    let outcome = match tool_timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
            Ok(inner) => inner,
            Err(_) => {
                warn!(tool = name, timeout_ms = ms, "tool execution timed out");
                while let Ok(partial) = update_rx.try_recv() {
                    emit(ToolExecutionEvent::Update {
                        tool_call_id: call_id.to_string(),
                        tool_name: name.to_string(),
                        args: args.clone(),
                        partial_result: partial,
                    });
                }
                return (
                    ToolResult::text_with_details(
                        format!("Tool '{name}' timed out after {ms}ms"),
                        serde_json::json!({ "timeout_ms": ms }),
                    ),
                    true,
                );
            }
        },
        None => run.await,
    };

    match outcome {
        Ok(result) => (result, false),
        Err(e) => {
            warn!(tool = name, error = %e, "tool execution failed");
            (ToolResult::text(e.to_string()), true)
        }
    }
}

fn skip_tool_call<Emit>(
    emit: &mut Emit,
    call_id: &str,
    name: &str,
    args: &serde_json::Value,
) -> ToolResultMessage
where
    Emit: FnMut(ToolExecutionEvent),
{
    emit(ToolExecutionEvent::Start {
        tool_call_id: call_id.to_string(),
        tool_name: name.to_string(),
        args: args.clone(),
    });
    let result = ToolResult::text("Skipped due to queued user message.");
    emit(ToolExecutionEvent::End {
        tool_call_id: call_id.to_string(),
        tool_name: name.to_string(),
        result: result.clone(),
        is_error: true,
    });
    to_message(call_id, name, result, true)
}

fn to_message(call_id: &str, name: &str, result: ToolResult, is_error: bool) -> ToolResultMessage {
    ToolResultMessage {
        tool_call_id: call_id.to_string(),
        tool_name: name.to_string(),
        content: result.content,
        details: result.details,
        is_error,
        timestamp: now_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{OnUpdate, Tool};
    use async_trait::async_trait;
    use pi_agent_model::{ContentBlock, StopReason, Usage};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes"
        }
        fn parameters_schema(&self) -> Value {
            json!({})
        }
        async fn execute(
            &self,
            _call_id: &str,
            _args: &Value,
            _cancel: CancellationToken,
            _on_update: OnUpdate,
        ) -> anyhow::Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolResult::text("unreachable"))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes args.x"
        }
        fn parameters_schema(&self) -> Value {
            json!({})
        }
        async fn execute(
            &self,
            _call_id: &str,
            args: &Value,
            _cancel: CancellationToken,
            on_update: OnUpdate,
        ) -> anyhow::Result<ToolResult> {
            on_update(ToolResult::text("working"));
            Ok(ToolResult::text(format!("x={}", args["x"])))
        }
    }

    fn assistant_with_calls(calls: &[(&str, &str, Value)]) -> AssistantMessage {
        AssistantMessage {
            content: calls
                .iter()
                .map(|(id, name, args)| ContentBlock::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args.clone(),
                    thought_signature: None,
                })
                .collect(),
            api: "mock".into(),
            provider: "mock".into(),
            model: "mock".into(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn one_tool_round_trip_produces_one_result() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let msg = assistant_with_calls(&[("t1", "echo", json!({"x": 1}))]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();

        let outcome = execute_tool_calls(
            &reg,
            &msg,
            CancellationToken::new(),
            None,
            move |e| events_clone.lock().unwrap().push(e),
            || async { Vec::new() },
        )
        .await;

        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.results[0].is_error);
        assert_eq!(outcome.results[0].content[0].as_text(), Some("x=1"));
        assert!(outcome.steering.is_empty());
        let evs = events.lock().unwrap();
        assert!(matches!(evs[0], ToolExecutionEvent::Start { .. }));
        assert!(matches!(evs.last().unwrap(), ToolExecutionEvent::End { .. }));
    }

    #[tokio::test]
    async fn missing_tool_produces_error_result() {
        let reg = ToolRegistry::new();
        let msg = assistant_with_calls(&[("t1", "nope", json!({}))]);
        let outcome = execute_tool_calls(&reg, &msg, CancellationToken::new(), None, |_| {}, || async { Vec::new() }).await;
        assert!(outcome.results[0].is_error);
        assert!(outcome.results[0].content[0].as_text().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn timeout_produces_error_with_details() {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool);
        let msg = assistant_with_calls(&[("t1", "slow", json!({}))]);
        let outcome = execute_tool_calls(&reg, &msg, CancellationToken::new(), Some(10), |_| {}, || async { Vec::new() }).await;
        assert!(outcome.results[0].is_error);
        assert!(outcome.results[0].content[0].as_text().unwrap().contains("timed out"));
        assert_eq!(outcome.results[0].details.as_ref().unwrap()["timeout_ms"], 10);
    }

    #[tokio::test]
    async fn steering_mid_batch_skips_remaining_calls() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let msg = assistant_with_calls(&[
            ("t1", "echo", json!({"x": 1})),
            ("t2", "echo", json!({"x": 2})),
            ("t3", "echo", json!({"x": 3})),
        ]);
        let call_n = Arc::new(Mutex::new(0));
        let call_n2 = call_n.clone();
        let outcome = execute_tool_calls(
            &reg,
            &msg,
            CancellationToken::new(),
            None,
            |_| {},
            move || {
                let call_n2 = call_n2.clone();
                async move {
                    let mut n = call_n2.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        vec![Message::user("stop", 0)]
                    } else {
                        Vec::new()
                    }
                }
            },
        )
        .await;

        assert_eq!(outcome.results.len(), 3);
        assert!(!outcome.results[0].is_error);
        assert!(outcome.results[1].is_error);
        assert!(outcome.results[1].content[0].as_text().unwrap().contains("Skipped"));
        assert!(outcome.results[2].is_error);
        assert_eq!(outcome.steering.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_before_a_call_stops_the_batch() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let msg = assistant_with_calls(&[("t1", "echo", json!({"x": 1})), ("t2", "echo", json!({"x": 2}))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = execute_tool_calls(&reg, &msg, cancel, None, |_| {}, || async { Vec::new() }).await;
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn on_update_emits_update_event() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let msg = assistant_with_calls(&[("t1", "echo", json!({"x": 1}))]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        execute_tool_calls(&reg, &msg, CancellationToken::new(), None, move |e| events_clone.lock().unwrap().push(e), || async { Vec::new() }).await;
        let evs = events.lock().unwrap();
        assert!(evs.iter().any(|e| matches!(e, ToolExecutionEvent::Update { .. })));
    }
}
