// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic event stream with a lazily-resolved, multi-await-safe result.
//!
//! A producer pushes events with [`EventStream::push`]; once a pushed event
//! satisfies the `is_complete` predicate supplied at construction, the
//! stream is fused shut (further pushes are silently dropped) and the
//! result extracted by `extract_result` is published. A consumer drains
//! the same handle as an ordinary [`futures::Stream`] and may
//! `.result().await` any number of times, before or after the stream
//! itself has been fully drained.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};

type IsCompleteFn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type ExtractFn<E, R> = Arc<dyn Fn(&E) -> Option<R> + Send + Sync>;

struct ResultCell<R> {
    tx: watch::Sender<Option<R>>,
}

impl<R: Clone> ResultCell<R> {
    fn new() -> (Self, watch::Receiver<Option<R>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    fn resolve(&self, value: R) {
        let _ = self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }
}

/// A push/pull event channel paired with a one-shot, many-reader result.
///
/// Clone freely: the producer side (`push`/`end`) and the result cell are
/// shared across clones. The consumer (`Stream`) side holds the single
/// underlying receiver, so only one clone should be polled as a stream at
/// a time — the same restriction an `mpsc::UnboundedReceiver` has.
pub struct EventStream<E, R> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<E>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<E>>>,
    result: Arc<ResultCell<R>>,
    result_rx: watch::Receiver<Option<R>>,
    is_complete: IsCompleteFn<E>,
    extract_result: ExtractFn<E, R>,
}

impl<E, R> Clone for EventStream<E, R> {
    fn clone(&self) -> Self {
        EventStream {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            result: self.result.clone(),
            result_rx: self.result_rx.clone(),
            is_complete: self.is_complete.clone(),
            extract_result: self.extract_result.clone(),
        }
    }
}

impl<E: Send + 'static, R: Clone + Send + 'static> EventStream<E, R> {
    /// Build a new stream. `is_complete` is evaluated against every pushed
    /// event; the first event for which it returns `true` both closes the
    /// stream and (via `extract_result`) may resolve the result.
    pub fn new(
        is_complete: impl Fn(&E) -> bool + Send + Sync + 'static,
        extract_result: impl Fn(&E) -> Option<R> + Send + Sync + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (result, result_rx) = ResultCell::new();
        EventStream {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx: Arc::new(Mutex::new(rx)),
            result: Arc::new(result),
            result_rx,
            is_complete: Arc::new(is_complete),
            extract_result: Arc::new(extract_result),
        }
    }

    /// Push an event. No-op if the stream has already been completed or
    /// explicitly ended.
    pub fn push(&self, event: E) {
        let mut guard = self.tx.lock().expect("EventStream mutex poisoned");
        let Some(sender) = guard.as_ref() else {
            return;
        };
        let completing = (self.is_complete)(&event);
        if completing {
            if let Some(result) = (self.extract_result)(&event) {
                self.result.resolve(result);
            }
        }
        let _ = sender.send(event);
        if completing {
            *guard = None;
        }
    }

    /// Close the stream without pushing a final event. If `result` is
    /// `Some`, it resolves the result cell; otherwise `.result()` will
    /// never return for any waiter (mirrors an unresolved future).
    pub fn end(&self, result: Option<R>) {
        if let Some(result) = result {
            self.result.resolve(result);
        }
        *self.tx.lock().expect("EventStream mutex poisoned") = None;
    }

    /// Await the resolved result. Safe to call concurrently from multiple
    /// holders and safe to call again after it has already resolved.
    pub async fn result(&self) -> R {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                if let Some(value) = rx.borrow().clone() {
                    return value;
                }
                std::future::pending::<()>().await;
                unreachable!();
            }
        }
    }
}

impl<E: Unpin, R> Stream for EventStream<E, R> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<E>> {
        let mut rx = self.rx.lock().expect("EventStream mutex poisoned");
        Pin::new(&mut *rx).poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn result_resolves_on_completing_event() {
        let mut stream = EventStream::<i32, String>::new(
            |e| *e == -1,
            |e| (*e == -1).then(|| "done".to_string()),
        );
        stream.push(1);
        stream.push(2);
        stream.push(-1);
        let events: Vec<i32> = (&mut stream).collect().await;
        assert_eq!(events, vec![1, 2, -1]);
        assert_eq!(stream.result().await, "done");
    }

    #[tokio::test]
    async fn pushes_after_completion_are_dropped() {
        let mut stream = EventStream::<i32, i32>::new(|e| *e == 0, |_| Some(42));
        stream.push(0);
        stream.push(99);
        let events: Vec<i32> = (&mut stream).collect().await;
        assert_eq!(events, vec![0]);
        assert_eq!(stream.result().await, 42);
    }

    #[tokio::test]
    async fn result_is_multi_await_safe() {
        let stream = EventStream::<i32, i32>::new(|e| *e == 0, |_| Some(7));
        stream.push(0);
        assert_eq!(stream.result().await, 7);
        assert_eq!(stream.result().await, 7);
    }

    #[tokio::test]
    async fn end_without_result_leaves_result_unresolved_but_stream_closed() {
        let mut stream = EventStream::<i32, i32>::new(|_| false, |_| None);
        stream.push(1);
        stream.end(None);
        let events: Vec<i32> = (&mut stream).collect().await;
        assert_eq!(events, vec![1]);
    }

    #[tokio::test]
    async fn clone_shares_producer_and_result() {
        let stream = EventStream::<i32, i32>::new(|e| *e == 0, |_| Some(3));
        let producer = stream.clone();
        producer.push(0);
        assert_eq!(stream.result().await, 3);
    }
}
