//! Uniform send/receive/reconnect abstraction over concrete wire substrates
//! (Module D). [`Transport`] is the seam the Queue and a driver's general
//! inbound handler sit behind; concrete substrates live in sibling modules.

mod stream_socket;
mod websocket;

pub use stream_socket::{StreamSocketConfig, StreamSocketTransport};
pub use websocket::{WebSocketConfig, WebSocketTransport};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

use crate::error::TransportError;
use crate::queue::{Queue, TaskEvent};
use crate::task::{ParserOutcome, ResponseParser, TaskInfo};
use crate::tokenizer::Tokenizer;

/// Observable connection state of a Transport, mirrored from the
/// substrate's reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Terminated,
}

/// Certificate verification posture for [`Transport::start_tls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerifyMode {
    /// Validate the peer certificate against the platform trust store.
    Peer,
    /// Accept any certificate. Only ever appropriate against a trusted
    /// private network; never the default.
    None,
}

/// Parameters for a TLS upgrade: the SNI/hostname to present and verify
/// against, if any.
#[derive(Debug, Clone, Default)]
pub struct TlsContext {
    pub domain: Option<String>,
}

/// The driver's general inbound handler: invoked with a complete framed
/// message and the identity of the task it arrived under, or `None` when
/// the bytes are unsolicited (no task currently in-flight, or the
/// in-flight task registered no response parser).
pub type ReceivedFn = Arc<dyn Fn(Bytes, Option<TaskInfo>) + Send + Sync>;

/// Uniform send/receive/reconnect abstraction over TCP (optionally TLS)
/// and WebSocket substrates.
///
/// A Transport never inspects the driver beyond the narrow surface this
/// trait exposes: it reports outcomes and disconnects through the Queue's
/// event channel and otherwise treats messages as opaque bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection (or confirm one already exists), waiting up
    /// to `connect_timeout` for the first attempt. On return `Ok(())`, the
    /// background reconnect loop keeps the connection alive until
    /// [`Transport::terminate`] is called, regardless of how long this
    /// call waited.
    async fn connect(&self, connect_timeout: Duration) -> Result<(), TransportError>;

    /// Permanently stop: close the socket, stop reconnecting, and abort
    /// the in-flight task (if any) via `TaskEvent::Disconnected`. Sticky.
    async fn terminate(&self);

    /// Close the current connection without giving up; the reconnect
    /// loop resumes per its backoff schedule. The in-flight task (if any)
    /// is left alone — reconnection is expected to recover it.
    async fn disconnect(&self);

    /// Write `bytes` as-is with no task registration. Returns the number
    /// of bytes written, or `0` if currently disconnected (the write is
    /// silently dropped; a caller relying on a reply should use
    /// [`Transport::send_with_task`] and let the Queue's timeout notice).
    async fn send(&self, bytes: Bytes) -> usize;

    /// Write `bytes`, first registering `parser` (if any) as the current
    /// response parser for `task` so an inbound reply is routed to it
    /// rather than to the general `received` callback.
    async fn send_with_task(&self, bytes: Bytes, task: TaskInfo, parser: Option<ResponseParser>) -> usize;

    /// Upgrade (or re-establish) the connection under TLS with the given
    /// posture. Idempotent: a second call with TLS already active is a
    /// no-op. Substrates that cannot support TLS return
    /// `TransportError::Unsupported`.
    async fn start_tls(&self, verify_mode: TlsVerifyMode, context: TlsContext) -> Result<(), TransportError>;

    /// One-shot request/response over substrates that support it (e.g. an
    /// SSH command execution channel). Unsupported by default.
    async fn exec(&self, _bytes: Bytes) -> Result<Bytes, TransportError> {
        Err(TransportError::Unsupported)
    }

    fn state(&self) -> TransportState;
}

/// Non-owning handles a Transport needs to reach back into the driver
/// that owns it, without holding a strong reference to the Queue (the
/// core specification's cycle-breaking design note: Transport and Queue
/// must not own each other).
#[derive(Clone)]
pub struct QueueHandles {
    pub queue: Weak<Queue>,
    pub received: ReceivedFn,
}

/// Shared bookkeeping common to every substrate: the current-task/parser
/// registration, an optional framing Tokenizer, and connection-state
/// flags. Concrete substrates embed a `TransportCore` and drive it from
/// their own read loop.
#[derive(Clone)]
pub(crate) struct TransportCore {
    pub handles: QueueHandles,
    tokenizer: Option<Arc<Mutex<Tokenizer>>>,
    current: Arc<Mutex<Option<(Option<ResponseParser>, TaskInfo)>>>,
    terminated: Arc<AtomicBool>,
    online_notify: Arc<Notify>,
    state: Arc<std::sync::Mutex<TransportState>>,
}

impl TransportCore {
    pub fn new(handles: QueueHandles, tokenizer: Option<Tokenizer>) -> Self {
        Self {
            handles,
            tokenizer: tokenizer.map(|t| Arc::new(Mutex::new(t))),
            current: Arc::new(Mutex::new(None)),
            terminated: Arc::new(AtomicBool::new(false)),
            online_notify: Arc::new(Notify::new()),
            state: Arc::new(std::sync::Mutex::new(TransportState::Disconnected)),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().expect("transport state mutex poisoned")
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.lock().expect("transport state mutex poisoned") = state;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.set_state(TransportState::Terminated);
        self.online_notify.notify_waiters();
    }

    /// Raise or lower the owning Queue's online gate (best-effort: if the
    /// Queue has already been dropped there is nothing left to notify).
    pub async fn set_online(&self, online: bool) {
        self.set_state(if online {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        });
        if let Some(queue) = self.handles.queue.upgrade() {
            queue.set_online(online).await;
        }
        if online {
            self.online_notify.notify_waiters();
        }
    }

    /// Block until the connection is online or this Transport has been
    /// terminated.
    pub async fn wait_online(&self) -> Result<(), TransportError> {
        loop {
            if self.is_terminated() {
                return Err(TransportError::Terminated);
            }
            if self.state() == TransportState::Connected {
                return Ok(());
            }
            let notified = self.online_notify.notified();
            if self.is_terminated() {
                return Err(TransportError::Terminated);
            }
            if self.state() == TransportState::Connected {
                return Ok(());
            }
            notified.await;
        }
    }

    pub async fn register_current(&self, task: TaskInfo, parser: Option<ResponseParser>) {
        *self.current.lock().await = Some((parser, task));
    }

    pub async fn clear_current(&self) {
        *self.current.lock().await = None;
    }

    async fn take_current_snapshot(&self) -> Option<(Option<ResponseParser>, TaskInfo)> {
        self.current.lock().await.clone()
    }

    /// Feed newly-arrived bytes through the framing Tokenizer (if
    /// configured) and dispatch each complete message; with no Tokenizer
    /// configured, `data` is treated as exactly one message.
    pub async fn process(&self, data: Bytes) {
        let Some(tokenizer) = &self.tokenizer else {
            self.process_message(data).await;
            return;
        };

        let messages = {
            let mut tok = tokenizer.lock().await;
            match tok.extract(&data) {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(error = %err, "tokenizer overflow, buffer discarded");
                    return;
                }
            }
        };

        match messages.len() {
            0 => {}
            1 => {
                let message = messages.into_iter().next().expect("len checked above");
                self.process_message(message).await;
            }
            _ => {
                // Spec's framing model treats each fully-framed message as
                // independent; dispatch them concurrently rather than
                // serializing on this reader task.
                for message in messages {
                    let core = self.clone();
                    tokio::spawn(async move { core.process_message(message).await });
                }
            }
        }
    }

    async fn process_message(&self, data: Bytes) {
        match self.take_current_snapshot().await {
            Some((Some(parser), info)) => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| parser(&data, &info)));
                let outcome = outcome.unwrap_or_else(|_| {
                    tracing::warn!(task = %info.name, "response parser panicked");
                    ParserOutcome::Abort("parser panicked".to_string())
                });
                if let Some(queue) = self.handles.queue.upgrade() {
                    queue.report(TaskEvent::Outcome(outcome));
                }
            }
            Some((None, info)) => (self.handles.received)(data, Some(info)),
            None => (self.handles.received)(data, None),
        }
    }

    pub async fn report_disconnected(&self) {
        if let Some(queue) = self.handles.queue.upgrade() {
            queue.report(TaskEvent::Disconnected);
        }
    }

    /// A cheap clone of the framing Tokenizer handle, for substrates that
    /// need to reset its buffer across a reconnect.
    pub fn tokenizer_handle(&self) -> Option<Arc<Mutex<Tokenizer>>> {
        self.tokenizer.clone()
    }
}

/// Exponential backoff with jitter for reconnect attempts: base 1s,
/// capped at 10s, ±500ms jitter, per the core specification's Transport
/// reconnect behavior.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base_ms: u64 = 1_000;
    let cap_ms: u64 = 10_000;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(6));
    let capped = exp.min(cap_ms);
    let jitter: i64 = rand::thread_rng().gen_range(-500..=500);
    let millis = (capped as i64 + jitter).max(0) as u64;
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_bounded_and_grows() {
        let first = backoff_delay(0);
        assert!(first.as_millis() >= 500 && first.as_millis() <= 1_500);

        let late = backoff_delay(10);
        assert!(late.as_millis() <= 10_500);
    }
}
