//! One outstanding command against a Transport: payload, deadline, optional
//! response parser, completion promise (Module B).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::TaskError;

/// Dispatch priority. Ordered so that `High > Normal > Low`, matching the
/// Queue's three FIFO lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// What a response parser decided after seeing one framed message.
#[derive(Debug, Clone)]
pub enum ParserOutcome {
    /// Task is done; resolve its completion with `value`.
    Success(Bytes),
    /// Re-enqueue per retry rules (decrement `retries_remaining`, or abort
    /// if exhausted).
    Retry(String),
    /// Terminal failure, regardless of retries remaining.
    Abort(String),
    /// More bytes are expected; keep the task in-flight. The Queue re-arms
    /// the deadline from the moment this is returned.
    Continue,
}

/// Terminal value observed by a Task's completion slot. Exactly one of
/// these is observed, at most once, per Task (spec invariant).
#[derive(Clone)]
pub enum TaskOutcome {
    Success(Bytes),
    Abort(String),
    /// Reserved for callers that want to distinguish "timed out" from a
    /// generic abort; the Queue's own timeout handling always resolves
    /// through `Abort("timeout")` once retries are exhausted (see the
    /// error table in the core specification), so this variant is not
    /// produced by the Queue itself.
    Timeout,
    Error(TaskError),
}

/// A read-only snapshot of a Task's identity, handed to its response
/// parser so the parser can see retry state without borrowing the Task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub priority: Priority,
    pub retries_remaining: u32,
}

/// A response parser: given one complete framed message and the current
/// task's info, decides what happens next. An exception raised inside the
/// closure should be caught by the caller and treated as `Abort`; this
/// core treats a parser as infallible by type (callers that need fallible
/// parsing catch internally and return `ParserOutcome::Abort`).
pub type ResponseParser = Arc<dyn Fn(&[u8], &TaskInfo) -> ParserOutcome + Send + Sync>;

/// The receiving half of a Task's completion promise.
pub type TaskCompletion = oneshot::Receiver<TaskOutcome>;

/// What the Queue should do after a retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retries remain; re-enqueue at the head of the task's priority lane.
    Requeue,
    /// Retries were exhausted; the task has already completed as Abort.
    Exhausted,
}

/// One outstanding command. Created by a driver, enqueued on a Queue, at
/// most once in-flight, terminal on completion, never reused.
pub struct Task {
    pub name: String,
    pub priority: Priority,
    retries_remaining: u32,
    pub timeout: Duration,
    pub delay_before: Option<Duration>,
    pub clear_queue: bool,
    payload_producer: Option<Box<dyn FnOnce() -> Bytes + Send>>,
    payload: Option<Bytes>,
    response_parser: Option<ResponseParser>,
    completion: Option<oneshot::Sender<TaskOutcome>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("retries_remaining", &self.retries_remaining)
            .field("timeout", &self.timeout)
            .field("clear_queue", &self.clear_queue)
            .finish()
    }
}

impl Task {
    /// Build a Task whose payload is produced lazily, exactly once, at
    /// dispatch time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        retries: u32,
        timeout: Duration,
        delay_before: Option<Duration>,
        clear_queue: bool,
        payload_producer: impl FnOnce() -> Bytes + Send + 'static,
        response_parser: Option<ResponseParser>,
    ) -> (Task, TaskCompletion) {
        let (tx, rx) = oneshot::channel();
        let task = Task {
            name: name.into(),
            priority,
            retries_remaining: retries,
            timeout,
            delay_before,
            clear_queue,
            payload_producer: Some(Box::new(payload_producer)),
            payload: None,
            response_parser,
            completion: Some(tx),
        };
        (task, rx)
    }

    /// Build a Task with an already-known payload.
    #[allow(clippy::too_many_arguments)]
    pub fn with_payload(
        name: impl Into<String>,
        priority: Priority,
        retries: u32,
        timeout: Duration,
        delay_before: Option<Duration>,
        clear_queue: bool,
        payload: Bytes,
        response_parser: Option<ResponseParser>,
    ) -> (Task, TaskCompletion) {
        Self::new(
            name,
            priority,
            retries,
            timeout,
            delay_before,
            clear_queue,
            move || payload,
            response_parser,
        )
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            name: self.name.clone(),
            priority: self.priority,
            retries_remaining: self.retries_remaining,
        }
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn has_response_parser(&self) -> bool {
        self.response_parser.is_some()
    }

    pub(crate) fn response_parser(&self) -> Option<ResponseParser> {
        self.response_parser.clone()
    }

    /// Invoke the payload producer exactly once and cache the result; safe
    /// to call more than once (idempotent after the first call).
    pub(crate) fn resolve_payload(&mut self) -> Bytes {
        if let Some(payload) = &self.payload {
            return payload.clone();
        }
        let producer = self
            .payload_producer
            .take()
            .expect("payload already resolved and producer consumed");
        let bytes = producer();
        self.payload = Some(bytes.clone());
        bytes
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completion.is_none()
    }

    fn complete(&mut self, outcome: TaskOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve completion with `value`. Permitted only once; subsequent
    /// calls (on an already-completed Task) are no-ops.
    pub fn success(&mut self, value: Bytes) {
        self.complete(TaskOutcome::Success(value));
    }

    /// Immediate terminal completion. Idempotent.
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.complete(TaskOutcome::Abort(reason.into()));
    }

    /// Attempt a retry: if retries remain, decrement and report
    /// `Requeue` so the Queue re-enqueues at the head of this task's lane;
    /// otherwise complete as `Abort(reason)` and report `Exhausted`.
    pub(crate) fn retry(&mut self, reason: impl Into<String>) -> RetryDecision {
        if self.retries_remaining > 0 {
            self.retries_remaining -= 1;
            RetryDecision::Requeue
        } else {
            self.complete(TaskOutcome::Abort(reason.into()));
            RetryDecision::Exhausted
        }
    }
}

impl std::fmt::Debug for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Success(v) => write!(f, "Success({} bytes)", v.len()),
            TaskOutcome::Abort(reason) => write!(f, "Abort({reason})"),
            TaskOutcome::Timeout => write!(f, "Timeout"),
            TaskOutcome::Error(e) => write!(f, "Error({e})"),
        }
    }
}
