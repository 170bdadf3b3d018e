//! Ordered, priority-aware executor of Tasks against a Transport: at-most-
//! one-in-flight, timeouts, retries, `clear_queue` semantics (Module C).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::task::{ParserOutcome, Priority, ResponseParser, RetryDecision, Task, TaskInfo, TaskOutcome};

/// Message sent from a Transport reader back into the Queue when a
/// response parser (or the driver's general `received` callback acting on
/// its behalf) produces an outcome for the current in-flight task.
#[derive(Debug)]
pub enum TaskEvent {
    Outcome(ParserOutcome),
    /// Transport lost the connection while a task was in-flight; Queue
    /// treats this the same as a parser `Abort` would, per spec.md §4.C
    /// ("Transport terminates the task explicitly... Queue treats it as
    /// Abort(disconnect)"). Ordinary disconnects that are expected to
    /// recover leave the in-flight task alone; only an explicit terminate
    /// sends this.
    Disconnected,
}

struct Lanes {
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn push(&mut self, task: Task) {
        self.lane_mut(task.priority).push_back(task);
    }

    fn push_front(&mut self, task: Task) {
        self.lane_mut(task.priority).push_front(task);
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<Task> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop_highest(&mut self) -> Option<Task> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn drain_all(&mut self) -> Vec<Task> {
        self.high
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.low.drain(..))
            .collect()
    }
}

/// Callback the Queue uses to hand a resolved payload, the dispatched
/// task's identity, and its (possibly absent) response parser to the
/// Transport. The Transport registers the parser as "current" before
/// writing the bytes, so a reply racing the write is never missed (see
/// the core specification's `send` collaboration for Transport §4.D).
pub type SendFn = Arc<dyn Fn(bytes::Bytes, TaskInfo, Option<ResponseParser>) + Send + Sync>;

struct Inner {
    lanes: Lanes,
    current: Option<Task>,
    online: bool,
    terminated: bool,
}

/// Ordered, priority-aware executor of Tasks against a Transport.
///
/// `online` gates dispatch; it is raised and lowered by the owning
/// Transport as it connects and disconnects. The currently in-flight task
/// is never aborted purely because `online` drops — reconnection is
/// expected to recover the session (spec.md §4.C).
pub struct Queue {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
    send: SendFn,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
}

impl Queue {
    /// Create a Queue bound to a `send` callback (invoked by the dispatch
    /// loop whenever a task is ready to go out) and return it alongside
    /// the receiver end of its task-event channel, which the owning
    /// Transport's reader feeds with parser outcomes.
    pub fn new(send: SendFn) -> (Arc<Queue>, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Queue {
            inner: Mutex::new(Inner {
                lanes: Lanes::new(),
                current: None,
                online: false,
                terminated: false,
            }),
            notify: Arc::new(Notify::new()),
            send,
            events_tx,
        });
        (queue, events_rx)
    }

    /// Enqueue a task. Wait-free against the dispatch loop beyond the
    /// lane lock (spec.md §5 shared-resource discipline).
    ///
    /// A `clear_queue` task goes to the *front* of its own priority lane,
    /// so it is the next one popped within that lane rather than waiting
    /// behind same-priority tasks already queued; the actual drain of
    /// other pending tasks happens in `try_dispatch_next` at the moment
    /// this task is popped for dispatch (spec.md §4.C: "If the popped
    /// task has clear_queue, drop all other pending tasks first"). Tasks
    /// sitting in a strictly higher-priority lane are never touched: the
    /// scheduler always drains a higher lane before this one gets a turn,
    /// so by the time a clear_queue task is actually popped, no
    /// higher-priority task is still pending.
    pub async fn enqueue(&self, task: Task) {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            drop(inner);
            let mut task = task;
            task.abort("terminated");
            return;
        }
        if task.clear_queue {
            inner.lanes.push_front(task);
        } else {
            inner.lanes.push(task);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Raise or lower the `online` gate. Raising wakes the dispatch loop.
    pub async fn set_online(&self, online: bool) {
        let mut inner = self.inner.lock().await;
        inner.online = online;
        drop(inner);
        if online {
            self.notify.notify_one();
        }
    }

    pub async fn is_online(&self) -> bool {
        self.inner.lock().await.online
    }

    /// Report a task-level event from the Transport's reader. Runs
    /// outside any lock the dispatch loop holds; the loop picks it up via
    /// its event channel.
    pub fn report(&self, event: TaskEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Drain all pending tasks and the in-flight task (if any) as
    /// `Abort("terminated")`, and stop accepting new dispatches. Sticky:
    /// no further tasks dispatch after this (spec invariant 4).
    pub async fn terminate(&self) {
        let mut inner = self.inner.lock().await;
        inner.terminated = true;
        inner.online = false;
        if let Some(mut current) = inner.current.take() {
            current.abort("terminated");
        }
        for mut task in inner.lanes.drain_all() {
            task.abort("terminated");
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Run the dispatch loop until `terminate` is called. Intended to be
    /// spawned once per Queue and awaited to completion by whoever owns
    /// the Queue's lifecycle.
    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<TaskEvent>) {
        let terminated = AtomicBool::new(false);
        loop {
            if terminated.load(Ordering::Acquire) {
                break;
            }

            let dispatched = self.try_dispatch_next().await;
            if dispatched.is_none() {
                let notified = self.notify.notified();
                {
                    let inner = self.inner.lock().await;
                    if inner.terminated {
                        break;
                    }
                }
                notified.await;
                continue;
            }

            // A task is now in-flight. Race its timeout against incoming
            // events until it completes, retries, or aborts.
            let mut deadline = self.arm_deadline().await;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        let should_continue = self.handle_timeout().await;
                        if !should_continue {
                            break;
                        }
                        deadline = self.arm_deadline().await;
                    }
                    event = events_rx.recv() => {
                        match event {
                            Some(TaskEvent::Outcome(outcome)) => {
                                let keep_going = self.handle_outcome(outcome).await;
                                if !keep_going {
                                    break;
                                }
                                // Continue: re-arm from this moment.
                                deadline = self.arm_deadline().await;
                            }
                            Some(TaskEvent::Disconnected) => {
                                self.handle_disconnected().await;
                                break;
                            }
                            None => {
                                // Event channel closed; nothing more to drive.
                                terminated.store(true, Ordering::Release);
                                break;
                            }
                        }
                    }
                }

                let inner = self.inner.lock().await;
                if inner.current.is_none() || inner.terminated {
                    if inner.terminated {
                        terminated.store(true, Ordering::Release);
                    }
                    break;
                }
            }
        }
        debug!("queue dispatch loop terminated");
    }

    async fn arm_deadline(&self) -> Instant {
        let timeout = {
            let inner = self.inner.lock().await;
            inner
                .current
                .as_ref()
                .map(|t| t.timeout)
                .unwrap_or(Duration::from_secs(0))
        };
        Instant::now() + timeout
    }

    /// Pop the highest-priority task (if online, idle, and non-empty),
    /// honour its `delay_before`, resolve its payload, hand it to the
    /// Transport, and mark it in-flight.
    async fn try_dispatch_next(&self) -> Option<()> {
        let mut task = {
            let mut inner = self.inner.lock().await;
            if inner.terminated || !inner.online || inner.current.is_some() {
                return None;
            }
            let task = inner.lanes.pop_highest()?;
            if task.clear_queue {
                for mut displaced in inner.lanes.drain_all() {
                    displaced.abort("cleared");
                }
            }
            task
        };

        if let Some(delay) = task.delay_before {
            sleep(delay).await;
        }

        let payload = task.resolve_payload();
        let info = task.info();
        let parser = task.response_parser();
        trace!(task = %info.name, "dispatching task");

        {
            let mut inner = self.inner.lock().await;
            // A terminate() or disconnect may have landed while we slept.
            if inner.terminated {
                task.abort("terminated");
                return None;
            }
            inner.current = Some(task);
        }

        (self.send)(payload, info, parser);
        Some(())
    }

    /// Handle a fired deadline for the current task: retry, or complete
    /// as exhausted. Returns `true` if the dispatch loop should keep
    /// driving this task (never true for timeout; kept symmetric with
    /// `handle_outcome`).
    async fn handle_timeout(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut task) = inner.current.take() else {
            return false;
        };
        match task.retry("timeout") {
            RetryDecision::Requeue => {
                debug!(task = %task.name, retries_left = task.retries_remaining(), "task timed out, retrying");
                inner.lanes.push_front(task);
            }
            RetryDecision::Exhausted => {
                debug!(task = %task.name, "task timed out, retries exhausted");
            }
        }
        drop(inner);
        self.notify.notify_one();
        false
    }

    /// Handle a parser outcome for the current in-flight task. Returns
    /// `true` only for `Continue` (task stays in-flight).
    async fn handle_outcome(&self, outcome: ParserOutcome) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(mut task) = inner.current.take() else {
            warn!("received task event with no task in-flight");
            return false;
        };

        match outcome {
            ParserOutcome::Success(value) => {
                task.success(value);
                false
            }
            ParserOutcome::Abort(reason) => {
                task.abort(reason);
                false
            }
            ParserOutcome::Retry(reason) => {
                match task.retry(reason) {
                    RetryDecision::Requeue => inner.lanes.push_front(task),
                    RetryDecision::Exhausted => {}
                }
                drop(inner);
                self.notify.notify_one();
                false
            }
            ParserOutcome::Continue => {
                inner.current = Some(task);
                true
            }
        }
    }

    /// Transport explicitly terminated the in-flight task's connection
    /// (e.g. TLS failure). Ordinary reconnect-expected disconnects never
    /// call this — only an explicit terminate does (spec.md §4.C).
    async fn handle_disconnected(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut task) = inner.current.take() {
            task.abort("disconnect");
        }
    }
}

async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
}
