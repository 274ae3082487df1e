//! Cancellable, queue-backed task shapes and the interruptible-event framework
//! they're built on.
//!
//! An [`InterruptibleEvent`] wraps a payload with a level-triggered
//! [`InterruptionEvent`] signal and an optional [`ResponseTracker`]. Every
//! event a conversation creates is registered on its [`InterruptQueue`] at
//! construction time through an [`InterruptibleEventFactory`], so draining
//! that queue (`broadcast_interrupt`) can reach every outstanding event
//! without each worker needing to know about the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A level-triggered interrupt signal shared between the event's owner and
/// whichever worker is (or will be) processing it.
#[derive(Debug, Clone, Default)]
pub struct InterruptionEvent {
    set: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl InterruptionEvent {
    /// Create a fresh, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Level-check: has this event been interrupted?
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Set the signal, waking anyone awaiting [`Self::wait`].
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolve once the signal is set. Safe to call after it is already set.
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A single-shot signal set when a response has been fully rendered to the
/// user (or discarded on cancellation).
#[derive(Debug, Clone)]
pub struct ResponseTracker {
    inner: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    fired: Arc<AtomicBool>,
}

impl ResponseTracker {
    /// Create a tracker together with the future that resolves once fired.
    pub fn new() -> (Self, ResponseTrackerWait) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Some(tx))),
                fired: Arc::new(AtomicBool::new(false)),
            },
            ResponseTrackerWait(rx),
        )
    }

    /// Mark the response complete. Idempotent: firing twice is a no-op.
    pub async fn mark_complete(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Whether `mark_complete` has already been called.
    pub fn is_complete(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// The waitable half of a [`ResponseTracker`].
pub struct ResponseTrackerWait(oneshot::Receiver<()>);

impl ResponseTrackerWait {
    /// Wait for the paired tracker to fire. Resolves immediately if the
    /// tracker was dropped without firing.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// An event wrapping a payload with interruption and completion bookkeeping.
pub struct InterruptibleEvent<T> {
    payload: Mutex<Option<T>>,
    pub interruption_event: InterruptionEvent,
    pub is_interruptible: bool,
    pub response_tracker: Option<ResponseTracker>,
    interrupted: Arc<AtomicBool>,
}

impl<T> InterruptibleEvent<T> {
    fn new(
        payload: T,
        is_interruptible: bool,
        response_tracker: Option<ResponseTracker>,
    ) -> Self {
        Self {
            payload: Mutex::new(Some(payload)),
            interruption_event: InterruptionEvent::new(),
            is_interruptible,
            response_tracker,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Interrupt this event. Returns `true` if this call actually flipped an
    /// interruptible event from not-interrupted to interrupted; a
    /// non-interruptible event still records the attempt (so
    /// `is_set`-based waiters unblock) but never counts toward
    /// `broadcast_interrupt`'s tally.
    pub fn interrupt(&self) -> bool {
        self.interruption_event.set();
        if !self.is_interruptible {
            return false;
        }
        !self.interrupted.swap(true, Ordering::SeqCst)
    }

    /// Has `interrupt()` already flipped this event?
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Take the payload for processing. Returns `None` if already taken or
    /// if the event was interrupted before it could be claimed — per the
    /// invariant that an interrupted payload must never reach downstream.
    pub async fn take_payload(&self) -> Option<T> {
        if self.interruption_event.is_set() {
            return None;
        }
        self.payload.lock().await.take()
    }
}

/// The conversation-scoped registry of every outstanding interruptible
/// event. Written by the factory, drained by `broadcast_interrupt`.
#[derive(Clone, Default)]
pub struct InterruptQueue {
    inner: Arc<Mutex<Vec<Arc<dyn ErasedInterruptible>>>>,
}

/// Type-erased view of an `InterruptibleEvent<T>` sufficient for
/// `broadcast_interrupt` to drain without knowing `T`.
pub trait ErasedInterruptible: Send + Sync {
    /// See [`InterruptibleEvent::interrupt`].
    fn interrupt(&self) -> bool;
    /// See [`InterruptibleEvent::is_interrupted`].
    fn is_interrupted(&self) -> bool;
}

impl<T: Send + Sync> ErasedInterruptible for InterruptibleEvent<T> {
    fn interrupt(&self) -> bool {
        InterruptibleEvent::interrupt(self)
    }

    fn is_interrupted(&self) -> bool {
        InterruptibleEvent::is_interrupted(self)
    }
}

impl InterruptQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event. Called only by [`InterruptibleEventFactory`] so
    /// construction and registration stay atomic from the caller's
    /// perspective.
    async fn register(&self, event: Arc<dyn ErasedInterruptible>) {
        self.inner.lock().await.push(event);
    }

    /// Drain the queue without blocking, interrupting every event that
    /// hasn't already been. Returns `true` iff at least one interruptible
    /// event was newly interrupted.
    pub async fn broadcast_interrupt(&self) -> bool {
        let events = std::mem::take(&mut *self.inner.lock().await);
        let mut any_interrupted = false;
        for event in &events {
            if event.is_interrupted() {
                continue;
            }
            if event.interrupt() {
                any_interrupted = true;
            }
        }
        any_interrupted
    }
}

/// Sole constructor for [`InterruptibleEvent`]s. Every event created through
/// this factory is registered on the conversation's [`InterruptQueue`] before
/// the caller observes it, so `broadcast_interrupt` can always reach it.
#[derive(Clone)]
pub struct InterruptibleEventFactory {
    queue: InterruptQueue,
}

impl InterruptibleEventFactory {
    /// Create a factory that registers every event onto `queue`.
    pub fn new(queue: InterruptQueue) -> Self {
        Self { queue }
    }

    /// Construct and register an interruptible event, optionally returning a
    /// waitable half of its response tracker.
    pub async fn create<T: Send + Sync + 'static>(
        &self,
        payload: T,
        is_interruptible: bool,
        with_tracker: bool,
    ) -> (Arc<InterruptibleEvent<T>>, Option<ResponseTrackerWait>) {
        let (tracker, wait) = if with_tracker {
            let (tracker, wait) = ResponseTracker::new();
            (Some(tracker), Some(wait))
        } else {
            (None, None)
        };
        let event = Arc::new(InterruptibleEvent::new(payload, is_interruptible, tracker));
        self.queue.register(event.clone() as Arc<dyn ErasedInterruptible>).await;
        (event, wait)
    }

    /// Construct and register an event carrying a tracker inherited from an
    /// upstream event, rather than minting a fresh one. Used when a stage
    /// re-wraps a payload for the next stage but the response-tracker must
    /// still fire only once the *downstream* work completes.
    pub async fn create_with_tracker<T: Send + Sync + 'static>(
        &self,
        payload: T,
        is_interruptible: bool,
        tracker: Option<ResponseTracker>,
    ) -> Arc<InterruptibleEvent<T>> {
        let event = Arc::new(InterruptibleEvent::new(payload, is_interruptible, tracker));
        self.queue.register(event.clone() as Arc<dyn ErasedInterruptible>).await;
        event
    }
}

/// Loops taking items off a queue and calling `process` on each; exits on
/// cancellation. The base shape every other worker builds on.
pub struct AsyncQueueWorker<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> AsyncQueueWorker<T> {
    /// Create a worker pulling from `rx`, stopping when `cancel` fires.
    pub fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Run the loop, calling `process` for each item until the queue closes
    /// or `cancel` fires.
    pub async fn run<F, Fut>(mut self, mut process: F)
    where
        F: FnMut(T) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("async queue worker cancelled");
                    break;
                }
                item = self.rx.recv() => {
                    match item {
                        Some(item) => process(item).await,
                        None => break,
                    }
                }
            }
        }
    }
}

/// A lightweight, cloneable handle that can cancel a worker's in-flight task
/// from outside it. Workers are consumed by value when `run` is spawned, so
/// callers that need to interrupt them later extract a handle beforehand.
#[derive(Clone)]
pub struct WorkerHandle {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl WorkerHandle {
    /// Cancel only the in-flight `process` call, leaving the queue loop alive.
    pub async fn cancel_current_task(&self) {
        if let Some(token) = self.current.lock().await.as_ref() {
            token.cancel();
        }
    }
}

/// Loops taking `InterruptibleEvent<T>` items; `process` runs inside a scope
/// cancelled the moment the event's `interruption_event` fires, discarding
/// whatever `process` was doing.
pub struct InterruptibleWorker<T> {
    rx: mpsc::Receiver<Arc<InterruptibleEvent<T>>>,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl<T: Send + Sync + 'static> InterruptibleWorker<T> {
    /// Create a worker pulling interruptible events from `rx`.
    pub fn new(rx: mpsc::Receiver<Arc<InterruptibleEvent<T>>>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancel only the in-flight `process` call, leaving the queue loop
    /// alive to pick up the next item.
    pub async fn cancel_current_task(&self) {
        if let Some(token) = self.current.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// A cloneable handle to cancel the in-flight `process` call, usable
    /// after `run` has taken ownership of the worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            current: self.current.clone(),
        }
    }

    /// Run the loop. `process` receives the claimed payload; its result is
    /// dropped silently if the event was interrupted mid-flight.
    pub async fn run<F, Fut>(mut self, mut process: F)
    where
        F: FnMut(T) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                item = self.rx.recv() => {
                    let Some(event) = item else { break };
                    let Some(payload) = event.take_payload().await else {
                        continue;
                    };
                    let task_token = CancellationToken::new();
                    *self.current.lock().await = Some(task_token.clone());
                    tokio::select! {
                        () = event.interruption_event.wait() => {
                            task_token.cancel();
                        }
                        () = process(payload) => {}
                    }
                    *self.current.lock().await = None;
                }
            }
        }
    }
}

/// Same cancellation shape as [`InterruptibleWorker`], plus a hook to emit
/// downstream events that preserve `is_interruptible` and
/// `response_tracker` linkage from the inbound event.
pub struct InterruptibleAgentResponseWorker<T, U> {
    rx: mpsc::Receiver<Arc<InterruptibleEvent<T>>>,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
    _downstream: std::marker::PhantomData<U>,
}

impl<T: Send + Sync + 'static, U: Send + Sync + 'static> InterruptibleAgentResponseWorker<T, U> {
    /// Create a worker pulling interruptible agent responses from `rx`.
    pub fn new(rx: mpsc::Receiver<Arc<InterruptibleEvent<T>>>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            current: Arc::new(Mutex::new(None)),
            _downstream: std::marker::PhantomData,
        }
    }

    /// Cancel only the in-flight `process` call.
    pub async fn cancel_current_task(&self) {
        if let Some(token) = self.current.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// A cloneable handle to cancel the in-flight `process` call, usable
    /// after `run` has taken ownership of the worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            current: self.current.clone(),
        }
    }

    /// Run the loop. `process` receives the claimed payload and the inbound
    /// event's interruptibility/tracker so it can stamp them onto whatever
    /// it emits downstream.
    pub async fn run<F, Fut>(mut self, mut process: F)
    where
        F: FnMut(T, bool, Option<ResponseTracker>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                item = self.rx.recv() => {
                    let Some(event) = item else { break };
                    let is_interruptible = event.is_interruptible;
                    let tracker = event.response_tracker.clone();
                    let Some(payload) = event.take_payload().await else {
                        continue;
                    };
                    let task_token = CancellationToken::new();
                    *self.current.lock().await = Some(task_token.clone());
                    tokio::select! {
                        () = event.interruption_event.wait() => {
                            task_token.cancel();
                        }
                        () = process(payload, is_interruptible, tracker) => {}
                    }
                    *self.current.lock().await = None;
                }
            }
        }
    }
}

/// Adapts a synchronous blocking loop (codec/file I/O) behind an async-queue
/// façade, running it on a blocking thread so it never stalls the
/// cooperative executor.
pub struct ThreadAsyncWorker<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> ThreadAsyncWorker<T> {
    /// Create a worker pulling from `rx`, stopping when `cancel` fires.
    pub fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Run the loop, handing each item to a blocking `process` closure on a
    /// dedicated blocking thread via `tokio::task::spawn_blocking`.
    pub async fn run<F>(mut self, process: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let process = Arc::new(process);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                item = self.rx.recv() => {
                    match item {
                        Some(item) => {
                            let process = process.clone();
                            if let Err(e) = tokio::task::spawn_blocking(move || process(item)).await {
                                warn!("blocking worker task panicked: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interruption_event_wait_resolves_once_set() {
        let event = InterruptionEvent::new();
        assert!(!event.is_set());
        let waiter = event.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        event.set();
        handle.await.expect("task");
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn response_tracker_fires_once() {
        let (tracker, wait) = ResponseTracker::new();
        assert!(!tracker.is_complete());
        tracker.mark_complete().await;
        tracker.mark_complete().await;
        assert!(tracker.is_complete());
        wait.wait().await;
    }

    #[tokio::test]
    async fn interruptible_event_payload_withheld_after_interrupt() {
        let event = InterruptibleEvent::new(42, true, None);
        event.interrupt();
        assert!(event.take_payload().await.is_none());
    }

    #[tokio::test]
    async fn non_interruptible_event_does_not_count_toward_broadcast() {
        let event: Arc<InterruptibleEvent<u8>> = Arc::new(InterruptibleEvent::new(1, false, None));
        let counted = event.interrupt();
        assert!(!counted);
        assert!(event.interruption_event.is_set());
    }

    #[tokio::test]
    async fn broadcast_interrupt_reports_whether_anything_was_interrupted() {
        let queue = InterruptQueue::new();
        let factory = InterruptibleEventFactory::new(queue.clone());

        assert!(!queue.broadcast_interrupt().await);

        let (_event, _wait) = factory.create(1u32, true, false).await;
        assert!(queue.broadcast_interrupt().await);
        // Draining again finds nothing left registered.
        assert!(!queue.broadcast_interrupt().await);
    }

    #[tokio::test]
    async fn broadcast_interrupt_skips_already_interrupted_events() {
        let queue = InterruptQueue::new();
        let factory = InterruptibleEventFactory::new(queue.clone());
        let (event, _wait) = factory.create(1u32, true, false).await;
        event.interrupt();
        assert!(!queue.broadcast_interrupt().await);
    }
}
