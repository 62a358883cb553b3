//! Deferred-call buffer: calls and events parked until the lifecycle allows them.
//!
//! Every entry is either a captured call on a [`PendingObject`] or an opaque
//! [`PendingEvent`]. Entries are replayed strictly in arrival order by flush
//! passes; a pass stops at the first entry that cannot be delivered yet so
//! nothing overtakes an earlier call.
//!
//! # Locking
//!
//! A single re-entrant mutex guards the queue. The fast path (ready check plus
//! immediate delivery), enqueue and flush all run under it, which rules out a
//! call being parked after a flush pass has already concluded the queue is
//! drained. The queue's `RefCell` borrow is never held while user code runs
//! (readiness predicates, deliveries), so a delivered operation may call back
//! into the buffer on the same thread.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::config::BufferConfig;
use crate::error::{CallResult, Error, Result};
use crate::state::{LifecycleState, StateCell};

/// Operation name reported for opaque event deliveries.
pub const EVENT_OPERATION: &str = "notify_event";

/// An object whose availability depends on the lifecycle state.
///
/// Predicates must be monotone: once an object reports ready for a state it
/// must stay ready for every later state. Facades rely on this when they
/// switch to pass-through mode.
pub trait PendingObject: Send + Sync + 'static {
    /// Whether the object accepts direct calls in `state`.
    fn ready_for_calls(&self, state: LifecycleState) -> bool;
}

/// Consumer of opaque events; only fed once the lifecycle is exactly `Running`.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver an event. The sink takes ownership and releases it.
    fn notify(&self, event: PendingEvent) -> CallResult;
}

/// Free-form event queued for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Event type, e.g. `"Viewport:Resize"`.
    pub kind: String,
    /// Event body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PendingEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Event with a `null` payload.
    #[must_use]
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, serde_json::Value::Null)
    }
}

/// Result of a single flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// State the pass was run for.
    pub state: LifecycleState,
    /// Entries delivered by this pass.
    pub delivered: usize,
    /// Entries still waiting after this pass.
    pub remaining: usize,
    /// Whether the pass drained the queue and reset its storage.
    pub compacted: bool,
}

/// Snapshot of buffer counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Entries waiting for delivery.
    pub pending: usize,
    /// Index of the next entry to deliver.
    pub cursor: usize,
    /// Slots in the backing storage, delivered ones included.
    pub slots: usize,
    /// Entries ever parked.
    pub buffered_total: u64,
    /// Entries delivered by flush passes.
    pub delivered_total: u64,
    /// Entries whose delivery failed.
    pub faults_total: u64,
    /// Flush passes run.
    pub flush_passes: u64,
    /// Times the drained queue was reset.
    pub compactions: u64,
}

/// How a dispatched call was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// Invoked immediately; carries the operation's own result.
    Delivered(CallResult),
    /// Parked for a later flush pass.
    Buffered,
}

type Invoke = Box<dyn FnOnce() -> CallResult + Send>;

struct PendingCall {
    target: Arc<dyn PendingObject>,
    operation: &'static str,
    invoke: Invoke,
}

enum PendingEntry {
    Call(PendingCall),
    Event(PendingEvent),
}

impl PendingEntry {
    fn operation(&self) -> &'static str {
        match self {
            Self::Call(call) => call.operation,
            Self::Event(_) => EVENT_OPERATION,
        }
    }
}

#[derive(Default)]
struct Queue {
    // Slots before `cursor` have been delivered and vacated.
    entries: Vec<Option<PendingEntry>>,
    cursor: usize,
    // Bumped on every reset so stale indices are detectable.
    epoch: u64,
}

impl Queue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            cursor: 0,
            epoch: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    fn pending(&self) -> usize {
        self.entries.len().saturating_sub(self.cursor)
    }

    fn push(&mut self, entry: PendingEntry) -> usize {
        self.entries.push(Some(entry));
        self.pending()
    }

    fn take_next(&mut self) -> Option<PendingEntry> {
        let entry = self.entries.get_mut(self.cursor)?.take();
        self.cursor += 1;
        entry
    }

    fn reset_if_drained(&mut self, keep_capacity: usize) -> bool {
        if self.entries.is_empty() || !self.is_drained() {
            return false;
        }
        self.entries.clear();
        self.entries.shrink_to(keep_capacity);
        self.cursor = 0;
        self.epoch = self.epoch.wrapping_add(1);
        true
    }
}

enum Peek {
    Drained,
    Event,
    Call {
        index: usize,
        epoch: u64,
        target: Arc<dyn PendingObject>,
    },
}

enum Step {
    Stop,
    Deliver(PendingEntry),
}

#[derive(Default)]
struct Counters {
    buffered: AtomicU64,
    delivered: AtomicU64,
    faults: AtomicU64,
    flush_passes: AtomicU64,
    compactions: AtomicU64,
}

/// Ordered buffer of calls and events awaiting lifecycle progress.
pub(crate) struct DeferredCallBuffer {
    queue: ReentrantMutex<RefCell<Queue>>,
    config: BufferConfig,
    counters: Counters,
    over_threshold: AtomicBool,
}

impl DeferredCallBuffer {
    pub(crate) fn new(config: BufferConfig) -> Self {
        Self {
            queue: ReentrantMutex::new(RefCell::new(Queue::with_capacity(
                config.initial_capacity,
            ))),
            config,
            counters: Counters::default(),
            over_threshold: AtomicBool::new(false),
        }
    }

    /// Whether `target` could be called directly right now.
    pub(crate) fn admits_direct(&self, state: &StateCell, target: &dyn PendingObject) -> bool {
        let guard = self.queue.lock();
        let drained = guard.borrow().is_drained();
        drained && target.ready_for_calls(state.load())
    }

    /// Invoke `call` now if nothing is queued and `target` is ready, else park it.
    pub(crate) fn dispatch<F>(
        &self,
        state: &StateCell,
        target: Arc<dyn PendingObject>,
        operation: &'static str,
        call: F,
    ) -> Dispatched
    where
        F: FnOnce() -> CallResult + Send + 'static,
    {
        let guard = self.queue.lock();
        let drained = guard.borrow().is_drained();
        if drained && target.ready_for_calls(state.load()) {
            return Dispatched::Delivered(call());
        }

        let pending = guard.borrow_mut().push(PendingEntry::Call(PendingCall {
            target,
            operation,
            invoke: Box::new(call),
        }));
        trace!(operation, pending, "buffered call");
        self.note_parked(pending);
        Dispatched::Buffered
    }

    /// Deliver `event` now if nothing is queued and the state is `Running`, else park it.
    pub(crate) fn add_event(
        &self,
        state: &StateCell,
        sink: &dyn EventSink,
        event: PendingEvent,
    ) -> Result<()> {
        let guard = self.queue.lock();
        let drained = guard.borrow().is_drained();
        if drained && state.load().is(LifecycleState::Running) {
            return sink.notify(event).map_err(|source| Error::Delivery {
                operation: EVENT_OPERATION,
                source,
            });
        }

        let event_kind = event.kind.clone();
        let pending = guard.borrow_mut().push(PendingEntry::Event(event));
        trace!(event_kind = %event_kind, pending, "buffered event");
        self.note_parked(pending);
        Ok(())
    }

    /// Replay as many entries as `state` allows, in order.
    ///
    /// A delivery fault consumes the faulting entry, stops the pass and is
    /// returned; later entries stay queued for the next pass.
    pub(crate) fn flush(
        &self,
        state: LifecycleState,
        sink: Option<&dyn EventSink>,
    ) -> Result<FlushReport> {
        let guard = self.queue.lock();
        self.counters.flush_passes.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let outcome = loop {
            let entry = match self.next_step(&guard, state, sink.is_some()) {
                Step::Stop => break Ok(()),
                Step::Deliver(entry) => entry,
            };
            let operation = entry.operation();
            match deliver(entry, sink) {
                Ok(()) => {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.counters.faults.fetch_add(1, Ordering::Relaxed);
                    error!(%state, operation, error = %err, "buffered call failed on delivery");
                    break Err(err);
                }
            }
        };

        let (remaining, cursor, compacted) = {
            let mut queue = guard.borrow_mut();
            let compacted = queue.reset_if_drained(self.config.initial_capacity);
            (queue.pending(), queue.cursor, compacted)
        };
        if compacted {
            self.counters.compactions.fetch_add(1, Ordering::Relaxed);
            self.over_threshold.store(false, Ordering::Relaxed);
        }
        drop(guard);

        if delivered > 0 || remaining > 0 {
            debug!(%state, delivered, remaining, cursor, compacted, "flush pass");
        }

        outcome.map(|()| FlushReport {
            state,
            delivered,
            remaining,
            compacted,
        })
    }

    pub(crate) fn stats(&self) -> BufferStats {
        let guard = self.queue.lock();
        let queue = guard.borrow();
        BufferStats {
            pending: queue.pending(),
            cursor: queue.cursor,
            slots: queue.entries.len(),
            buffered_total: self.counters.buffered.load(Ordering::Relaxed),
            delivered_total: self.counters.delivered.load(Ordering::Relaxed),
            faults_total: self.counters.faults.load(Ordering::Relaxed),
            flush_passes: self.counters.flush_passes.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().borrow().pending()
    }

    fn note_parked(&self, pending: usize) {
        self.counters.buffered.fetch_add(1, Ordering::Relaxed);
        if pending > self.config.pending_warn_threshold
            && !self.over_threshold.swap(true, Ordering::Relaxed)
        {
            warn!(
                pending,
                threshold = self.config.pending_warn_threshold,
                "deferred call buffer keeps growing; is the lifecycle stalled?"
            );
        }
    }

    /// Take the next deliverable entry, or stop.
    ///
    /// Readiness predicates run without the queue borrowed; if the queue moved
    /// underneath (same-thread re-entry), the head is examined again.
    fn next_step(&self, queue: &RefCell<Queue>, state: LifecycleState, has_sink: bool) -> Step {
        loop {
            let peek = {
                let q = queue.borrow();
                let head = q.entries.get(q.cursor);
                // `take_next` empties a slot and moves the cursor past it under
                // one borrow, so the slot at the cursor is always filled.
                debug_assert!(!matches!(head, Some(None)), "vacant slot at cursor");
                match head.and_then(Option::as_ref) {
                    None => Peek::Drained,
                    Some(PendingEntry::Event(_)) => Peek::Event,
                    Some(PendingEntry::Call(call)) => Peek::Call {
                        index: q.cursor,
                        epoch: q.epoch,
                        target: Arc::clone(&call.target),
                    },
                }
            };

            match peek {
                Peek::Drained => return Step::Stop,
                Peek::Event => {
                    // Events wait for exactly `Running`, whatever else is ready.
                    if !state.is(LifecycleState::Running) || !has_sink {
                        return Step::Stop;
                    }
                    if let Some(entry) = queue.borrow_mut().take_next() {
                        return Step::Deliver(entry);
                    }
                }
                Peek::Call {
                    index,
                    epoch,
                    target,
                } => {
                    if !target.ready_for_calls(state) {
                        return Step::Stop;
                    }
                    let mut q = queue.borrow_mut();
                    if q.cursor != index || q.epoch != epoch {
                        continue;
                    }
                    if let Some(entry) = q.take_next() {
                        return Step::Deliver(entry);
                    }
                }
            }
        }
    }
}

fn deliver(entry: PendingEntry, sink: Option<&dyn EventSink>) -> Result<()> {
    match entry {
        PendingEntry::Call(call) => invoke_guarded(call.operation, call.invoke),
        PendingEntry::Event(event) => {
            let Some(sink) = sink else {
                return Err(Error::Invocation {
                    operation: EVENT_OPERATION,
                    message: "event sink disappeared".to_string(),
                });
            };
            trace!(event_kind = %event.kind, "delivering buffered event");
            invoke_guarded(EVENT_OPERATION, Box::new(|| sink.notify(event)))
        }
    }
}

fn invoke_guarded<'a>(
    operation: &'static str,
    invoke: Box<dyn FnOnce() -> CallResult + 'a>,
) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(Error::Delivery { operation, source }),
        Err(payload) => Err(Error::Invocation {
            operation,
            message: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
