//! Process-wide engine lifecycle: the state cell, its owner, and the
//! deferred-call buffer it drives.
//!
//! Every state change runs exactly one flush pass for the new state, so
//! calls parked on not-yet-ready objects are replayed as soon as the
//! lifecycle allows them.
//!
//! Two ways to move the state:
//!
//! - [`Lifecycle::transition`]: compare-and-swap from an expected state. Any
//!   thread may try; when several race from the same state exactly one wins
//!   and the rest get `Ok(false)`.
//! - [`Lifecycle::force_advance`]: unconditional advance, reserved to the
//!   lifecycle owner thread (the engine thread). The first thread to call it
//!   becomes the owner unless [`Lifecycle::bind_owner`] ran earlier.
//!
//! The state never moves backwards.

use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use tracing::{debug, info};

use crate::buffer::{
    BufferStats, DeferredCallBuffer, Dispatched, EVENT_OPERATION, EventSink, FlushReport,
    PendingEvent, PendingObject,
};
use crate::config::BufferConfig;
use crate::error::{CallResult, Error, LifecycleError, Result};
use crate::state::{LifecycleState, StateCell};

static GLOBAL_LIFECYCLE: OnceLock<Arc<Lifecycle>> = OnceLock::new();

#[derive(Debug)]
struct Owner {
    id: ThreadId,
    label: String,
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => format!("{name} ({:?})", current.id()),
        None => format!("{:?}", current.id()),
    }
}

/// Engine lifecycle state plus the calls waiting on it.
pub struct Lifecycle {
    state: StateCell,
    owner: OnceLock<Owner>,
    sink: OnceLock<Arc<dyn EventSink>>,
    buffer: DeferredCallBuffer,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.current())
            .field("owner", &self.owner.get().map(|owner| owner.label.as_str()))
            .field("event_sink", &self.sink.get().is_some())
            .field("buffer", &self.buffer.stats())
            .finish()
    }
}

impl Lifecycle {
    /// Fresh lifecycle in [`LifecycleState::Initial`].
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        Self {
            state: StateCell::new(LifecycleState::Initial),
            owner: OnceLock::new(),
            sink: OnceLock::new(),
            buffer: DeferredCallBuffer::new(config),
        }
    }

    /// Initialize the process-wide lifecycle.
    ///
    /// The first call wins; later calls return the existing instance and
    /// ignore `config`.
    pub fn init_global(config: BufferConfig) -> Arc<Self> {
        GLOBAL_LIFECYCLE
            .get_or_init(|| Arc::new(Self::new(config)))
            .clone()
    }

    /// Get the process-wide lifecycle, if initialized.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_LIFECYCLE.get().cloned()
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Current state. Never blocks.
    pub fn current(&self) -> LifecycleState {
        self.state.load()
    }

    pub fn is(&self, state: LifecycleState) -> bool {
        self.current().is(state)
    }

    pub fn is_at_least(&self, state: LifecycleState) -> bool {
        self.current().is_at_least(state)
    }

    pub fn is_at_most(&self, state: LifecycleState) -> bool {
        self.current().is_at_most(state)
    }

    /// Inclusive range check against the current state.
    pub fn is_between(&self, min: LifecycleState, max: LifecycleState) -> bool {
        self.current().is_between(min, max)
    }

    /// The engine thread has been launched (state is past `Initial`).
    pub fn is_launched(&self) -> bool {
        !self.is(LifecycleState::Initial)
    }

    /// The engine is exactly `Running`.
    pub fn is_running(&self) -> bool {
        self.is(LifecycleState::Running)
    }

    /// Buffer counters.
    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Entries waiting in the buffer.
    pub fn pending_calls(&self) -> usize {
        self.buffer.pending()
    }

    // ── Ownership ───────────────────────────────────────────────────

    /// Bind the calling thread as the lifecycle owner.
    ///
    /// Idempotent for the owner itself; any other thread gets
    /// [`LifecycleError::OwnerAlreadyBound`].
    pub fn bind_owner(&self) -> Result<()> {
        let id = std::thread::current().id();
        let mut newly_bound = false;
        let owner = self.owner.get_or_init(|| {
            newly_bound = true;
            Owner {
                id,
                label: thread_label(),
            }
        });
        if owner.id == id {
            if newly_bound {
                debug!(owner = %owner.label, "lifecycle owner bound");
            }
            Ok(())
        } else {
            Err(LifecycleError::OwnerAlreadyBound {
                owner: owner.label.clone(),
            }
            .into())
        }
    }

    /// Whether the calling thread is the bound owner.
    pub fn is_owner_thread(&self) -> bool {
        self.owner
            .get()
            .is_some_and(|owner| owner.id == std::thread::current().id())
    }

    fn claim_writer(&self) -> Result<()> {
        self.bind_owner().map_err(|err| match err {
            crate::Error::Lifecycle(LifecycleError::OwnerAlreadyBound { owner }) => {
                LifecycleError::NotOwner {
                    owner,
                    caller: thread_label(),
                }
                .into()
            }
            other => other,
        })
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Move from `from` to `to` if the state is still `from`.
    ///
    /// Returns `Ok(false)` without side effects when another initiator got
    /// there first. On success runs one flush pass for `to`; a flush error
    /// is returned even though the state has already changed.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<bool> {
        if to <= from {
            return Err(LifecycleError::Regression { from, to }.into());
        }
        match self.state.compare_exchange(from, to) {
            Ok(()) => {
                info!(%from, %to, "lifecycle transitioned");
                self.flush(to)?;
                Ok(true)
            }
            Err(observed) => {
                debug!(%from, %to, %observed, "lifecycle transition lost the race");
                Ok(false)
            }
        }
    }

    /// Advance to `to` unconditionally and run a flush pass for it.
    ///
    /// Only the owner thread may call this. Re-asserting the current state
    /// is allowed (it just flushes again); moving backwards is not.
    pub fn force_advance(&self, to: LifecycleState) -> Result<FlushReport> {
        self.claim_writer()?;
        let from = loop {
            let observed = self.state.load();
            if to < observed {
                return Err(LifecycleError::Regression { from: observed, to }.into());
            }
            if self.state.compare_exchange(observed, to).is_ok() {
                break observed;
            }
        };
        if from != to {
            info!(%from, %to, "lifecycle advanced");
        }
        self.flush(to)
    }

    /// Run a flush pass for the current state.
    pub fn flush_pending(&self) -> Result<FlushReport> {
        self.flush(self.current())
    }

    fn flush(&self, state: LifecycleState) -> Result<FlushReport> {
        self.buffer.flush(state, self.sink.get().map(|sink| &**sink))
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Install the consumer of opaque pending events. Only once.
    pub fn install_event_sink(&self, sink: Arc<dyn EventSink>) -> Result<()> {
        self.sink
            .set(sink)
            .map_err(|_| LifecycleError::EventSinkAlreadyInstalled.into())
    }

    /// Deliver `event` once the lifecycle is exactly `Running` and
    /// everything queued ahead of it has been delivered.
    pub fn add_pending_event(&self, event: PendingEvent) -> Result<()> {
        let sink = self.sink.get().ok_or(LifecycleError::EventSinkMissing)?;
        self.buffer.add_event(&self.state, &**sink, event)
    }

    /// Hand `event` straight to the sink, skipping the buffer and the
    /// `Running` gate. Returns `Ok(false)` when no sink is installed.
    pub(crate) fn notify_now(&self, event: PendingEvent) -> Result<bool> {
        let Some(sink) = self.sink.get() else {
            return Ok(false);
        };
        sink.notify(event).map_err(|source| Error::Delivery {
            operation: EVENT_OPERATION,
            source,
        })?;
        Ok(true)
    }

    // ── Facade plumbing ─────────────────────────────────────────────

    pub(crate) fn admits_direct(&self, target: &dyn PendingObject) -> bool {
        self.buffer.admits_direct(&self.state, target)
    }

    pub(crate) fn dispatch<F>(
        &self,
        target: Arc<dyn PendingObject>,
        operation: &'static str,
        call: F,
    ) -> Dispatched
    where
        F: FnOnce() -> CallResult + Send + 'static,
    {
        self.buffer.dispatch(&self.state, target, operation, call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::Barrier;

    struct ReadyAt(LifecycleState);

    impl PendingObject for ReadyAt {
        fn ready_for_calls(&self, state: LifecycleState) -> bool {
            state.is_at_least(self.0)
        }
    }

    #[derive(Default)]
    struct Sink(Mutex<Vec<String>>);

    impl EventSink for Sink {
        fn notify(&self, event: PendingEvent) -> CallResult {
            self.0.lock().push(event.kind);
            Ok(())
        }
    }

    #[test]
    fn starts_initial_and_not_launched() {
        let lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.current(), LifecycleState::Initial);
        assert!(!lifecycle.is_launched());
        assert!(!lifecycle.is_running());
        assert!(lifecycle.is_at_most(LifecycleState::Initial));
    }

    #[test]
    fn transition_requires_matching_from() {
        let lifecycle = Lifecycle::default();
        assert!(!lifecycle
            .transition(LifecycleState::Launched, LifecycleState::GlueReady)
            .unwrap());
        assert_eq!(lifecycle.current(), LifecycleState::Initial);
        assert_eq!(lifecycle.stats().flush_passes, 0);

        assert!(lifecycle
            .transition(LifecycleState::Initial, LifecycleState::Launched)
            .unwrap());
        assert!(lifecycle.is_launched());
        assert_eq!(lifecycle.stats().flush_passes, 1);
    }

    #[test]
    fn transition_rejects_non_advancing_pairs() {
        let lifecycle = Lifecycle::default();
        let err = lifecycle
            .transition(LifecycleState::Initial, LifecycleState::Initial)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::Regression { .. })
        ));
    }

    #[test]
    fn racing_transitions_have_one_winner() {
        let lifecycle = Arc::new(Lifecycle::default());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lifecycle
                        .transition(LifecycleState::Initial, LifecycleState::Launched)
                        .unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(lifecycle.stats().flush_passes, 1);
        assert_eq!(lifecycle.current(), LifecycleState::Launched);
    }

    #[test]
    fn force_advance_binds_first_writer_and_rejects_others() {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.force_advance(LifecycleState::Launched).unwrap();
        assert!(lifecycle.is_owner_thread());

        let other = Arc::clone(&lifecycle);
        let err = std::thread::spawn(move || other.force_advance(LifecycleState::Running))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err, Error::Lifecycle(LifecycleError::NotOwner { .. })),
            "got: {err}"
        );
        assert_eq!(lifecycle.current(), LifecycleState::Launched);
    }

    #[test]
    fn force_advance_never_regresses() {
        let lifecycle = Lifecycle::default();
        lifecycle.force_advance(LifecycleState::Running).unwrap();
        let err = lifecycle
            .force_advance(LifecycleState::LibsReady)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::Regression {
                from: LifecycleState::Running,
                to: LifecycleState::LibsReady
            })
        ));
        assert_eq!(lifecycle.current(), LifecycleState::Running);

        // Re-asserting the current state still flushes.
        let before = lifecycle.stats().flush_passes;
        lifecycle.force_advance(LifecycleState::Running).unwrap();
        assert_eq!(lifecycle.stats().flush_passes, before + 1);
    }

    #[test]
    fn bind_owner_is_exclusive() {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.bind_owner().unwrap();
        lifecycle.bind_owner().unwrap();

        let other = Arc::clone(&lifecycle);
        let err = std::thread::spawn(move || other.bind_owner())
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::OwnerAlreadyBound { .. })
        ));
    }

    #[test]
    fn events_need_a_sink() {
        let lifecycle = Lifecycle::default();
        let err = lifecycle
            .add_pending_event(PendingEvent::bare("Engine:Ping"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::EventSinkMissing)
        ));

        lifecycle
            .install_event_sink(Arc::new(Sink::default()))
            .unwrap();
        let err = lifecycle
            .install_event_sink(Arc::new(Sink::default()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle(LifecycleError::EventSinkAlreadyInstalled)
        ));
    }

    #[test]
    fn events_flow_on_running() {
        let lifecycle = Lifecycle::default();
        let sink = Arc::new(Sink::default());
        lifecycle.install_event_sink(sink.clone()).unwrap();

        lifecycle
            .add_pending_event(PendingEvent::bare("Session:Restore"))
            .unwrap();
        lifecycle.force_advance(LifecycleState::LibsReady).unwrap();
        assert!(sink.0.lock().is_empty());
        assert_eq!(lifecycle.pending_calls(), 1);

        let report = lifecycle.force_advance(LifecycleState::Running).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(*sink.0.lock(), vec!["Session:Restore"]);

        // Running and empty: straight through.
        lifecycle
            .add_pending_event(PendingEvent::bare("Tab:Open"))
            .unwrap();
        assert_eq!(sink.0.lock().len(), 2);
        assert_eq!(lifecycle.pending_calls(), 0);
    }

    #[test]
    fn flush_pending_uses_current_state() {
        let lifecycle = Lifecycle::default();
        let target: Arc<dyn PendingObject> = Arc::new(ReadyAt(LifecycleState::Launched));
        let dispatched = lifecycle.dispatch(Arc::clone(&target), "noop", || Ok(()));
        assert_eq!(dispatched, Dispatched::Buffered);

        // Store without a flush, as if the state moved under us.
        lifecycle.state.store(LifecycleState::Launched);
        assert_eq!(lifecycle.pending_calls(), 1);
        let report = lifecycle.flush_pending().unwrap();
        assert_eq!(report.state, LifecycleState::Launched);
        assert_eq!(report.delivered, 1);
    }

    #[test]
    fn debug_output_mentions_state() {
        let lifecycle = Lifecycle::default();
        let rendered = format!("{lifecycle:?}");
        assert!(rendered.contains("Initial"), "got: {rendered}");
    }
}
