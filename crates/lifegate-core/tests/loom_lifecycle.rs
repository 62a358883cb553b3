//! Loom model-checking tests for the lifecycle state cell and buffer locking
//!
//! Loom explores every interleaving of the modelled threads. The models are
//! simplified copies of `StateCell` and of the buffer's lock discipline
//! written against loom's own primitives, so loom can permute them.

use loom::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex};
use loom::thread;

// ===========================================================================
// Models
// ===========================================================================

const INITIAL: u8 = 0;
const LAUNCHED: u8 = 1;
const GLUE_READY: u8 = 2;

/// State cell with compare-and-swap transitions and a monotone forced advance.
struct LoomStateCell {
    state: AtomicU8,
}

impl LoomStateCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(INITIAL),
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn force_advance(&self, to: u8) -> bool {
        loop {
            let observed = self.state.load(Ordering::Acquire);
            if to < observed {
                return false;
            }
            if self
                .state
                .compare_exchange(observed, to, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn load(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Queue of parked call ids plus a delivery counter, guarded like the buffer:
/// the ready check, the direct call and the push all happen under one lock.
struct LoomBuffer {
    queue: Mutex<Vec<usize>>,
    delivered: AtomicUsize,
}

impl LoomBuffer {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            delivered: AtomicUsize::new(0),
        }
    }

    fn dispatch(&self, cell: &LoomStateCell, ready_at: u8, id: usize) {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() && cell.load() >= ready_at {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            queue.push(id);
        }
    }

    fn flush(&self, state: u8, ready_at: u8) {
        let mut queue = self.queue.lock().unwrap();
        if state >= ready_at {
            self.delivered.fetch_add(queue.len(), Ordering::Relaxed);
            queue.clear();
        }
    }
}

// ===========================================================================
// Loom tests
// ===========================================================================

/// Two threads race the same transition; exactly one wins.
#[test]
fn loom_transition_has_single_winner() {
    loom::model(|| {
        let cell = Arc::new(LoomStateCell::new());

        let c1 = Arc::clone(&cell);
        let t1 = thread::spawn(move || c1.transition(INITIAL, LAUNCHED));
        let c2 = Arc::clone(&cell);
        let t2 = thread::spawn(move || c2.transition(INITIAL, LAUNCHED));

        let won1 = t1.join().unwrap();
        let won2 = t2.join().unwrap();
        assert!(won1 ^ won2);
        assert_eq!(cell.load(), LAUNCHED);
    });
}

/// A forced advance racing a transition never leaves the state behind
/// either writer's target.
#[test]
fn loom_force_advance_is_monotone() {
    loom::model(|| {
        let cell = Arc::new(LoomStateCell::new());

        let c1 = Arc::clone(&cell);
        let t1 = thread::spawn(move || c1.force_advance(GLUE_READY));
        let c2 = Arc::clone(&cell);
        let t2 = thread::spawn(move || c2.transition(INITIAL, LAUNCHED));

        assert!(t1.join().unwrap());
        // A late transition fails instead of dragging the state back.
        t2.join().unwrap();
        assert_eq!(cell.load(), GLUE_READY);
    });
}

/// A call dispatched while the state advances is either delivered directly
/// or picked up by the flush pass; it is never stranded.
#[test]
fn loom_dispatch_racing_flush_is_never_lost() {
    loom::model(|| {
        let cell = Arc::new(LoomStateCell::new());
        let buffer = Arc::new(LoomBuffer::new());

        let (c1, b1) = (Arc::clone(&cell), Arc::clone(&buffer));
        let caller = thread::spawn(move || b1.dispatch(&c1, LAUNCHED, 1));

        let (c2, b2) = (Arc::clone(&cell), Arc::clone(&buffer));
        let owner = thread::spawn(move || {
            if c2.transition(INITIAL, LAUNCHED) {
                b2.flush(LAUNCHED, LAUNCHED);
            }
        });

        caller.join().unwrap();
        owner.join().unwrap();

        assert_eq!(buffer.delivered.load(Ordering::Relaxed), 1);
        assert!(buffer.queue.lock().unwrap().is_empty());
    });
}

/// Two callers parked before the state moves are both delivered by one pass.
#[test]
fn loom_two_callers_one_flush() {
    loom::model(|| {
        let cell = Arc::new(LoomStateCell::new());
        let buffer = Arc::new(LoomBuffer::new());

        buffer.dispatch(&cell, LAUNCHED, 0);

        let (c1, b1) = (Arc::clone(&cell), Arc::clone(&buffer));
        let caller = thread::spawn(move || b1.dispatch(&c1, LAUNCHED, 1));

        let (c2, b2) = (Arc::clone(&cell), Arc::clone(&buffer));
        let owner = thread::spawn(move || {
            assert!(c2.force_advance(LAUNCHED));
            b2.flush(LAUNCHED, LAUNCHED);
        });

        caller.join().unwrap();
        owner.join().unwrap();

        assert_eq!(buffer.delivered.load(Ordering::Relaxed), 2);
    });
}
