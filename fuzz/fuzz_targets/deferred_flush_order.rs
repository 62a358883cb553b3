#![no_main]

use std::sync::Arc;

use lifegate_core::{
    CallRejected, CallResult, EventSink, Lifecycle, LifecycleState, PendingEvent, PendingObject,
    deferred_interface,
};
use libfuzzer_sys::fuzz_target;
use parking_lot::Mutex;

deferred_interface! {
    trait Sampler {
        fn hit(&self, seq: u32);
    }
}

struct Target {
    id: u8,
    ready_at: LifecycleState,
    log: Arc<Mutex<Vec<(u8, u32)>>>,
}

impl PendingObject for Target {
    fn ready_for_calls(&self, state: LifecycleState) -> bool {
        state.is_at_least(self.ready_at)
    }
}

impl Sampler for Target {
    fn hit(&self, seq: u32) -> CallResult {
        // Every seventh call is rejected so fault handling is exercised.
        if seq % 7 == 0 {
            return Err(CallRejected::new("rejected by sampler"));
        }
        self.log.lock().push((self.id, seq));
        Ok(())
    }
}

struct CountingSink(Mutex<Vec<u32>>);

impl EventSink for CountingSink {
    fn notify(&self, event: PendingEvent) -> CallResult {
        self.0
            .lock()
            .push(event.payload.as_u64().unwrap_or_default() as u32);
        Ok(())
    }
}

fn ready_state(byte: u8) -> LifecycleState {
    LifecycleState::from_rank(1 + byte % 4).unwrap_or(LifecycleState::Running)
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let (header, ops) = data.split_at(2);
    let resources = usize::from(header[0] % 4) + 1;

    let lifecycle = Arc::new(Lifecycle::default());
    let sink = Arc::new(CountingSink(Mutex::new(Vec::new())));
    lifecycle.install_event_sink(sink.clone()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let facades: Vec<_> = (0..resources)
        .map(|id| {
            lifecycle.wrap(Target {
                id: id as u8,
                ready_at: ready_state(header[1].rotate_left(id as u32 * 2)),
                log: Arc::clone(&log),
            })
        })
        .collect();

    let mut issued: Vec<Vec<u32>> = vec![Vec::new(); resources];
    let mut events = Vec::new();
    for (seq, op) in ops.iter().enumerate() {
        let seq = seq as u32 + 1;
        match op % 8 {
            0..=4 => {
                let id = usize::from(op / 8) % resources;
                // Direct rejections come back to the caller; parked ones later.
                let _ = facades[id].hit(seq);
                if seq % 7 != 0 {
                    issued[id].push(seq);
                }
            }
            5 => {
                lifecycle
                    .add_pending_event(PendingEvent::new("Fuzz", seq.into()))
                    .unwrap();
                events.push(seq);
            }
            _ => {
                if let Some(next) = lifecycle.current().next() {
                    if next <= LifecycleState::Running {
                        let _ = lifecycle.force_advance(next);
                    }
                }
            }
        }
    }

    // Faults stop a pass; keep flushing until the queue drains.
    let _ = lifecycle.force_advance(LifecycleState::Running);
    while lifecycle.pending_calls() > 0 {
        let _ = lifecycle.flush_pending();
    }

    let log = log.lock();
    for (id, expected) in issued.iter().enumerate() {
        let delivered: Vec<u32> = log
            .iter()
            .filter(|(rid, _)| usize::from(*rid) == id)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(&delivered, expected, "resource {id} order broken");
    }
    assert_eq!(*sink.0.lock(), events);

    let stats = lifecycle.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.cursor, 0);
    assert_eq!(stats.slots, 0);
});
