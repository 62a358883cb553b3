//! Ranked engine lifecycle states.
//!
//! The engine moves through these states exactly once each, in rank order:
//!
//! ```text
//! Initial → Launched → GlueReady → LibsReady → Running → Exiting → Exited
//! ```
//!
//! Readiness predicates and lifecycle-gated callers compare against these
//! states with [`LifecycleState::is_at_least`] and friends rather than
//! matching on variants, so inserting a stage later keeps them correct.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Engine readiness stage, totally ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    /// Process started, engine thread not launched yet.
    Initial = 0,
    /// Engine thread launched.
    Launched = 1,
    /// Runtime glue library loaded.
    GlueReady = 2,
    /// Engine libraries loaded; native entry points are callable.
    LibsReady = 3,
    /// Engine front end initialized and running its event loop.
    Running = 4,
    /// Engine event loop has returned.
    Exiting = 5,
    /// Engine thread finished.
    Exited = 6,
}

/// Lowest ranked state.
pub const MIN_STATE: LifecycleState = LifecycleState::Initial;
/// Highest ranked state.
pub const MAX_STATE: LifecycleState = LifecycleState::Exited;

impl LifecycleState {
    /// All states in rank order.
    pub const ALL: [Self; 7] = [
        Self::Initial,
        Self::Launched,
        Self::GlueReady,
        Self::LibsReady,
        Self::Running,
        Self::Exiting,
        Self::Exited,
    ];

    /// Rank of this state; `Initial` is zero.
    #[must_use]
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// State with the given rank, if any.
    #[must_use]
    pub const fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::Initial),
            1 => Some(Self::Launched),
            2 => Some(Self::GlueReady),
            3 => Some(Self::LibsReady),
            4 => Some(Self::Running),
            5 => Some(Self::Exiting),
            6 => Some(Self::Exited),
            _ => None,
        }
    }

    /// Exactly this state.
    #[must_use]
    pub const fn is(self, other: Self) -> bool {
        self.rank() == other.rank()
    }

    /// This state or any later one.
    #[must_use]
    pub const fn is_at_least(self, other: Self) -> bool {
        self.rank() >= other.rank()
    }

    /// This state or any earlier one.
    #[must_use]
    pub const fn is_at_most(self, other: Self) -> bool {
        self.rank() <= other.rank()
    }

    /// Inclusive range check.
    #[must_use]
    pub const fn is_between(self, min: Self, max: Self) -> bool {
        self.rank() >= min.rank() && self.rank() <= max.rank()
    }

    /// Next state in rank order, `None` at [`MAX_STATE`].
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::from_rank(self.rank() + 1)
    }

    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Launched => "launched",
            Self::GlueReady => "glue_ready",
            Self::LibsReady => "libs_ready",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Exited => "exited",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown lifecycle state: {s}"))
    }
}

/// Atomic cell holding the current [`LifecycleState`].
///
/// Reads never block. Writes are either a compare-and-swap or an
/// unconditional store; monotonicity is enforced by the caller
/// ([`Lifecycle`](crate::lifecycle::Lifecycle)).
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) const fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state.rank()))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        decode(self.0.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn store(&self, state: LifecycleState) {
        self.0.store(state.rank(), Ordering::Release);
    }

    /// Swap `from` for `to`; on failure returns the state actually observed.
    pub(crate) fn compare_exchange(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleState> {
        self.0
            .compare_exchange(from.rank(), to.rank(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(decode)
    }
}

// Only ranks produced by `LifecycleState::rank` are ever stored.
fn decode(rank: u8) -> LifecycleState {
    LifecycleState::from_rank(rank).unwrap_or(MAX_STATE)
}
