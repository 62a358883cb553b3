//! lifegate-core: lifecycle-gated deferred calls
//!
//! An embedded engine boots asynchronously on its own thread while the host
//! keeps issuing calls into it. This crate tracks the engine's lifecycle and
//! parks every call whose target is not reachable yet, replaying parked calls
//! in arrival order as the lifecycle advances.
//!
//! # Architecture
//!
//! ```text
//! host threads ──► Deferred<T> facade ──► DeferredCallBuffer ──► target
//!                                               ▲
//!              EngineLauncher ──► Lifecycle ────┘ (one flush pass per change)
//! ```
//!
//! # Modules
//!
//! - `state`: the ordered lifecycle states
//! - `lifecycle`: state cell, owner thread, transitions, process-wide instance
//! - `buffer`: the ordered deferred-call queue and its flush passes
//! - `facade`: buffering proxies and the `deferred_interface!` macro
//! - `launcher`: engine thread boot sequence and launch arguments
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod facade;
pub mod launcher;
pub mod lifecycle;
pub mod logging;
pub mod state;

pub use buffer::{BufferStats, EVENT_OPERATION, EventSink, FlushReport, PendingEvent, PendingObject};
pub use config::{BufferConfig, Config, LaunchConfig, ProfileSelection};
pub use error::{CallRejected, CallResult, ConfigError, Error, LifecycleError, Result};
pub use facade::{Deferred, FacadeMode};
pub use launcher::{ENGINE_EXITED_EVENT, EngineArgs, EngineBootstrap, EngineLauncher, ReadySignal};
pub use lifecycle::Lifecycle;
pub use state::LifecycleState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
