//! Engine thread launcher.
//!
//! Drives a [`Lifecycle`] through the boot sequence of an embedded engine on
//! a dedicated, named thread:
//!
//! ```text
//! launch()        Initial   -> Launched   (any thread, CAS)
//! load_glue()               -> GlueReady  (engine thread)
//! load_libraries()          -> LibsReady
//! run(.., ready)            -> Running    when the engine calls ready.mark_ready()
//! run() returns             -> Exiting
//! shutdown()                -> Exited     then Engine:Exited to the event sink
//! ```
//!
//! Each step is one `force_advance` by the engine thread, so calls parked on
//! the lifecycle are replayed as soon as their targets become reachable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffer::{FlushReport, PendingEvent, panic_message};
use crate::config::{LaunchConfig, ProfileSelection};
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::state::LifecycleState;

/// Launch action of a home-screen shortcut.
pub const HOMESCREEN_SHORTCUT_ACTION: &str = "org.lifegate.HOMESCREEN_SHORTCUT";

/// Launch type passed to the engine for home-screen shortcuts.
pub const BOOKMARK_LAUNCH_TYPE: &str = "-bookmark";

/// Engine argument selecting guest browsing.
pub const GUEST_ARG: &str = "--guest";

/// Event sent straight to the event sink once the engine thread has exited.
pub const ENGINE_EXITED_EVENT: &str = "Engine:Exited";

/// Arguments handed to [`EngineBootstrap::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArgs {
    /// User arguments plus profile selection
    pub command_line: String,
    /// URI to open on startup
    pub uri: Option<String>,
    /// Launch type derived from the launch action
    pub launch_type: Option<&'static str>,
}

impl EngineArgs {
    /// Compose engine arguments from launch configuration.
    #[must_use]
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            command_line: compose_command_line(config.args.as_deref(), &config.profile),
            uri: config.uri.clone(),
            launch_type: launch_type(config.action.as_deref()),
        }
    }
}

/// Append the profile arguments for `profile` to the user's `args`.
#[must_use]
pub fn compose_command_line(args: Option<&str>, profile: &ProfileSelection) -> String {
    let mut line = args.unwrap_or_default().to_string();
    match profile {
        ProfileSelection::Guest { dir } => {
            line.push_str(" -profile ");
            line.push_str(&dir.display().to_string());
            if !args.is_some_and(|args| args.contains(GUEST_ARG)) {
                line.push(' ');
                line.push_str(GUEST_ARG);
            }
        }
        ProfileSelection::Default { name } => {
            line.push_str(" -P ");
            line.push_str(name);
        }
        ProfileSelection::Custom => {}
    }
    line
}

/// Launch type for a launch `action`, if it has one.
#[must_use]
pub fn launch_type(action: Option<&str>) -> Option<&'static str> {
    match action {
        Some(HOMESCREEN_SHORTCUT_ACTION) => Some(BOOKMARK_LAUNCH_TYPE),
        _ => None,
    }
}

/// Stages of an engine boot, run in order on the engine thread.
pub trait EngineBootstrap: Send + 'static {
    /// Load the glue layer the rest of the engine links against.
    fn load_glue(&mut self) -> Result<()>;

    /// Load the engine libraries.
    fn load_libraries(&mut self) -> Result<()>;

    /// Run the engine until it exits. Call [`ReadySignal::mark_ready`] once
    /// the engine can take events.
    fn run(&mut self, args: &EngineArgs, ready: ReadySignal) -> Result<()>;

    /// Release engine resources after `run` returns or a stage fails.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle the running engine uses to report that it is ready for events.
pub struct ReadySignal {
    lifecycle: Arc<Lifecycle>,
}

impl std::fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadySignal")
            .field("state", &self.lifecycle.current())
            .finish()
    }
}

impl ReadySignal {
    /// Advance the lifecycle to `Running`, releasing parked events.
    ///
    /// Must be called from the engine thread. Rejections from parked calls
    /// are logged, not returned.
    pub fn mark_ready(&self) -> Result<()> {
        advance(&self.lifecycle, LifecycleState::Running)
    }

    /// Lifecycle being driven.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }
}

/// Advance to `to`, logging delivery faults from the flush pass.
fn advance(lifecycle: &Lifecycle, to: LifecycleState) -> Result<()> {
    settle(lifecycle, lifecycle.force_advance(to))
}

/// Resume a flush pass cut short by delivery faults until it completes.
///
/// Each fault consumes its entry, so this ends once the entries behind the
/// faulting ones have been delivered or are waiting on a later state.
fn settle(lifecycle: &Lifecycle, mut outcome: Result<FlushReport>) -> Result<()> {
    loop {
        match outcome {
            Ok(report) => {
                debug!(
                    state = %report.state,
                    delivered = report.delivered,
                    remaining = report.remaining,
                    "engine stage reached"
                );
                return Ok(());
            }
            Err(err) if err.is_delivery_fault() => {
                warn!(
                    state = %lifecycle.current(),
                    error = %err,
                    "parked call failed during engine boot"
                );
                outcome = lifecycle.flush_pending();
            }
            Err(err) => return Err(err),
        }
    }
}

struct PreparedLaunch {
    config: LaunchConfig,
    bootstrap: Box<dyn EngineBootstrap>,
}

/// Starts the engine thread once and tracks it until it exits.
pub struct EngineLauncher {
    lifecycle: Arc<Lifecycle>,
    initialized: AtomicBool,
    prepared: Mutex<Option<PreparedLaunch>>,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for EngineLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLauncher")
            .field("state", &self.lifecycle.current())
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .field("thread_alive", &self.handle.lock().is_some())
            .finish()
    }
}

impl EngineLauncher {
    /// Launcher driving `lifecycle`.
    #[must_use]
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            lifecycle,
            initialized: AtomicBool::new(false),
            prepared: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Lifecycle being driven.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Record what to launch.
    ///
    /// Only the first call while the lifecycle is still `Initial` takes
    /// effect; every other call returns `false` and drops `bootstrap`.
    pub fn ensure_init(&self, config: LaunchConfig, bootstrap: impl EngineBootstrap) -> bool {
        if !self.lifecycle.is(LifecycleState::Initial) {
            return false;
        }
        let mut prepared = self.prepared.lock();
        if self.initialized.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(thread_name = %config.thread_name, "engine launch prepared");
        *prepared = Some(PreparedLaunch {
            config,
            bootstrap: Box::new(bootstrap),
        });
        true
    }

    /// Start the engine thread.
    ///
    /// Returns `Ok(false)` if the engine was already launched.
    pub fn launch(&self) -> Result<bool> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::Launch(
                "launch requested before ensure_init".to_string(),
            ));
        }
        match self
            .lifecycle
            .transition(LifecycleState::Initial, LifecycleState::Launched)
        {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) if err.is_delivery_fault() => settle(&self.lifecycle, Err(err))?,
            Err(err) => return Err(err),
        }

        let PreparedLaunch { config, bootstrap } = self
            .prepared
            .lock()
            .take()
            .ok_or_else(|| Error::Launch("engine launch was already consumed".to_string()))?;

        let lifecycle = Arc::clone(&self.lifecycle);
        let handle = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_engine(&lifecycle, &config, bootstrap))
            .map_err(|err| Error::Launch(format!("failed to spawn engine thread: {err}")))?;
        *self.handle.lock() = Some(handle);
        info!("engine thread launched");
        Ok(true)
    }

    /// Wait for the engine thread to finish and return its outcome.
    ///
    /// Returns `Ok(())` immediately if there is no thread to wait for.
    pub fn join(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|payload| {
            Error::Launch(format!(
                "engine thread panicked: {}",
                panic_message(&*payload)
            ))
        })?
    }

    pub fn is_launched(&self) -> bool {
        self.lifecycle.is_launched()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

fn run_engine(
    lifecycle: &Arc<Lifecycle>,
    config: &LaunchConfig,
    mut bootstrap: Box<dyn EngineBootstrap>,
) -> Result<()> {
    lifecycle.bind_owner()?;

    if config.debugging {
        info!(wait_ms = config.debug_wait_ms, "waiting for debugger");
        std::thread::sleep(config.debug_wait());
    }

    let args = EngineArgs::from_config(config);
    let outcome = boot(lifecycle, &args, bootstrap.as_mut());
    if let Err(err) = &outcome {
        error!(state = %lifecycle.current(), error = %err, "engine stage failed");
    }

    let exiting = advance(lifecycle, LifecycleState::Exiting);
    let shutdown = bootstrap.shutdown();
    if let Err(err) = &shutdown {
        error!(error = %err, "engine shutdown failed");
    }
    let exited = advance(lifecycle, LifecycleState::Exited);
    info!(ok = outcome.is_ok(), "engine thread exited");
    // Events are parked past Running, so this one bypasses the buffer.
    match lifecycle.notify_now(PendingEvent::bare(ENGINE_EXITED_EVENT)) {
        Ok(sent) => debug!(sent, "exit notification"),
        Err(err) => warn!(error = %err, "exit notification rejected"),
    }

    outcome.and(exiting).and(shutdown).and(exited)
}

fn boot(
    lifecycle: &Arc<Lifecycle>,
    args: &EngineArgs,
    bootstrap: &mut dyn EngineBootstrap,
) -> Result<()> {
    bootstrap.load_glue()?;
    advance(lifecycle, LifecycleState::GlueReady)?;
    bootstrap.load_libraries()?;
    advance(lifecycle, LifecycleState::LibsReady)?;

    debug!(
        command_line = %args.command_line,
        uri = ?args.uri,
        launch_type = ?args.launch_type,
        "running engine"
    );
    bootstrap.run(
        args,
        ReadySignal {
            lifecycle: Arc::clone(lifecycle),
        },
    )
}
