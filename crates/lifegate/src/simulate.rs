//! `lg simulate`: boot a scripted engine and record every delivery.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use lifegate_core::{
    BufferStats, CallResult, Config, Deferred, EngineArgs, EngineBootstrap, EngineLauncher,
    EventSink, Lifecycle, LifecycleState, PendingEvent, PendingObject, ReadySignal,
    deferred_interface,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Compositor calls issued before launch
    #[arg(long, default_value_t = 3)]
    calls: u32,

    /// Events queued before launch
    #[arg(long, default_value_t = 2)]
    events: u32,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

deferred_interface! {
    /// Compositor exposed by the simulated engine.
    trait Compositor {
        fn resize(&self, width: u32, height: u32);
        fn present(&self, frame: u32);
    }
}

#[derive(Debug, Clone, Serialize)]
struct Delivery {
    target: &'static str,
    detail: String,
    state: LifecycleState,
    thread: String,
}

#[derive(Default)]
struct DeliveryLog(Mutex<Vec<Delivery>>);

impl DeliveryLog {
    fn record(&self, lifecycle: &Lifecycle, target: &'static str, detail: String) {
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.0.lock().push(Delivery {
            target,
            detail,
            state: lifecycle.current(),
            thread,
        });
    }

    fn snapshot(&self) -> Vec<Delivery> {
        self.0.lock().clone()
    }
}

/// Compositor that only becomes reachable once engine libraries are loaded.
struct DemoCompositor {
    lifecycle: Arc<Lifecycle>,
    log: Arc<DeliveryLog>,
}

impl PendingObject for DemoCompositor {
    fn ready_for_calls(&self, state: LifecycleState) -> bool {
        state.is_at_least(LifecycleState::LibsReady)
    }
}

impl Compositor for DemoCompositor {
    fn resize(&self, width: u32, height: u32) -> CallResult {
        self.log
            .record(&self.lifecycle, "compositor", format!("resize {width}x{height}"));
        Ok(())
    }

    fn present(&self, frame: u32) -> CallResult {
        self.log
            .record(&self.lifecycle, "compositor", format!("present frame {frame}"));
        Ok(())
    }
}

struct RecordingSink {
    lifecycle: Arc<Lifecycle>,
    log: Arc<DeliveryLog>,
}

impl EventSink for RecordingSink {
    fn notify(&self, event: PendingEvent) -> CallResult {
        self.log.record(
            &self.lifecycle,
            "event",
            format!("{} {}", event.kind, event.payload),
        );
        Ok(())
    }
}

struct SimulatedEngine {
    compositor: Arc<Deferred<DemoCompositor>>,
    command_line: Arc<Mutex<Option<String>>>,
}

impl EngineBootstrap for SimulatedEngine {
    fn load_glue(&mut self) -> lifegate_core::Result<()> {
        Ok(())
    }

    fn load_libraries(&mut self) -> lifegate_core::Result<()> {
        Ok(())
    }

    fn run(&mut self, args: &EngineArgs, ready: ReadySignal) -> lifegate_core::Result<()> {
        *self.command_line.lock() = Some(args.command_line.trim().to_string());
        self.compositor
            .present(1)
            .map_err(|source| lifegate_core::Error::Delivery {
                operation: "present",
                source,
            })?;
        ready.mark_ready()
    }
}

#[derive(Serialize)]
struct SimulationReport {
    command_line: Option<String>,
    final_state: LifecycleState,
    deliveries: Vec<Delivery>,
    stats: BufferStats,
}

pub fn run(args: &SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    let lifecycle = Lifecycle::init_global(config.buffer.clone());
    let log = Arc::new(DeliveryLog::default());
    lifecycle.install_event_sink(Arc::new(RecordingSink {
        lifecycle: Arc::clone(&lifecycle),
        log: Arc::clone(&log),
    }))?;

    let compositor = Arc::new(lifecycle.wrap(DemoCompositor {
        lifecycle: Arc::clone(&lifecycle),
        log: Arc::clone(&log),
    }));

    for i in 0..args.calls {
        compositor.resize(640 + i * 16, 480 + i * 9)?;
    }
    for tick in 0..args.events {
        lifecycle.add_pending_event(PendingEvent::new("Demo:Tick", json!({ "tick": tick })))?;
    }
    info!(
        pending = lifecycle.pending_calls(),
        "work queued before launch"
    );

    let command_line = Arc::new(Mutex::new(None));
    let engine = SimulatedEngine {
        compositor: Arc::clone(&compositor),
        command_line: Arc::clone(&command_line),
    };
    let launcher = EngineLauncher::new(Arc::clone(&lifecycle));
    if !launcher.ensure_init(config.launch.clone(), engine) {
        bail!("engine was already initialized");
    }
    launcher.launch()?;
    launcher.join().context("simulated engine failed")?;

    let report = SimulationReport {
        command_line: command_line.lock().clone(),
        final_state: lifecycle.current(),
        deliveries: log.snapshot(),
        stats: lifecycle.stats(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!(
        "engine command line: {}",
        report.command_line.as_deref().unwrap_or("<not started>")
    );
    println!("final state: {}", report.final_state);
    println!("deliveries:");
    for delivery in &report.deliveries {
        println!(
            "  [{:<10}] {:<10} {} ({})",
            delivery.state.as_str(),
            delivery.target,
            delivery.detail,
            delivery.thread
        );
    }
    let stats = &report.stats;
    println!(
        "buffer: buffered={} delivered={} faults={} flush_passes={} compactions={} pending={}",
        stats.buffered_total,
        stats.delivered_total,
        stats.faults_total,
        stats.flush_passes,
        stats.compactions,
        stats.pending
    );
}
