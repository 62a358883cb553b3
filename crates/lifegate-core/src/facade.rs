//! Buffering facades over lifecycle-gated resources.
//!
//! A capability is a trait whose operations return nothing but a
//! [`CallResult`]. Declare it with [`deferred_interface!`], implement it on
//! the real resource, and hand the resource to [`Lifecycle::wrap`]. The
//! returned [`Deferred`] implements the same trait: calls go straight through
//! once the resource is ready and nothing is queued ahead, and are parked in
//! the lifecycle's buffer otherwise.
//!
//! ```ignore
//! lifegate_core::deferred_interface! {
//!     pub trait Compositor {
//!         fn resize(&self, width: u32, height: u32);
//!         fn attach(&self, surface: u64);
//!     }
//! }
//!
//! struct NativeCompositor { /* engine handles */ }
//!
//! impl PendingObject for NativeCompositor {
//!     fn ready_for_calls(&self, state: LifecycleState) -> bool {
//!         state.is_at_least(LifecycleState::LibsReady)
//!     }
//! }
//!
//! impl Compositor for NativeCompositor { /* ... */ }
//!
//! let compositor = lifecycle.wrap(NativeCompositor::new());
//! compositor.resize(800, 600)?; // parked until LibsReady
//! ```
//!
//! [`Lifecycle::wrap`] takes the resource by value and the facade never hands
//! it out, so the capability trait is the only way in and nothing can
//! overtake a parked call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::buffer::{Dispatched, PendingObject};
use crate::error::CallResult;
use crate::lifecycle::Lifecycle;

/// How a facade currently handles calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacadeMode {
    /// Calls are checked against the buffer and parked if needed.
    Buffering,
    /// The resource is ready and nothing was queued ahead; calls go straight through.
    PassThrough,
}

/// Buffering proxy for a lifecycle-gated resource.
///
/// Starts in [`FacadeMode::Buffering`] unless the resource was already
/// callable when wrapped, and switches to [`FacadeMode::PassThrough`] exactly
/// once, the first time a call finds the buffer empty and the resource ready.
pub struct Deferred<T: PendingObject> {
    resource: Arc<T>,
    lifecycle: Arc<Lifecycle>,
    steady: AtomicBool,
}

impl<T: PendingObject> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("resource", &std::any::type_name::<T>())
            .field("mode", &self.mode())
            .finish()
    }
}

impl Lifecycle {
    /// Wrap `resource` in a buffering facade bound to this lifecycle.
    ///
    /// If the buffer is empty and the resource is already ready, the facade
    /// starts in pass-through mode and adds no overhead.
    pub fn wrap<T: PendingObject>(self: &Arc<Self>, resource: T) -> Deferred<T> {
        let resource = Arc::new(resource);
        let steady = self.admits_direct(resource.as_ref());
        trace!(
            resource = std::any::type_name::<T>(),
            steady,
            state = %self.current(),
            "wrapped pending object"
        );
        Deferred {
            resource,
            lifecycle: Arc::clone(self),
            steady: AtomicBool::new(steady),
        }
    }
}

impl<T: PendingObject> Deferred<T> {
    /// Current interception mode.
    pub fn mode(&self) -> FacadeMode {
        if self.steady.load(Ordering::Acquire) {
            FacadeMode::PassThrough
        } else {
            FacadeMode::Buffering
        }
    }

    /// Lifecycle this facade parks its calls in.
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Route one capability operation through the facade.
    ///
    /// `call` receives the wrapped resource. Its result is returned when the
    /// call runs immediately; a parked call returns `Ok(())` and any later
    /// rejection surfaces from the flush pass that delivers it.
    ///
    /// Generated capability impls call this; hand-written ones may too.
    pub fn invoke<F>(&self, operation: &'static str, call: F) -> CallResult
    where
        F: FnOnce(&T) -> CallResult + Send + 'static,
    {
        if self.steady.load(Ordering::Acquire) {
            return call(&self.resource);
        }

        let resource = Arc::clone(&self.resource);
        let target: Arc<dyn PendingObject> = Arc::clone(&self.resource) as Arc<dyn PendingObject>;
        match self
            .lifecycle
            .dispatch(target, operation, move || call(&resource))
        {
            Dispatched::Delivered(result) => {
                if !self.steady.swap(true, Ordering::AcqRel) {
                    trace!(
                        resource = std::any::type_name::<T>(),
                        operation,
                        "pending object reached pass-through"
                    );
                }
                result
            }
            Dispatched::Buffered => Ok(()),
        }
    }
}

/// Declare a capability trait and its buffering forwarder for [`Deferred`].
///
/// Operations take `&self` plus owned arguments and must not declare a
/// return type: the macro gives each one [`CallResult`], since a parked call
/// has nobody to return a value to. Arguments are moved into the parked call
/// and therefore must be `Send + 'static`.
///
/// ```ignore
/// lifegate_core::deferred_interface! {
///     /// Surface lifecycle notifications for the engine.
///     pub trait SurfaceListener {
///         fn surface_changed(&self, surface: u64, width: u32, height: u32);
///         fn surface_destroyed(&self);
///     }
/// }
/// ```
#[macro_export]
macro_rules! deferred_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident(&self $(, $arg:ident : $arg_ty:ty)*);
            )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $name: ::std::marker::Send + ::std::marker::Sync + 'static {
            $(
                $(#[$method_meta])*
                fn $method(&self $(, $arg: $arg_ty)*) -> $crate::CallResult;
            )*
        }

        impl<T> $name for $crate::Deferred<T>
        where
            T: $name + $crate::PendingObject,
        {
            $(
                fn $method(&self $(, $arg: $arg_ty)*) -> $crate::CallResult {
                    self.invoke(
                        ::std::stringify!($method),
                        move |target: &T| target.$method($($arg),*),
                    )
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallRejected, Error};
    use crate::state::LifecycleState;
    use parking_lot::Mutex;

    crate::deferred_interface! {
        /// Test capability.
        trait Viewport {
            fn resize(&self, width: u32, height: u32);
            fn set_title(&self, title: String);
            fn reset(&self);
        }
    }

    type Calls = Arc<Mutex<Vec<String>>>;

    struct NativeViewport {
        ready_at: LifecycleState,
        calls: Calls,
    }

    impl NativeViewport {
        fn new(ready_at: LifecycleState) -> Self {
            Self::recording(ready_at, &Calls::default())
        }

        fn recording(ready_at: LifecycleState, calls: &Calls) -> Self {
            Self {
                ready_at,
                calls: Arc::clone(calls),
            }
        }
    }

    impl PendingObject for NativeViewport {
        fn ready_for_calls(&self, state: LifecycleState) -> bool {
            state.is_at_least(self.ready_at)
        }
    }

    impl Viewport for NativeViewport {
        fn resize(&self, width: u32, height: u32) -> CallResult {
            if width == 0 || height == 0 {
                return Err(CallRejected::new("empty viewport"));
            }
            self.calls.lock().push(format!("resize {width}x{height}"));
            Ok(())
        }

        fn set_title(&self, title: String) -> CallResult {
            self.calls.lock().push(format!("title {title}"));
            Ok(())
        }

        fn reset(&self) -> CallResult {
            self.calls.lock().push("reset".to_string());
            Ok(())
        }
    }

    #[test]
    fn wrap_ready_resource_starts_in_pass_through() {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.force_advance(LifecycleState::Running).unwrap();
        let calls = Calls::default();
        let viewport = lifecycle.wrap(NativeViewport::recording(LifecycleState::LibsReady, &calls));
        assert_eq!(viewport.mode(), FacadeMode::PassThrough);

        viewport.resize(10, 20).unwrap();
        assert_eq!(*calls.lock(), vec!["resize 10x20"]);
        assert_eq!(lifecycle.stats().buffered_total, 0);
    }

    #[test]
    fn calls_park_then_replay_in_order() {
        let lifecycle = Arc::new(Lifecycle::default());
        let calls = Calls::default();
        let viewport = lifecycle.wrap(NativeViewport::recording(LifecycleState::LibsReady, &calls));
        assert_eq!(viewport.mode(), FacadeMode::Buffering);

        viewport.set_title("home".to_string()).unwrap();
        viewport.resize(800, 600).unwrap();
        viewport.reset().unwrap();
        assert!(calls.lock().is_empty());
        assert_eq!(lifecycle.pending_calls(), 3);

        lifecycle.force_advance(LifecycleState::GlueReady).unwrap();
        assert!(calls.lock().is_empty());

        let report = lifecycle.force_advance(LifecycleState::LibsReady).unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(*calls.lock(), vec!["title home", "resize 800x600", "reset"]);

        // The facade learns it can go direct on its next call.
        assert_eq!(viewport.mode(), FacadeMode::Buffering);
        viewport.resize(1, 1).unwrap();
        assert_eq!(viewport.mode(), FacadeMode::PassThrough);
        assert_eq!(calls.lock().last().map(String::as_str), Some("resize 1x1"));
    }

    #[test]
    fn direct_call_returns_rejection_to_caller() {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.force_advance(LifecycleState::LibsReady).unwrap();
        let viewport = lifecycle.wrap(NativeViewport::new(LifecycleState::LibsReady));
        let err = viewport.resize(0, 10).unwrap_err();
        assert_eq!(err.reason(), "empty viewport");
    }

    #[test]
    fn parked_rejection_surfaces_from_flush() {
        let lifecycle = Arc::new(Lifecycle::default());
        let viewport = lifecycle.wrap(NativeViewport::new(LifecycleState::Launched));
        viewport.resize(0, 0).unwrap();

        let err = lifecycle
            .force_advance(LifecycleState::Launched)
            .unwrap_err();
        assert!(
            matches!(err, Error::Delivery { operation: "resize", .. }),
            "got: {err}"
        );
        assert_eq!(lifecycle.pending_calls(), 0);
    }

    #[test]
    fn facade_debug_names_resource() {
        let lifecycle = Arc::new(Lifecycle::default());
        let viewport = lifecycle.wrap(NativeViewport::new(LifecycleState::Launched));
        let rendered = format!("{viewport:?}");
        assert!(rendered.contains("NativeViewport"), "got: {rendered}");
        assert!(rendered.contains("Buffering"), "got: {rendered}");
    }
}
