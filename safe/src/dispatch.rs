//! Launch operations on background threads without letting a panic go unreported.

use crate::{catch, Panic};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    sync::{Arc, OnceLock, RwLock},
    thread::{self, JoinHandle},
};
use tracing::{debug, error};

/// Callback invoked with every panic recovered on a dispatched thread.
pub type Handler = Arc<dyn Fn(Panic) + Send + Sync>;

static GLOBAL: OnceLock<Dispatcher> = OnceLock::new();

#[derive(Default)]
struct Metrics {
    tasks_spawned: Counter,
    tasks_running: Gauge,
    tasks_panicked: Counter,
}

/// Spawns operations on dedicated threads and reports any panic they raise.
///
/// A recovered panic is passed to the registered [Handler] or, if none is registered, logged
/// at the `ERROR` level along with its backtrace. A panic raised by the handler itself is
/// logged and dropped (it is never handed to a handler again).
///
/// Clones share the same handler and metrics. The handler is meant to be configured once at
/// startup: replacing it while panics are being reported is safe, but which handler observes
/// a concurrent panic is unspecified.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handler: Arc<RwLock<Option<Handler>>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Create a dispatcher with no handler registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide dispatcher used by [go] and [crate::Group::new].
    pub fn global() -> &'static Dispatcher {
        GLOBAL.get_or_init(Dispatcher::new)
    }

    /// Replace the handler (the last one set wins).
    pub fn set_handler<H>(&self, handler: H)
    where
        H: Fn(Panic) + Send + Sync + 'static,
    {
        *self.handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Remove the handler, restoring the logging fallback.
    pub fn clear_handler(&self) {
        *self.handler.write().unwrap() = None;
    }

    /// Register task metrics with the provided registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            self.metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            self.metrics.tasks_running.clone(),
        );
        registry.register(
            "tasks_panicked",
            "Total number of tasks that panicked",
            self.metrics.tasks_panicked.clone(),
        );
    }

    /// Run `f` on a new thread.
    ///
    /// The caller's `tracing` subscriber is used on the spawned thread. Joining the returned
    /// handle waits for both `f` and any panic reporting to finish; it never yields an error.
    pub fn go<F>(&self, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.metrics.tasks_spawned.inc();
        self.metrics.tasks_running.inc();

        let dispatcher = self.clone();
        let subscriber = tracing::dispatcher::get_default(|current| current.clone());
        thread::spawn(move || {
            tracing::dispatcher::with_default(&subscriber, || {
                if let Err(panic) = catch(f) {
                    dispatcher.report(panic);
                }
                dispatcher.metrics.tasks_running.dec();
            })
        })
    }

    fn handler(&self) -> Option<Handler> {
        self.handler.read().unwrap().clone()
    }

    fn report(&self, panic: Panic) {
        self.metrics.tasks_panicked.inc();

        let Some(handler) = self.handler() else {
            error!("{panic}\n{}", panic.trace());
            return;
        };
        debug!(%panic, "invoking panic handler");
        let original = panic.clone();
        if let Err(secondary) = catch(move || handler(panic)) {
            error!(
                "panic in panic handler: {secondary}\n{}\noriginal {original}",
                secondary.trace()
            );
        }
    }
}

/// Run `f` on a new thread using the [Dispatcher::global] dispatcher.
pub fn go<F>(f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    Dispatcher::global().go(f)
}

/// Set the handler of the [Dispatcher::global] dispatcher.
pub fn set_panic_handler<H>(handler: H)
where
    H: Fn(Panic) + Send + Sync + 'static,
{
    Dispatcher::global().set_handler(handler);
}

/// Clear the handler of the [Dispatcher::global] dispatcher.
pub fn clear_panic_handler() {
    Dispatcher::global().clear_handler();
}
