//! Intercept panics at a task boundary and turn them into values.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    fmt,
    panic::{self, catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Once, PoisonError},
};
use thiserror::Error;

/// Literal used when a payload is neither a `&str` nor a `String`.
const OPAQUE_PAYLOAD: &str = "Box<dyn Any>";

thread_local! {
    /// Number of boundaries the current thread is executing inside of.
    static DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Backtrace recorded by the hook for the most recent panic inside a boundary.
    static TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install a hook that records a backtrace at the panic site while inside a boundary.
///
/// Panics raised outside of any boundary are forwarded to whichever hook was installed
/// before this one.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let inside = DEPTH.try_with(Cell::get).unwrap_or(0) > 0;
            if !inside {
                previous(info);
                return;
            }
            let _ = TRACE.try_with(|trace| {
                *trace.borrow_mut() = Some(Backtrace::force_capture());
            });
        }));
    });
}

/// Marks the current thread as inside a boundary until dropped.
struct Boundary;

impl Boundary {
    fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        TRACE.with(|trace| trace.borrow_mut().take());
        Self
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Render a panic payload the way `panic!` formatted it.
fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        OPAQUE_PAYLOAD.to_string()
    }
}

struct Inner {
    message: String,
    trace: Backtrace,
    payload: Mutex<Box<dyn Any + Send>>,
}

/// A panic recovered at a task boundary.
///
/// Holds the original payload alongside a backtrace captured where the panic was raised.
/// Cloning is cheap: clones share the same recovered fault.
#[derive(Clone, Error)]
#[error("panic: {}", .inner.message)]
pub struct Panic {
    inner: Arc<Inner>,
}

impl Panic {
    fn new(payload: Box<dyn Any + Send>, trace: Backtrace) -> Self {
        Self {
            inner: Arc::new(Inner {
                message: describe(&*payload),
                trace,
                payload: Mutex::new(payload),
            }),
        }
    }

    /// Textual form of the payload (without the `panic: ` prefix).
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Backtrace captured when the panic was raised.
    pub fn trace(&self) -> &Backtrace {
        &self.inner.trace
    }

    /// Returns `true` if the original payload is a `V`.
    pub fn is<V: Any>(&self) -> bool {
        self.payload(|payload| payload.is::<V>())
    }

    /// Returns a copy of the original payload if it is a `V`.
    ///
    /// `panic!("literal")` raises a `&'static str` while formatted panics raise a `String`.
    pub fn fault<V: Any + Clone>(&self) -> Option<V> {
        self.payload(|payload| payload.downcast_ref::<V>().cloned())
    }

    fn payload<R>(&self, f: impl FnOnce(&(dyn Any + Send)) -> R) -> R {
        let payload = self
            .inner
            .payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&**payload)
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Panic")
            .field("message", &self.inner.message)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Panic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Panic {}

/// Run `f` on the calling thread, converting a panic into a [Panic].
///
/// Interception relies on unwinding: when built with `panic = "abort"` the process still
/// terminates at the panic site.
pub fn catch<T, F>(f: F) -> Result<T, Panic>
where
    F: FnOnce() -> T,
{
    install_hook();
    let result = {
        let _boundary = Boundary::enter();
        catch_unwind(AssertUnwindSafe(f))
    };
    result.map_err(|payload| {
        // Fall back to the recovery site if our hook was replaced
        let trace = TRACE
            .with(|trace| trace.borrow_mut().take())
            .unwrap_or_else(Backtrace::force_capture);
        Panic::new(payload, trace)
    })
}

/// Run a fallible operation, returning its own result or the panic it raised.
///
/// If `f` returns normally, its result is returned unchanged. If it panics, the panic is
/// recovered and returned as `E::from(panic)`. This function never panics itself.
pub fn run<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<Panic>,
{
    match catch(f) {
        Ok(result) => result,
        Err(panic) => Err(panic.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    enum TestError {
        #[error("{0}")]
        Internal(String),
        #[error(transparent)]
        Panic(#[from] Panic),
    }

    #[test]
    fn test_run_with_panic() {
        let err = run(|| -> Result<(), TestError> { panic!("internal error") }).unwrap_err();
        assert_eq!(err.to_string(), "panic: internal error");
        let TestError::Panic(panic) = err else {
            panic!("expected a recovered panic");
        };
        assert_eq!(panic.fault::<&str>(), Some("internal error"));
        assert_eq!(panic.message(), "internal error");
        assert!(panic.is::<&str>());
        assert!(!panic.is::<String>());
    }

    #[test]
    fn test_run_with_error() {
        let err = run(|| -> Result<(), TestError> {
            Err(TestError::Internal("internal error".into()))
        })
        .unwrap_err();
        assert_eq!(err, TestError::Internal("internal error".into()));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn test_run_with_success() {
        let result = run(|| -> Result<u32, TestError> { Ok(7) });
        assert_eq!(result, Ok(7));
        let result = run(|| -> Result<(), TestError> { Ok(()) });
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_formatted_payload() {
        let code = 42;
        let panic = catch(|| panic!("code {code}")).unwrap_err();
        assert_eq!(panic.to_string(), "panic: code 42");
        assert_eq!(panic.fault::<String>(), Some("code 42".to_string()));
        assert_eq!(panic.fault::<&str>(), None);
    }

    #[test]
    fn test_opaque_payload() {
        #[derive(Clone, Debug, PartialEq)]
        struct Custom(u8);

        let panic = catch(|| std::panic::panic_any(Custom(3))).unwrap_err();
        assert_eq!(panic.to_string(), "panic: Box<dyn Any>");
        assert_eq!(panic.fault::<Custom>(), Some(Custom(3)));
    }

    #[test]
    fn test_trace_captured() {
        let panic = catch(|| panic!("internal error")).unwrap_err();
        assert_ne!(
            panic.trace().status(),
            std::backtrace::BacktraceStatus::Disabled
        );
    }

    #[test]
    fn test_nested_boundaries() {
        let outer = catch(|| {
            let inner = catch(|| panic!("inner")).unwrap_err();
            assert_eq!(inner.message(), "inner");
            panic!("outer");
        })
        .unwrap_err();
        assert_eq!(outer.message(), "outer");
    }

    #[test]
    fn test_clones_are_equal() {
        let panic = catch(|| panic!("internal error")).unwrap_err();
        let other = catch(|| panic!("internal error")).unwrap_err();
        assert_eq!(panic, panic.clone());
        assert_ne!(panic, other);
    }
}
