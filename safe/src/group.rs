use crate::{run, Dispatcher, Panic};
use std::sync::{Arc, Condvar, Mutex};

struct State<E> {
    pending: usize,
    error: Option<E>,
}

struct Shared<E> {
    state: Mutex<State<E>>,
    // Notified whenever `pending` drops to zero.
    idle: Condvar,
}

impl<E> Shared<E> {
    fn record(&self, error: E) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }
}

/// Decrements the pending count exactly once, even if recording the result unwinds.
struct Completion<E>(Arc<Shared<E>>);

impl<E> Drop for Completion<E> {
    fn drop(&mut self) {
        let mut state = self
            .0
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.pending -= 1;
        if state.pending == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// A set of fallible operations, each running on its own thread, that can be awaited together.
///
/// Operations that panic are recovered and recorded as `E::from(panic)`. A failure never
/// stops sibling operations: [Group::wait] always waits for every launched operation.
///
/// When several operations fail, the first error recorded wins and the rest are dropped.
///
/// ```rust
/// use guardrail_safe::{Group, Panic};
///
/// #[derive(Debug, thiserror::Error)]
/// enum Error {
///     #[error(transparent)]
///     Panic(#[from] Panic),
/// }
///
/// let group = Group::<Error>::new();
/// group.go(|| Ok(()));
/// group.go(|| panic!("unhandled error"));
/// let err = group.wait().unwrap_err();
/// assert_eq!(err.to_string(), "panic: unhandled error");
/// ```
pub struct Group<E> {
    dispatcher: Dispatcher,
    shared: Arc<Shared<E>>,
}

impl<E> Group<E>
where
    E: From<Panic> + Send + 'static,
{
    /// Create a group that launches operations with [Dispatcher::global].
    pub fn new() -> Self {
        Self::with_dispatcher(Dispatcher::global().clone())
    }

    /// Create a group that launches operations with `dispatcher`.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: 0,
                    error: None,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Launch `f` on a new thread.
    pub fn go<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        self.shared.state.lock().unwrap().pending += 1;

        let completion = Completion(self.shared.clone());
        self.dispatcher.go(move || {
            if let Err(err) = run(f) {
                completion.0.record(err);
            }
            drop(completion);
        });
    }

    /// Block until every launched operation has finished, returning the first recorded error.
    pub fn wait(self) -> Result<(), E> {
        let mut state = self.shared.state.lock().unwrap();
        while state.pending > 0 {
            state = self.shared.idle.wait(state).unwrap();
        }
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<E> Default for Group<E>
where
    E: From<Panic> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::Capture;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("{0}")]
        Internal(&'static str),
        #[error(transparent)]
        Panic(#[from] Panic),
    }

    #[test]
    fn test_group_records_panic() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        group.go(|| Ok(()));
        group.go(|| panic!("internal error"));

        let err = group.wait().unwrap_err();
        assert_eq!(err.to_string(), "panic: internal error");
        let TestError::Panic(panic) = err else {
            panic!("expected a recovered panic");
        };
        assert_eq!(panic.fault::<&str>(), Some("internal error"));
    }

    #[test]
    fn test_group_success() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let completed = completed.clone();
            group.go(move || {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert!(group.wait().is_ok());
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_group_empty() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        assert!(group.wait().is_ok());
    }

    #[test]
    fn test_group_returns_operation_error() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        group.go(|| Err(TestError::Internal("boom")));
        assert!(matches!(group.wait(), Err(TestError::Internal("boom"))));
    }

    #[test]
    fn test_group_first_error_wins() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        let (tx, rx) = mpsc::channel::<()>();
        group.go(|| Err(TestError::Internal("first")));

        // The second failure is held back until long after the first was recorded
        group.go(move || {
            let _ = rx.recv();
            Err(TestError::Internal("second"))
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(tx);

        assert!(matches!(group.wait(), Err(TestError::Internal("first"))));
    }

    #[test]
    fn test_failure_does_not_abort_siblings() {
        let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
        let (tx, rx) = mpsc::channel();
        group.go(|| panic!("internal error"));
        group.go(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(()).unwrap();
            Ok(())
        });
        assert!(group.wait().is_err());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_group_panics_are_not_logged() {
        let logs = Capture::default();
        logs.scope(|| {
            let group = Group::<TestError>::with_dispatcher(Dispatcher::new());
            group.go(|| panic!("internal error"));
            assert!(group.wait().is_err());
        });
        assert!(logs.contents().is_empty());
    }
}
