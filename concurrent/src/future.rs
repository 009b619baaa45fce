use std::{
    fmt,
    panic::panic_any,
    sync::{Arc, Condvar, Mutex, OnceLock},
};

/// Result written once by a producer and read by any number of handles.
pub(crate) struct Slot<T, E> {
    result: OnceLock<Result<T, E>>,
    // Held while publishing so a reader cannot check and then miss the notification.
    gate: Mutex<()>,
    ready: Condvar,
}

impl<T, E> Slot<T, E> {
    fn new() -> Self {
        Self {
            result: OnceLock::new(),
            gate: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Publish the result and wake every waiting reader.
    ///
    /// Only the first call has any effect.
    pub(crate) fn complete(&self, result: Result<T, E>) {
        let _gate = self.gate.lock().unwrap();
        let _ = self.result.set(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> &Result<T, E> {
        if let Some(result) = self.result.get() {
            return result;
        }
        let mut gate = self.gate.lock().unwrap();
        loop {
            if let Some(result) = self.result.get() {
                return result;
            }
            gate = self.ready.wait(gate).unwrap();
        }
    }
}

/// A value that will be produced by a task submitted to an executor.
///
/// Created by [crate::fetch]. The value and error are published together, exactly once, so a
/// reader never observes a partially written result. Clones refer to the same result and may be
/// handed to other threads.
///
/// If the executor never runs the producer, the future stays pending forever.
pub struct Future<T, E> {
    slot: Arc<Slot<T, E>>,
}

impl<T, E> Future<T, E> {
    pub(crate) fn pending() -> (Self, Arc<Slot<T, E>>) {
        let slot = Arc::new(Slot::new());
        (Self { slot: slot.clone() }, slot)
    }

    /// Block until the producer finished and return its result.
    pub fn get(&self) -> Result<&T, &E> {
        self.slot.wait().as_ref()
    }

    /// Return the result if the producer already finished, without blocking.
    pub fn try_get(&self) -> Option<Result<&T, &E>> {
        self.slot.result.get().map(Result::as_ref)
    }

    /// Returns `true` once the producer finished.
    pub fn is_ready(&self) -> bool {
        self.slot.result.get().is_some()
    }

    /// Like [Future::get] but panics if the producer failed.
    ///
    /// The panic payload is a clone of the stored error. Intended for use after the executor
    /// has already reported that every task succeeded (for example, after
    /// `guardrail_safe::Group::wait` returned `Ok`).
    pub fn must_get(&self) -> &T
    where
        E: Clone + Send + 'static,
    {
        match self.get() {
            Ok(value) => value,
            Err(err) => panic_any(err.clone()),
        }
    }
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_get() {
            Some(result) => f.debug_tuple("Future").field(&result).finish(),
            None => f.write_str("Future(<pending>)"),
        }
    }
}
