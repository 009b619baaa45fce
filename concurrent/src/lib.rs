//! Launch fallible computations on any executor and collect their results later.
//!
//! [fetch] submits a producer to an [Executor] and immediately returns a [Future] for its
//! result. The producer runs behind the same panic boundary as [guardrail_safe::run], so a
//! producer that panics completes its future with the recovered [Panic] instead of leaving
//! readers blocked. The producer's error is also returned to the executor, so an aggregating
//! executor like [Group] observes every failure.
//!
//! # Example
//!
//! ```rust
//! use guardrail_concurrent::fetch;
//! use guardrail_safe::{Group, Panic};
//!
//! #[derive(Clone, Debug, thiserror::Error)]
//! enum Error {
//!     #[error(transparent)]
//!     Panic(#[from] Panic),
//! }
//!
//! let group = Group::<Error>::new();
//! let greeting = fetch(&group, || Ok("hello there"));
//! let count = fetch(&group, || Ok(3));
//!
//! // Wait for every fetch before reading results without checking each one
//! group.wait().unwrap();
//! assert_eq!(*greeting.must_get(), "hello there");
//! assert_eq!(*count.must_get(), 3);
//! ```

use guardrail_safe::{run, Group, Panic};

mod future;
pub use future::Future;

/// Anything that can launch a fallible operation in the background.
pub trait Executor<E> {
    /// Launch `f`, typically on another thread.
    fn go<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static;
}

impl<E> Executor<E> for Group<E>
where
    E: From<Panic> + Send + 'static,
{
    fn go<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        Group::go(self, f)
    }
}

/// Submit `producer` to `executor` and return a [Future] of its result without blocking.
///
/// The future completes when the producer returns (or panics). Whatever error the future
/// stores is also returned to the executor.
pub fn fetch<X, T, E, F>(executor: &X, producer: F) -> Future<T, E>
where
    X: Executor<E> + ?Sized,
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + Sync + 'static,
    E: From<Panic> + Clone + Send + Sync + 'static,
{
    let (future, slot) = Future::pending();
    executor.go(move || {
        let result = run(producer);
        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        };
        slot.complete(result);
        outcome
    });
    future
}
