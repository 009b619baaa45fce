//! Run background work behind a panic boundary and report every fault.
//!
//! This crate provides three layers, each built on the one before it:
//!
//! * [run] (and the lower-level [catch]) executes an operation on the calling thread and turns
//!   any panic it raises into a [Panic] value carrying the original payload and a backtrace.
//! * [go] (or [Dispatcher::go]) executes an operation on a new thread. A panic is passed to the
//!   registered handler (see [set_panic_handler]) or, if there is none, logged with `tracing`.
//!   A panic raised by the handler itself is logged and dropped.
//! * [Group] launches many fallible operations on their own threads and waits for all of them,
//!   returning the first error (or recovered panic) it observed.
//!
//! # Example
//!
//! ```rust
//! use guardrail_safe::{run, Panic};
//!
//! #[derive(Debug, thiserror::Error)]
//! enum Error {
//!     #[error("not found")]
//!     NotFound,
//!     #[error(transparent)]
//!     Panic(#[from] Panic),
//! }
//!
//! let err = run(|| -> Result<(), Error> { panic!("unhandled error") }).unwrap_err();
//! assert_eq!(err.to_string(), "panic: unhandled error");
//!
//! let err = run(|| -> Result<(), Error> { Err(Error::NotFound) }).unwrap_err();
//! assert!(matches!(err, Error::NotFound));
//! ```
//!
//! # Fault Model
//!
//! Panics are intercepted by unwinding. A binary built with `panic = "abort"` terminates at the
//! panic site regardless of any boundary.

mod dispatch;
pub use dispatch::{clear_panic_handler, go, set_panic_handler, Dispatcher, Handler};
mod group;
pub use group::Group;
mod panic;
pub use panic::{catch, run, Panic};
