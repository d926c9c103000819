//! # Chained Async Results
//!
//! Blocking-or-polling handles for work running on the tokio runtime, so multi-step
//! client operations (connect, authenticate, ready) can be driven from any thread.
//!
//! ## Components
//! - [`Pending`] / [`Completer`]: a cancellable, cloneable result slot
//! - [`ResultHandlingFuture`]: maps a result and optionally recovers from failures
//! - [`FutureChain`]: runs continuations one after another, one step in flight at a time
//!
//! ## Blocking
//! [`AsyncResult::get`] parks the calling thread. Never call it with a timeout other
//! than zero from inside the runtime; async code uses [`Pending::wait`] or
//! [`FutureChain::until_complete`] instead.

use std::time::Duration;

use crate::error::Result;

mod chain;
mod pending;
mod result_handling;

pub use chain::FutureChain;
pub use pending::{Completer, Pending};
pub use result_handling::{Handled, ResultHandlingFuture};

/// A result that becomes available at some point, or is cancelled first
pub trait AsyncResult<T>: Send {
    fn is_done(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    /// Wait up to `timeout` (forever when `None`) for the outcome.
    ///
    /// Fails with `Timeout` if the result is not ready in time, `Cancelled` after
    /// cancellation, or the producer's error.
    fn get(&mut self, timeout: Option<Duration>) -> Result<T>;

    /// Request cancellation; returns false if the outcome was already decided
    fn cancel(&self) -> bool;
}

impl<T> AsyncResult<T> for Box<dyn AsyncResult<T>> {
    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }

    fn get(&mut self, timeout: Option<Duration>) -> Result<T> {
        (**self).get(timeout)
    }

    fn cancel(&self) -> bool {
        (**self).cancel()
    }
}
