//! Cancellable result slot shared between a producer and any number of waiters.

use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::error::{ProtocolError, Result};
use crate::future::AsyncResult;
use crate::utils::lock;

enum Slot<T> {
    Waiting,
    Done(std::result::Result<T, Arc<ProtocolError>>),
    Cancelled,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
    task: Mutex<Option<AbortHandle>>,
}

impl<T> Inner<T> {
    fn settle(&self, outcome: Slot<T>) -> bool {
        {
            let mut slot = lock(&self.slot);
            if !matches!(*slot, Slot::Waiting) {
                return false;
            }
            *slot = outcome;
        }
        self.ready.notify_all();
        self.notify.notify_waiters();
        true
    }
}

/// Read side of a result that is decided once
pub struct Pending<T> {
    inner: Arc<Inner<T>>,
}

/// Write side; dropping it without completing cancels the [`Pending`]
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Pending<T> {
    /// Create an undecided slot and its completer
    pub fn channel() -> (Completer<T>, Pending<T>) {
        let inner = Arc::new(Inner {
            slot: Mutex::new(Slot::Waiting),
            ready: Condvar::new(),
            notify: Notify::new(),
            task: Mutex::new(None),
        });
        (
            Completer {
                inner: Arc::clone(&inner),
            },
            Pending { inner },
        )
    }

    /// An already successful result
    pub fn ready(value: T) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(Ok(value));
        pending
    }

    /// An already failed result
    pub fn failed(error: ProtocolError) -> Self {
        let (completer, pending) = Self::channel();
        completer.complete(Err(error));
        pending
    }

    /// Run `future` on `handle`; cancelling the returned `Pending` aborts the task
    pub fn spawn<F>(handle: &Handle, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (completer, pending) = Self::channel();
        let task = handle.spawn(async move {
            completer.complete(future.await);
        });
        *lock(&pending.inner.task) = Some(task.abort_handle());
        // Cancelled before the handle was stored.
        if pending.cancelled() {
            task.abort();
        }
        pending
    }
}

impl<T: Clone> Pending<T> {
    /// The outcome if it has been decided, without waiting
    pub fn try_result(&self) -> Option<Result<T>> {
        Self::read(&lock(&self.inner.slot))
    }

    /// Wait asynchronously for the outcome
    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }

    fn read(slot: &Slot<T>) -> Option<Result<T>> {
        match slot {
            Slot::Waiting => None,
            Slot::Done(Ok(value)) => Some(Ok(value.clone())),
            Slot::Done(Err(error)) => Some(Err(ProtocolError::Shared(Arc::clone(error)))),
            Slot::Cancelled => Some(Err(ProtocolError::Cancelled)),
        }
    }
}

impl<T: Clone + Send> AsyncResult<T> for Pending<T> {
    fn is_done(&self) -> bool {
        !matches!(*lock(&self.inner.slot), Slot::Waiting)
    }

    fn is_cancelled(&self) -> bool {
        matches!(*lock(&self.inner.slot), Slot::Cancelled)
    }

    fn get(&mut self, timeout: Option<Duration>) -> Result<T> {
        let slot = lock(&self.inner.slot);
        let waiting = |slot: &mut Slot<T>| matches!(slot, Slot::Waiting);
        let slot = match timeout {
            None => self
                .inner
                .ready
                .wait_while(slot, waiting)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.inner
                    .ready
                    .wait_timeout_while(slot, timeout, waiting)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        Self::read(&slot).unwrap_or(Err(ProtocolError::Timeout))
    }

    fn cancel(&self) -> bool {
        if !self.inner.settle(Slot::Cancelled) {
            return false;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
        true
    }
}

impl<T> Completer<T> {
    /// Decide the outcome; returns false if it was already cancelled
    pub fn complete(self, outcome: Result<T>) -> bool {
        self.inner.settle(Slot::Done(outcome.map_err(Arc::new)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*lock(&self.inner.slot), Slot::Cancelled)
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.inner.settle(Slot::Cancelled);
    }
}

impl<T> Pending<T> {
    fn cancelled(&self) -> bool {
        matches!(*lock(&self.inner.slot), Slot::Cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_waits_for_completion() {
        let (completer, mut pending) = Pending::channel();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(5u32));
        });
        assert_eq!(pending.get(None).unwrap(), 5);
        assert_eq!(pending.get(Some(Duration::ZERO)).unwrap(), 5);
        worker.join().unwrap();
    }

    #[test]
    fn test_timeout_leaves_result_undecided() {
        let (_completer, mut pending) = Pending::<u8>::channel();
        assert!(matches!(
            pending.get(Some(Duration::from_millis(5))),
            Err(ProtocolError::Timeout)
        ));
        assert!(!pending.is_done());
    }

    #[test]
    fn test_dropped_completer_cancels() {
        let (completer, mut pending) = Pending::<u8>::channel();
        drop(completer);
        assert!(pending.is_cancelled());
        assert!(matches!(pending.get(None), Err(ProtocolError::Cancelled)));
    }

    #[test]
    fn test_cancel_after_completion_is_refused() {
        let pending = Pending::ready(1u8);
        assert!(!pending.cancel());
        assert_eq!(pending.try_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_failure_is_shared_with_every_waiter() {
        let pending = Pending::<u8>::failed(ProtocolError::ReconnectError("refused".into()));
        let copy = pending.clone();
        for waiter in [pending, copy] {
            let error = waiter.try_result().unwrap().unwrap_err();
            assert!(matches!(error.root(), ProtocolError::ReconnectError(_)));
        }
    }

    #[tokio::test]
    async fn test_cancel_aborts_spawned_task() {
        let pending = Pending::spawn(&Handle::current(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u8)
        });
        assert!(pending.cancel());
        assert!(matches!(pending.wait().await, Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_on_spawned_task() {
        let pending = Pending::spawn(&Handle::current(), async { Ok("done") });
        assert_eq!(pending.wait().await.unwrap(), "done");
    }
}
