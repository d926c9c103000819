//! Sequential composition of asynchronous steps.
//!
//! A chain holds one in-flight step and a FIFO of continuations. Each continuation
//! receives the previous step's value and starts the next step. Only the in-flight step
//! is ever waited on or cancelled; continuations run on whichever thread advances the
//! chain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::future::AsyncResult;

type Step<T> = Box<dyn AsyncResult<T>>;
type Continuation<T> = Box<dyn FnOnce(T) -> Result<Step<T>> + Send>;

pub struct FutureChain<T> {
    current: Step<T>,
    continuations: VecDeque<Continuation<T>>,
    outcome: Option<std::result::Result<T, Arc<ProtocolError>>>,
}

impl<T: Clone + Send + 'static> FutureChain<T> {
    /// Start a chain whose first step is already in flight
    pub fn new<S>(first: S) -> Self
    where
        S: AsyncResult<T> + 'static,
    {
        Self {
            current: Box::new(first),
            continuations: VecDeque::new(),
            outcome: None,
        }
    }

    /// Queue a continuation that starts the next step from the previous value
    pub fn then<F, S>(mut self, continuation: F) -> Self
    where
        F: FnOnce(T) -> Result<S> + Send + 'static,
        S: AsyncResult<T> + 'static,
    {
        self.continuations.push_back(Box::new(move |value| {
            continuation(value).map(|step| Box::new(step) as Step<T>)
        }));
        self
    }

    /// Continuations not yet started
    pub fn remaining(&self) -> usize {
        self.continuations.len()
    }

    /// Wait up to `timeout` for the in-flight step, then start the next one.
    ///
    /// Returns `true` when a new step was started and `false` once the chain has
    /// finished. A timeout leaves the chain untouched; any other failure finishes it.
    pub fn move_next(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if let Some(outcome) = &self.outcome {
            return Self::report(outcome).map(|_| false);
        }
        match self.current.get(timeout) {
            Err(ProtocolError::Timeout) if !self.current.is_done() => Err(ProtocolError::Timeout),
            settled => self.advance(settled),
        }
    }

    /// Non-blocking poll.
    ///
    /// Returns `false` while a step is still in flight or when a finished step was just
    /// handed to the next continuation, and `true` once the last step has completed.
    pub fn complete(&mut self) -> Result<bool> {
        if let Some(outcome) = &self.outcome {
            return Self::report(outcome).map(|_| true);
        }
        if !self.current.is_done() {
            return Ok(false);
        }
        let settled = self.current.get(Some(Duration::ZERO));
        let advanced = self.advance(settled)?;
        Ok(!advanced)
    }

    /// The final value, once the chain has finished
    pub fn current_result(&self) -> Option<Result<T>> {
        self.outcome.as_ref().map(Self::report)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Cancel the in-flight step and drop the queued continuations without running them
    pub fn cancel(&mut self) -> bool {
        self.continuations.clear();
        self.current.cancel()
    }

    /// Block until the whole chain has finished
    pub fn wait(&mut self, timeout_per_step: Option<Duration>) -> Result<T> {
        while self.move_next(timeout_per_step)? {}
        self.current_result().unwrap_or(Err(ProtocolError::Timeout))
    }

    /// Poll [`FutureChain::complete`] from async code until the chain finishes
    pub async fn until_complete(&mut self, poll_interval: Duration) -> Result<T> {
        while !self.complete()? {
            tokio::time::sleep(poll_interval).await;
        }
        self.current_result().unwrap_or(Err(ProtocolError::Timeout))
    }

    fn advance(&mut self, settled: Result<T>) -> Result<bool> {
        let value = match settled {
            Ok(value) => value,
            Err(error) => return Err(self.finish_with_error(error)),
        };
        match self.continuations.pop_front() {
            Some(continuation) => match continuation(value) {
                Ok(step) => {
                    trace!(remaining = self.continuations.len(), "Future chain advanced");
                    self.current = step;
                    Ok(true)
                }
                Err(error) => Err(self.finish_with_error(error)),
            },
            None => {
                self.outcome = Some(Ok(value));
                Ok(false)
            }
        }
    }

    fn finish_with_error(&mut self, error: ProtocolError) -> ProtocolError {
        self.continuations.clear();
        let error = match error {
            ProtocolError::Shared(shared) => shared,
            other => Arc::new(other),
        };
        self.outcome = Some(Err(Arc::clone(&error)));
        ProtocolError::Shared(error)
    }

    fn report(outcome: &std::result::Result<T, Arc<ProtocolError>>) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value.clone()),
            Err(error) => Err(ProtocolError::Shared(Arc::clone(error))),
        }
    }
}
