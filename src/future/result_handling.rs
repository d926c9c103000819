//! Transform an [`AsyncResult`] and optionally recover from its failure.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::future::AsyncResult;

/// Outcome of a failure handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<B> {
    /// The failure was recovered into a value
    Handled(B),
    /// The handler declined; the original failure propagates
    Unhandled,
}

type Transform<A, B> = Box<dyn FnOnce(A) -> Result<B> + Send>;
type Handler<B> = Box<dyn FnOnce(&ProtocolError) -> Handled<B> + Send>;

/// Wraps a result of `A`, producing `B`.
///
/// The outcome is computed once; later [`AsyncResult::get`] calls return the cached
/// value or failure. A `get` that times out caches nothing.
pub struct ResultHandlingFuture<A, B> {
    source: Box<dyn AsyncResult<A>>,
    transform: Option<Transform<A, B>>,
    handler: Option<Handler<B>>,
    outcome: Option<std::result::Result<B, Arc<ProtocolError>>>,
}

impl<A: 'static, B> ResultHandlingFuture<A, B> {
    pub fn new<S, F>(source: S, transform: F) -> Self
    where
        S: AsyncResult<A> + 'static,
        F: FnOnce(A) -> Result<B> + Send + 'static,
    {
        Self {
            source: Box::new(source),
            transform: Some(Box::new(transform)),
            handler: None,
            outcome: None,
        }
    }

    /// Route source failures through `handler`
    pub fn on_error<H>(mut self, handler: H) -> Self
    where
        H: FnOnce(&ProtocolError) -> Handled<B> + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    fn settle(&mut self, source: Result<A>) -> std::result::Result<B, Arc<ProtocolError>> {
        match source {
            Ok(value) => match self.transform.take() {
                Some(transform) => transform(value).map_err(Arc::new),
                None => Err(Arc::new(ProtocolError::InitializationError(
                    "result transform already consumed".into(),
                ))),
            },
            Err(error) => match self.handler.take().map(|handler| handler(&error)) {
                Some(Handled::Handled(value)) => Ok(value),
                Some(Handled::Unhandled) | None => Err(Arc::new(error)),
            },
        }
    }
}

impl<A: Send + 'static, B: Clone + Send> AsyncResult<B> for ResultHandlingFuture<A, B> {
    fn is_done(&self) -> bool {
        self.outcome.is_some() || self.source.is_done()
    }

    fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }

    fn get(&mut self, timeout: Option<Duration>) -> Result<B> {
        if self.outcome.is_none() {
            let source = self.source.get(timeout);
            if matches!(source, Err(ProtocolError::Timeout)) && !self.source.is_done() {
                return Err(ProtocolError::Timeout);
            }
            self.outcome = Some(self.settle(source));
        }
        match &self.outcome {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(ProtocolError::Shared(Arc::clone(error))),
            None => Err(ProtocolError::Timeout),
        }
    }

    fn cancel(&self) -> bool {
        self.outcome.is_none() && self.source.cancel()
    }
}
