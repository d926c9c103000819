//! Per-connection update loop.
//!
//! The driver is the only caller of [`Initializer::run`] for its connection. It wakes
//! when the communicator signals new bytes, a route change or a close, and otherwise
//! re-checks every [`TICK_INTERVAL`] so pending reconnects are noticed even without
//! inbound traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::communicator::Communicator;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::pipeline::{Initializer, RunResult};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::{with_timeout_error, TICK_INTERVAL};

pub struct ConnectionDriver {
    initializer: Arc<Initializer>,
    metrics: Arc<Metrics>,
    received_seen: AtomicU64,
}

impl ConnectionDriver {
    pub fn new(initializer: Arc<Initializer>, metrics: Arc<Metrics>) -> Self {
        Self {
            initializer,
            metrics,
            received_seen: AtomicU64::new(0),
        }
    }

    pub fn initializer(&self) -> &Arc<Initializer> {
        &self.initializer
    }

    fn communicator(&self) -> &Communicator {
        self.initializer.communicator()
    }

    /// Drive the pipeline until it finishes, fails or runs out of `budget`.
    ///
    /// Running out of time disconnects the communicator with [`ProtocolError::Timeout`].
    #[instrument(skip(self), fields(id = %self.communicator().id(), endpoint = %self.communicator().endpoint()))]
    pub async fn handshake(&self, budget: Duration) -> Result<()> {
        let _timer = Timer::start("handshake");
        self.metrics.handshake_attempt();
        let outcome = with_timeout_error(self.run_pipeline(), budget).await;
        match &outcome {
            Ok(()) if self.communicator().is_authenticated() => self.metrics.handshake_success(),
            Ok(()) => debug!("Pipeline finished without authenticating"),
            Err(ProtocolError::Timeout) => {
                warn!(budget_ms = budget.as_millis() as u64, "{}", constants::ERR_HANDSHAKE_TIMEOUT);
                self.communicator()
                    .disconnect(Some(Arc::new(ProtocolError::Timeout)));
                self.metrics.handshake_failed();
            }
            Err(_) => self.metrics.handshake_failed(),
        }
        outcome
    }

    async fn run_pipeline(&self) -> Result<()> {
        let communicator = self.communicator();
        let waker = communicator.waker();
        loop {
            if communicator.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }
            let result = self.initializer.run_until_blocked()?;
            self.account_received();
            self.flush()?;
            if result == RunResult::Finished {
                return Ok(());
            }
            tokio::select! {
                _ = waker.notified() => {}
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
        }
    }

    /// Dispatch post-handshake channel frames and flush until the connection closes
    pub async fn serve(&self) -> Result<()> {
        let communicator = self.communicator();
        let waker = communicator.waker();
        loop {
            if communicator.is_closed() {
                debug!(id = %communicator.id(), "Connection closed, driver exiting");
                return Ok(());
            }
            self.account_received();
            if let Err(error) = communicator.dispatch_incoming() {
                return Err(self.fail(error));
            }
            self.flush()?;
            tokio::select! {
                _ = waker.notified() => {}
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
        }
    }

    fn flush(&self) -> Result<()> {
        match self.communicator().flush() {
            Ok(sent) => {
                if sent > 0 {
                    self.metrics.bytes_out(sent as u64);
                }
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn account_received(&self) {
        let total = self.communicator().bytes_received();
        let previous = self.received_seen.swap(total, Ordering::Relaxed);
        if total > previous {
            self.metrics.bytes_in(total - previous);
        }
    }

    fn fail(&self, error: ProtocolError) -> ProtocolError {
        self.metrics.connection_error();
        let cause = Arc::new(error);
        self.communicator().disconnect(Some(Arc::clone(&cause)));
        ProtocolError::Shared(cause)
    }
}
