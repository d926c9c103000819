//! # Server Service
//!
//! Accept loops for TCP and in-process listeners. Every accepted connection gets its
//! own [`Initializer`] running the configured [`ServerHandshake`], driven by a
//! [`ConnectionDriver`] task.
//!
//! Once a connection authenticates, the `on_ready` hook receives the communicator and
//! the finished handshake context; the driver then keeps servicing post-handshake
//! channels until the connection closes, at which point the session is released back
//! to the registry.
//!
//! A connection that was told to migrate keeps its slot only until the resume TTL
//! runs out; a client that never leaves the origin transport is then disconnected.
//!
//! ## Shutdown
//! Both loops stop accepting when the shutdown channel fires, then wait up to the
//! configured shutdown timeout for active connections to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::communicator::{Communicator, CommunicatorOptions};
use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::context::InitContext;
use crate::protocol::handshake::{ServerHandshake, FRESH};
use crate::protocol::pipeline::Initializer;
use crate::service::driver::ConnectionDriver;
use crate::service::registry::SessionRegistry;
use crate::transport::local::{LocalHub, LocalListener};
use crate::transport::tcp::bind_stream;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Called once per authenticated connection with the finished handshake context
pub type ReadyHook = Arc<dyn Fn(Communicator, InitContext) + Send + Sync>;

pub struct Server {
    handshake: ServerHandshake,
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    options: CommunicatorOptions,
    address: String,
    local_port: Option<u16>,
    handshake_timeout: Duration,
    resume_ttl: Duration,
    shutdown_timeout: Duration,
    max_connections: usize,
    active: AtomicUsize,
    on_ready: Option<ReadyHook>,
}

impl Server {
    pub fn new(config: &NetworkConfig, metrics: Arc<Metrics>) -> Self {
        let registry = Arc::new(SessionRegistry::from_config(&config.server));
        let mut handshake = ServerHandshake::new(registry.clone());
        if let Some(port) = config.server.migrate_to {
            handshake = handshake.migrate_to(port);
        }
        Self {
            handshake,
            registry,
            metrics,
            options: CommunicatorOptions::from(&config.handshake),
            address: config.server.address.clone(),
            local_port: config.server.local_port,
            handshake_timeout: config.handshake.handshake_timeout,
            resume_ttl: config.server.resume_ttl,
            shutdown_timeout: config.server.shutdown_timeout,
            max_connections: config.server.max_connections,
            active: AtomicUsize::new(0),
            on_ready: None,
        }
    }

    /// Adjust the handshake, typically to add application phases
    pub fn configure_handshake(mut self, configure: impl FnOnce(ServerHandshake) -> ServerHandshake) -> Self {
        self.handshake = configure(self.handshake);
        self
    }

    pub fn on_ready<F>(mut self, hook: F) -> Self
    where
        F: Fn(Communicator, InitContext) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(hook));
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn options(&self) -> &CommunicatorOptions {
        &self.options
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Bind the configured TCP address
    pub async fn bind_tcp(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(address = %self.address, "Bound TCP listener");
        Ok(listener)
    }

    /// Bind the configured in-process port on `hub`; `None` when no local port is set
    pub fn bind_local(&self, hub: &Arc<LocalHub>) -> Result<Option<LocalListener>> {
        self.local_port
            .map(|port| hub.bind(port, self.options.clone()))
            .transpose()
    }

    /// Accept TCP connections until `shutdown_rx` fires
    #[instrument(skip(self, listener, shutdown_rx), fields(address = ?listener.local_addr().ok()))]
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("Accepting TCP connections");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain().await;
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let communicator =
                            Communicator::with_options(format!("tcp://{peer}"), self.options.clone());
                        match bind_stream(stream, &communicator) {
                            Ok(()) => self.admit(communicator),
                            Err(e) => {
                                self.metrics.connection_error();
                                error!(error = %e, %peer, "Failed to bind accepted stream");
                            }
                        }
                    }
                    Err(e) => {
                        self.metrics.connection_error();
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }

    /// Accept in-process connections until `shutdown_rx` fires or the listener closes
    #[instrument(skip(self, listener, shutdown_rx), fields(port = listener.port()))]
    pub async fn serve_local(
        self: Arc<Self>,
        mut listener: LocalListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("Accepting local connections");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain().await;
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Some(communicator) => self.admit(communicator),
                    None => return Ok(()),
                }
            }
        }
    }

    /// Start the handshake for a freshly accepted communicator
    pub fn admit(self: &Arc<Self>, communicator: Communicator) {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_connections).then_some(active + 1)
            });
        if admitted.is_err() {
            warn!(endpoint = %communicator.endpoint(), max = self.max_connections, "Connection limit reached");
            self.metrics.connection_error();
            communicator.close();
            return;
        }
        self.metrics.connection_established();

        let initializer = Arc::new(Initializer::new(communicator.clone()));
        initializer.install(self.handshake.phases());
        let driver = ConnectionDriver::new(initializer, Arc::clone(&self.metrics));
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.run_connection(&driver, &communicator).await;
            server.registry.release(communicator.id(), &communicator);
            server.active.fetch_sub(1, Ordering::AcqRel);
            server.metrics.connection_closed();
        });
    }

    async fn run_connection(&self, driver: &ConnectionDriver, communicator: &Communicator) {
        if let Err(e) = driver.handshake(self.handshake_timeout).await {
            debug!(error = %e, endpoint = %communicator.endpoint(), "Handshake did not complete");
            return;
        }
        let served = if communicator.is_authenticated() {
            let context = driver.initializer().take_context();
            if context.try_get(FRESH) == Some(&false) {
                self.metrics.resumption();
            }
            if let Some(hook) = &self.on_ready {
                hook(communicator.clone(), context);
            }
            driver.serve().await
        } else {
            // Told to migrate; wait for the client to leave this transport.
            self.metrics.migration();
            let left = with_timeout_error(driver.serve(), self.resume_ttl).await;
            if let Err(ProtocolError::Timeout) = left {
                warn!(id = %communicator.id(), ttl_ms = self.resume_ttl.as_millis() as u64, "Client did not leave the origin transport");
                communicator.disconnect(Some(Arc::new(ProtocolError::Timeout)));
            }
            left
        };
        if let Err(e) = served {
            warn!(error = %e, id = %communicator.id(), "Connection failed");
        }
    }

    async fn drain(&self) {
        info!("Shutting down server. Waiting for connections to close...");
        let timeout = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!(connections = self.active_connections(), "Shutdown timeout reached, forcing exit");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    let connections = self.active_connections();
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        return;
                    }
                    debug!(connections, "Waiting for connections to close");
                }
            }
        }
    }
}
