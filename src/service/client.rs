//! # Client Service
//!
//! Owns one logical [`Communicator`], the connector it dials through, and the
//! initializer that runs its handshake.
//!
//! Every operation returns immediately with an [`AsyncResult`](crate::future::AsyncResult)
//! and can be issued from any thread:
//! - [`Client::connect`] resolves once a transport is attached
//! - [`Client::authenticate`] installs a handshake and resolves with the assigned id
//! - [`Client::start`] chains both into one [`FutureChain`]
//! - [`Client::establish`] drives that chain to completion from async code
//!
//! The client is also the [`Migrator`] for its own handshakes: a migration instruction
//! swaps in a connector for the new port and reconnects the same communicator, so
//! identity and listener registrations survive.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, instrument};

use crate::communicator::{Communicator, CommunicatorOptions, ConnectionId};
use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::future::{FutureChain, Pending, ResultHandlingFuture};
use crate::protocol::handshake::{ClientHandshake, Migrator};
use crate::protocol::pipeline::Initializer;
use crate::service::driver::ConnectionDriver;
use crate::transport::tcp::TcpConnector;
use crate::transport::{Connector, Endpoint};
use crate::utils::lock;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Progress reported by a [`Client::start`] chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStage {
    Connected,
    Authenticated(ConnectionId),
}

pub struct Client {
    communicator: Communicator,
    connector: Mutex<Arc<dyn Connector>>,
    initializer: Arc<Initializer>,
    runtime: Handle,
    metrics: Arc<Metrics>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    poll_interval: Duration,
}

impl Client {
    /// Build a client on the current tokio runtime
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &NetworkConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| ProtocolError::InitializationError(format!("no tokio runtime: {e}")))?;
        let communicator = Communicator::with_options(
            connector.endpoint().to_string(),
            CommunicatorOptions::from(&config.handshake),
        );
        Ok(Arc::new(Self {
            initializer: Arc::new(Initializer::new(communicator.clone())),
            communicator,
            connector: Mutex::new(connector),
            runtime,
            metrics,
            connect_timeout: config.client.connection_timeout,
            handshake_timeout: config.handshake.handshake_timeout,
            poll_interval: config.client.poll_interval,
        }))
    }

    /// Build a TCP client for the configured server address
    pub fn from_config(config: &NetworkConfig, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let connector = TcpConnector::with_timeout(
            config.client.endpoint()?,
            config.client.connection_timeout,
        );
        Self::new(Arc::new(connector), config, metrics)
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn initializer(&self) -> &Arc<Initializer> {
        &self.initializer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Endpoint of the connector currently in use
    pub fn endpoint(&self) -> Endpoint {
        lock(&self.connector).endpoint().clone()
    }

    /// Attach a transport through the current connector
    pub fn connect(&self) -> Pending<()> {
        let connector = Arc::clone(&*lock(&self.connector));
        let communicator = self.communicator.clone();
        let metrics = Arc::clone(&self.metrics);
        let budget = self.connect_timeout;
        Pending::spawn(&self.runtime, async move {
            let endpoint = connector.endpoint().clone();
            match with_timeout_error(connector.connect(communicator), budget).await {
                Ok(()) => {
                    metrics.connection_established();
                    info!(%endpoint, "Client connected");
                    Ok(())
                }
                Err(error) => {
                    metrics.connection_error();
                    Err(error)
                }
            }
        })
    }

    /// Install `handshake` and drive it; resolves with the id the server assigned.
    ///
    /// Unless the handshake already carries a migrator, this client handles
    /// migration instructions itself. Once authenticated, the same update loop keeps
    /// servicing post-handshake channels until the connection closes.
    pub fn authenticate(self: &Arc<Self>, handshake: ClientHandshake) -> Pending<ConnectionId> {
        let handshake = if handshake.has_migrator() {
            handshake
        } else {
            handshake.migrator(Arc::new(ClientMigrator(Arc::downgrade(self))))
        };
        self.initializer.install(handshake.phases());

        let driver = ConnectionDriver::new(Arc::clone(&self.initializer), Arc::clone(&self.metrics));
        let communicator = self.communicator.clone();
        let budget = self.handshake_timeout;
        let runtime = self.runtime.clone();
        Pending::spawn(&self.runtime, async move {
            driver.handshake(budget).await?;
            if !communicator.is_authenticated() {
                return Err(ProtocolError::InitializationError(
                    constants::ERR_NOT_AUTHENTICATED.into(),
                ));
            }
            let id = communicator.id();
            runtime.spawn(async move { driver.serve().await });
            Ok(id)
        })
    }

    /// Connect, then authenticate, as one pollable chain
    pub fn start(self: &Arc<Self>, handshake: ClientHandshake) -> FutureChain<ClientStage> {
        let client = Arc::clone(self);
        let connected = ResultHandlingFuture::new(self.connect(), |()| Ok(ClientStage::Connected));
        FutureChain::new(connected).then(move |_| {
            Ok(ResultHandlingFuture::new(
                client.authenticate(handshake),
                |id| Ok(ClientStage::Authenticated(id)),
            ))
        })
    }

    /// Connect and authenticate, polling the chain at the configured interval
    pub async fn establish(self: &Arc<Self>, handshake: ClientHandshake) -> Result<ConnectionId> {
        match self.start(handshake).until_complete(self.poll_interval).await? {
            ClientStage::Authenticated(id) => Ok(id),
            ClientStage::Connected => Err(ProtocolError::InitializationError(
                constants::ERR_NOT_AUTHENTICATED.into(),
            )),
        }
    }

    /// Graceful disconnect
    pub fn close(&self) {
        self.communicator.close();
    }

    /// Swap to a connector for `port` on the same host and start reconnecting
    #[instrument(skip(self), fields(id = %self.communicator.id()))]
    fn migrate_to(&self, port: u16) -> Result<Pending<()>> {
        let (target, connector) = {
            let mut current = lock(&self.connector);
            let target = current.endpoint().with_port(port);
            let next = current.retarget(&target)?;
            *current = Arc::clone(&next);
            (target, next)
        };
        info!(%target, "Migrating transport");
        self.metrics.migration();
        self.communicator.set_endpoint(target.to_string());
        self.communicator.detach();

        let communicator = self.communicator.clone();
        let budget = self.connect_timeout;
        Ok(Pending::spawn(&self.runtime, async move {
            let result = with_timeout_error(connector.connect(communicator.clone()), budget).await;
            // Success already woke the driver through the attach; failure must too.
            communicator.waker().notify_one();
            result
        }))
    }
}

/// Migration hook handed to handshakes; weak so the pipeline does not keep the client alive
struct ClientMigrator(Weak<Client>);

impl Migrator for ClientMigrator {
    fn migrate(&self, _communicator: &Communicator, port: u16) -> Result<Pending<()>> {
        let client = self.0.upgrade().ok_or(ProtocolError::ConnectionClosed)?;
        client.migrate_to(port)
    }
}
