//! # In-Process Transport
//!
//! A [`LocalHub`] is a namespace of numbered ports that live inside one process.
//! Listening on a port yields a [`LocalListener`]; dialling it pairs the caller's
//! communicator with a fresh server-side communicator, with the same framing a socket
//! would carry. Migration between local ports works exactly like TCP.
//!
//! Hubs are explicitly constructed and shared via `Arc`; there is no global hub.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::communicator::{Communicator, CommunicatorOptions};
use crate::error::{ProtocolError, Result};
use crate::transport::{Connector, Endpoint, TransportKind};
use crate::utils::lock;

struct PortEntry {
    accept: mpsc::UnboundedSender<Communicator>,
    options: CommunicatorOptions,
}

/// Registry of in-process listening ports
#[derive(Default)]
pub struct LocalHub {
    ports: Mutex<HashMap<u16, PortEntry>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start listening on `port`; accepted communicators are built with `options`
    pub fn bind(self: &Arc<Self>, port: u16, options: CommunicatorOptions) -> Result<LocalListener> {
        let mut ports = lock(&self.ports);
        if ports.contains_key(&port) {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("local port {port} is already bound"),
            )));
        }
        let (accept, incoming) = mpsc::unbounded_channel();
        ports.insert(port, PortEntry { accept, options });
        info!(port, "Listening on local port");
        Ok(LocalListener {
            port,
            incoming,
            hub: Arc::clone(self),
        })
    }

    pub fn is_bound(&self, port: u16) -> bool {
        lock(&self.ports).contains_key(&port)
    }

    /// Pair `client` with a new communicator accepted on `port`
    pub fn connect(&self, port: u16, client: &Communicator) -> Result<()> {
        let ports = lock(&self.ports);
        let entry = ports.get(&port).ok_or_else(|| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing is listening on local port {port}"),
            ))
        })?;
        let server = Communicator::with_options(
            format!("{}#{}", Endpoint::local(port), client.endpoint()),
            entry.options.clone(),
        );
        Communicator::attach_local(client, &server)?;
        entry
            .accept
            .send(server)
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        debug!(port, "Local connection established");
        Ok(())
    }

    fn release(&self, port: u16) {
        lock(&self.ports).remove(&port);
        debug!(port, "Local port released");
    }
}

/// Accept side of a bound local port; unbinds on drop
pub struct LocalListener {
    port: u16,
    incoming: mpsc::UnboundedReceiver<Communicator>,
    hub: Arc<LocalHub>,
}

impl LocalListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next dialled connection
    pub async fn accept(&mut self) -> Option<Communicator> {
        self.incoming.recv().await
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.hub.release(self.port);
    }
}

/// Dials a port on a [`LocalHub`]
#[derive(Clone)]
pub struct LocalConnector {
    hub: Arc<LocalHub>,
    endpoint: Endpoint,
}

impl LocalConnector {
    pub fn new(hub: Arc<LocalHub>, port: u16) -> Self {
        Self {
            hub,
            endpoint: Endpoint::local(port),
        }
    }
}

impl Connector for LocalConnector {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn retarget(&self, target: &Endpoint) -> Result<Arc<dyn Connector>> {
        self.endpoint.ensure_port_only(target)?;
        debug_assert_eq!(target.transport, TransportKind::Local);
        Ok(Arc::new(Self::new(Arc::clone(&self.hub), target.port)))
    }

    fn connect(&self, communicator: Communicator) -> BoxFuture<'static, Result<()>> {
        let hub = Arc::clone(&self.hub);
        let port = self.endpoint.port;
        Box::pin(async move { hub.connect(port, &communicator) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_accept() {
        let hub = LocalHub::new();
        let mut listener = hub.bind(4000, CommunicatorOptions::default()).unwrap();
        let client = Communicator::new("client");
        LocalConnector::new(Arc::clone(&hub), 4000)
            .connect(client.clone())
            .await
            .unwrap();

        let server = listener.accept().await.unwrap();
        client.send_frame(b"hi").unwrap();
        client.flush().unwrap();
        assert_eq!(server.inbox_len(), 6);
        assert!(client.is_connected() && server.is_connected());
    }

    #[tokio::test]
    async fn test_refused_without_listener() {
        let hub = LocalHub::new();
        let client = Communicator::new("client");
        let result = LocalConnector::new(hub, 9).connect(client).await;
        assert!(matches!(result, Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_port_released_on_drop() {
        let hub = LocalHub::new();
        let listener = hub.bind(1, CommunicatorOptions::default()).unwrap();
        assert!(hub.bind(1, CommunicatorOptions::default()).is_err());
        drop(listener);
        assert!(!hub.is_bound(1));
    }

    #[tokio::test]
    async fn test_detach_closes_old_peer_only() {
        let hub = LocalHub::new();
        let mut first = hub.bind(1, CommunicatorOptions::default()).unwrap();
        let mut second = hub.bind(2, CommunicatorOptions::default()).unwrap();
        let client = Communicator::new("client");

        hub.connect(1, &client).unwrap();
        let old = first.accept().await.unwrap();
        client.detach();
        assert!(old.is_closed());

        hub.connect(2, &client).unwrap();
        let new = second.accept().await.unwrap();
        assert!(!client.is_closed());
        assert!(new.is_connected());
    }
}
