//! # Transport Layer
//!
//! Byte carriers that a [`Communicator`] can be attached to.
//!
//! ## Transports
//! - **TCP**: `tokio::net` streams pumped through `tokio-util` byte codecs
//! - **Local**: in-process "ports" on a [`local::LocalHub`], for tests and
//!   single-process deployments
//!
//! A [`Connector`] knows one target [`Endpoint`] and how to attach a fresh transport
//! to an existing communicator. Migration never mutates a connector: it asks for a
//! retargeted one and swaps it in.
//!
//! UDP is not provided; the handshake assumes an ordered byte stream.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::communicator::Communicator;
use crate::error::{constants, ProtocolError, Result};

pub mod local;
pub mod tcp;

/// Kind of byte carrier behind an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Local,
}

/// Where a connector dials
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: TransportKind::Tcp,
        }
    }

    pub fn local(port: u16) -> Self {
        Self {
            host: "local".into(),
            port,
            transport: TransportKind::Local,
        }
    }

    /// Same host and transport on another port
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Fail unless `target` differs from this endpoint only by port
    pub fn ensure_port_only(&self, target: &Endpoint) -> Result<()> {
        if self.host != target.host || self.transport != target.transport {
            return Err(ProtocolError::Unsupported(format!(
                "{}: {self} -> {target}",
                constants::ERR_CROSS_HOST_MIGRATION
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            TransportKind::Tcp => write!(f, "tcp://{}:{}", self.host, self.port),
            TransportKind::Local => write!(f, "local://{}", self.port),
        }
    }
}

/// Dials one endpoint and attaches the resulting transport to a communicator
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// A new connector for `target`, which must share this connector's host and transport
    fn retarget(&self, target: &Endpoint) -> Result<Arc<dyn Connector>>;

    /// Establish a transport and attach it to `communicator`.
    ///
    /// On success the communicator is routed to the new transport, its inbox is empty,
    /// and its identity and listeners are unchanged.
    fn connect(&self, communicator: Communicator) -> BoxFuture<'static, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_only_migration_rule() {
        let origin = Endpoint::tcp("10.0.0.1", 4000);
        assert!(origin.ensure_port_only(&origin.with_port(5000)).is_ok());
        assert!(matches!(
            origin.ensure_port_only(&Endpoint::tcp("10.0.0.2", 5000)),
            Err(ProtocolError::Unsupported(_))
        ));
        assert!(origin.ensure_port_only(&Endpoint::local(5000)).is_err());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::tcp("example.org", 80).to_string(), "tcp://example.org:80");
        assert_eq!(Endpoint::local(7).to_string(), "local://7");
    }
}
