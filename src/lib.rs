//! # Handshake Pipeline
//!
//! Brings a raw transport connection up to an authenticated, optionally encrypted,
//! application-ready channel.
//!
//! A [`Communicator`] wraps one logical connection. An [`Initializer`] runs an ordered
//! queue of consumer and producer phases against it, advancing as bytes arrive and
//! sharing decoded values through an [`InitContext`]. The stock
//! [`ClientHandshake`]/[`ServerHandshake`] sequences exchange identity, optionally
//! bootstrap a symmetric session key and can move a client onto another port while
//! keeping its identity.
//!
//! ## Layout
//! - [`core`](crate::core): growable byte buffer and framing
//! - [`communicator`]: connection abstraction, channels and disconnect listeners
//! - [`protocol`]: phases, pipeline, handshakes and session keys
//! - [`transport`]: TCP and in-process carriers
//! - [`service`]: client, server, session registry and the update loop
//! - [`future`]: pollable results and chains for caller-thread sequencing
//! - [`config`], [`error`], [`utils`]: configuration, errors, crypto, logging, metrics
//!
//! ## Example
//! ```ignore
//! let hub = LocalHub::new();
//! let server = Arc::new(Server::new(&config, metrics.clone()));
//! tokio::spawn(server.serve_local(hub.bind(4000, options)?, shutdown_rx));
//!
//! let client = Client::new(Arc::new(LocalConnector::new(hub, 4000)), &config, metrics)?;
//! let mut chain = client.start(ClientHandshake::new());
//! ```

pub mod communicator;
pub mod config;
pub mod core;
pub mod error;
pub mod future;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use communicator::{Communicator, CommunicatorOptions, ConnectionId};
pub use config::NetworkConfig;
pub use crate::core::buffer::Buffer;
pub use error::{ProtocolError, Result};
pub use future::{AsyncResult, FutureChain, Pending, ResultHandlingFuture};
pub use protocol::{
    ClientHandshake, ContextKey, InitContext, Initializer, Phase, RunResult, ServerHandshake,
};
pub use service::{Client, Server, SessionRegistry};
