//! # Communicator
//!
//! A connection endpoint used for framed, bidirectional byte exchange, independent of
//! what carries the bytes.
//!
//! A [`Communicator`] owns an outgoing buffer and an inbox. Phases and application code
//! write into the outgoing buffer; [`Communicator::flush`] hands the pending bytes to the
//! current route:
//! - **Remote**: a socket writer task fed through an unbounded channel (never blocks)
//! - **Local**: the paired in-process communicator's inbox, directly
//!
//! Transports push received bytes with [`Communicator::receive`], which wakes whichever
//! update loop is driving the connection.
//!
//! The route can be replaced while the communicator lives on (transport migration). The
//! logical identity, the authenticated latch and all listener registrations are kept;
//! every attach bumps a generation counter so bytes or errors reported by a retired
//! transport are ignored.
//!
//! Disconnect is terminal and idempotent: the first call flips `connected`, and the
//! disconnect listeners run exactly once with the cause (`None` for graceful).

mod incoming;
mod listeners;

pub use incoming::Reader;
pub use listeners::{Event, ListenerId};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::config::HandshakeConfig;
use crate::core::buffer::Buffer;
use crate::core::frame::{self, INIT_CHANNEL};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::lock;
use incoming::IncomingChannels;
use listeners::Callback;

/// Cause published to disconnect listeners; `None` means a graceful close
pub type DisconnectCause = Option<Arc<ProtocolError>>;

/// Logical connection identifier assigned during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Sentinel carried until the handshake registers the connection
    pub const UNREGISTERED: ConnectionId = ConnectionId(u32::MAX);

    pub fn is_registered(self) -> bool {
        self != Self::UNREGISTERED
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_registered() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("unregistered")
        }
    }
}

/// Sizing limits for a communicator's buffers and queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicatorOptions {
    /// Largest frame body accepted from the peer
    pub max_frame_size: usize,
    /// Starting capacity of the inbox and outgoing buffers
    pub initial_capacity: usize,
    /// Bound on queued readers and backlogged frames per channel
    pub max_pending_frames: usize,
}

impl Default for CommunicatorOptions {
    fn default() -> Self {
        Self::from(&HandshakeConfig::default())
    }
}

impl From<&HandshakeConfig> for CommunicatorOptions {
    fn from(config: &HandshakeConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            initial_capacity: config.initial_buffer_capacity,
            max_pending_frames: config.max_pending_frames,
        }
    }
}

#[derive(Clone)]
enum Route {
    Detached,
    Remote(mpsc::UnboundedSender<Bytes>),
    /// In-process peer, tagged with the peer generation this link was made under
    Local {
        peer: Weak<Shared>,
        generation: u64,
    },
}

struct Shared {
    id: AtomicU32,
    endpoint: Mutex<String>,
    connected: AtomicBool,
    closed: AtomicBool,
    authenticated: AtomicBool,
    generation: AtomicU64,
    received: AtomicU64,
    route: Mutex<Route>,
    flushing: Mutex<()>,
    outgoing: Mutex<Buffer>,
    inbox: Mutex<Buffer>,
    incoming: Mutex<IncomingChannels>,
    disconnected: Event<DisconnectCause>,
    final_cause: Mutex<Option<DisconnectCause>>,
    wake: Arc<Notify>,
    options: CommunicatorOptions,
}

/// Cloneable handle to one logical connection
#[derive(Clone)]
pub struct Communicator {
    shared: Arc<Shared>,
}

impl Communicator {
    /// Create a detached communicator with default limits
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_options(endpoint, CommunicatorOptions::default())
    }

    pub fn with_options(endpoint: impl Into<String>, options: CommunicatorOptions) -> Self {
        let shared = Shared {
            id: AtomicU32::new(ConnectionId::UNREGISTERED.0),
            endpoint: Mutex::new(endpoint.into()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            received: AtomicU64::new(0),
            route: Mutex::new(Route::Detached),
            flushing: Mutex::new(()),
            outgoing: Mutex::new(Buffer::with_capacity(options.initial_capacity)),
            inbox: Mutex::new(Buffer::with_capacity(options.initial_capacity)),
            incoming: Mutex::new(IncomingChannels::new(options.max_pending_frames)),
            disconnected: Event::new(),
            final_cause: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            options,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Create two in-process communicators wired to each other.
    ///
    /// Flushing one appends to the other's inbox with the same framing a socket would carry.
    pub fn pair(
        client_endpoint: impl Into<String>,
        server_endpoint: impl Into<String>,
        options: CommunicatorOptions,
    ) -> (Communicator, Communicator) {
        let client = Self::with_options(client_endpoint, options.clone());
        let server = Self::with_options(server_endpoint, options);
        client.link_local(&server);
        server.link_local(&client);
        (client, server)
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId(self.shared.id.load(Ordering::Acquire))
    }

    pub fn set_id(&self, id: ConnectionId) {
        self.shared.id.store(id.0, Ordering::Release);
    }

    pub fn endpoint(&self) -> String {
        lock(&self.shared.endpoint).clone()
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        *lock(&self.shared.endpoint) = endpoint.into();
    }

    pub fn options(&self) -> &CommunicatorOptions {
        &self.shared.options
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// True once [`Communicator::disconnect`] has run
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    /// One-way latch; there is no way to clear it for the life of the connection
    pub fn set_authenticated(&self) {
        if !self.shared.authenticated.swap(true, Ordering::AcqRel) {
            info!(id = %self.id(), endpoint = %self.endpoint(), "Communicator authenticated");
        }
    }

    /// Whether both handles refer to the same logical connection
    pub fn same_as(&self, other: &Communicator) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Notifier signalled whenever bytes arrive, the route changes or the connection closes
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.shared.wake)
    }

    /// Append the readable bytes of `buffer` (position to limit) to the outgoing buffer
    pub fn send(&self, buffer: &Buffer) {
        lock(&self.shared.outgoing).put_slice(buffer.remaining_slice());
    }

    /// Append `len` bytes of `bytes` starting at `off` to the outgoing buffer
    pub fn send_all(&self, bytes: &[u8], off: usize, len: usize) -> Result<()> {
        let end = off.checked_add(len).filter(|end| *end <= bytes.len());
        let Some(end) = end else {
            return Err(ProtocolError::OutOfRange {
                requested: off.saturating_add(len),
                available: bytes.len(),
            });
        };
        lock(&self.shared.outgoing).put_slice(&bytes[off..end]);
        Ok(())
    }

    /// Append one channel-0 frame
    pub fn send_frame(&self, payload: &[u8]) -> Result<()> {
        frame::write_frame(&mut lock(&self.shared.outgoing), payload)
    }

    /// Append one frame on a post-handshake channel
    pub fn send_channel(&self, channel: u8, payload: &[u8]) -> Result<()> {
        if !self.is_authenticated() {
            return Err(ProtocolError::InitializationError(
                constants::ERR_NOT_AUTHENTICATED.into(),
            ));
        }
        frame::write_channel_frame(&mut lock(&self.shared.outgoing), channel, payload)
    }

    /// Serialize `message` with bincode and send it on `channel`
    pub fn send_message<T: Serialize>(&self, channel: u8, message: &T) -> Result<()> {
        let payload = bincode::serialize(message)?;
        self.send_channel(channel, &payload)
    }

    /// Run `f` with exclusive access to the outgoing buffer
    pub fn with_outgoing<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut lock(&self.shared.outgoing))
    }

    /// Bytes written but not yet flushed
    pub fn pending_outgoing(&self) -> usize {
        lock(&self.shared.outgoing).limit()
    }

    /// Bytes received but not yet consumed
    pub fn inbox_len(&self) -> usize {
        lock(&self.shared.inbox).remaining()
    }

    /// Feed received bytes into the inbox and wake the update loop
    pub fn receive(&self, bytes: &[u8]) {
        if self.is_closed() {
            trace!(len = bytes.len(), "Dropping bytes received after disconnect");
            return;
        }
        lock(&self.shared.inbox).append(bytes);
        self.shared
            .received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.shared.wake.notify_one();
    }

    /// Total bytes accepted into the inbox over the connection's life
    pub fn bytes_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Receive bytes from the transport bound under `generation`; stale transports are ignored
    pub(crate) fn deliver(&self, generation: u64, bytes: &[u8]) {
        if generation != self.shared.generation.load(Ordering::Acquire) {
            trace!(generation, "Ignoring bytes from a retired transport");
            return;
        }
        self.receive(bytes);
    }

    /// Hand pending outgoing bytes to the current route.
    ///
    /// Returns the number of bytes handed over. Without a route the bytes stay queued.
    pub fn flush(&self) -> Result<usize> {
        // Flushes are serialized so drained chunks reach the route in order. Route and
        // buffer locks are never held together.
        let _flushing = lock(&self.shared.flushing);
        let target = lock(&self.shared.route).clone();
        if matches!(target, Route::Detached) {
            return Ok(0);
        }
        let payload = {
            let mut outgoing = lock(&self.shared.outgoing);
            if outgoing.limit() == 0 {
                return Ok(0);
            }
            outgoing.rewind();
            outgoing.drain()
        };
        let len = payload.len();
        match target {
            Route::Remote(tx) => tx
                .send(Bytes::from(payload))
                .map_err(|_| ProtocolError::ConnectionClosed)?,
            Route::Local { peer, generation } => {
                let peer = peer.upgrade().ok_or(ProtocolError::ConnectionClosed)?;
                Communicator { shared: peer }.deliver(generation, &payload);
            }
            Route::Detached => {}
        }
        trace!(len, "Flushed outgoing bytes");
        Ok(len)
    }

    /// Bind a socket writer. Returns the generation the transport must report with.
    pub(crate) fn attach_remote(&self, tx: mpsc::UnboundedSender<Bytes>) -> Result<u64> {
        self.attach(Route::Remote(tx))
    }

    /// Bind two in-process communicators to each other, each under a new generation
    pub(crate) fn attach_local(client: &Communicator, server: &Communicator) -> Result<()> {
        let client_generation = client.next_generation()?;
        let server_generation = server.next_generation()?;
        server.install_route(client.local_route(client_generation), server_generation);
        client.install_route(server.local_route(server_generation), client_generation);
        Ok(())
    }

    fn local_route(&self, generation: u64) -> Route {
        Route::Local {
            peer: Arc::downgrade(&self.shared),
            generation,
        }
    }

    fn link_local(&self, peer: &Communicator) {
        *lock(&self.shared.route) = peer.local_route(peer.shared.generation.load(Ordering::Acquire));
        self.shared.connected.store(true, Ordering::Release);
    }

    fn attach(&self, route: Route) -> Result<u64> {
        let generation = self.next_generation()?;
        self.install_route(route, generation);
        Ok(generation)
    }

    /// Retire whatever transport was bound and start a new generation with an empty inbox
    fn next_generation(&self) -> Result<u64> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        lock(&self.shared.inbox).clear();
        Ok(generation)
    }

    fn install_route(&self, route: Route, generation: u64) {
        let previous = std::mem::replace(&mut *lock(&self.shared.route), route);
        self.shared.connected.store(true, Ordering::Release);
        debug!(id = %self.id(), generation, "Transport attached");
        self.retire(previous);
        self.shared.wake.notify_one();
    }

    /// Drop the current transport while keeping the logical connection alive.
    ///
    /// Does not touch the inbox or outgoing buffers, so it is safe to call from inside a phase.
    pub fn detach(&self) {
        let previous = std::mem::replace(&mut *lock(&self.shared.route), Route::Detached);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        debug!(id = %self.id(), "Transport detached");
        self.retire(previous);
    }

    /// Close a local peer we just stopped routing to, if it still routes to us
    fn retire(&self, route: Route) {
        if let Route::Local { peer, .. } = route {
            if let Some(peer) = peer.upgrade() {
                let peer = Communicator { shared: peer };
                if peer.routes_to(self) {
                    peer.disconnect(None);
                }
            }
        }
    }

    fn routes_to(&self, other: &Communicator) -> bool {
        matches!(
            &*lock(&self.shared.route),
            Route::Local { peer, .. } if std::ptr::eq(peer.as_ptr(), Arc::as_ptr(&other.shared))
        )
    }

    /// Report that the transport bound under `generation` went away
    pub(crate) fn link_lost(&self, generation: u64, cause: DisconnectCause) {
        if generation == self.shared.generation.load(Ordering::Acquire) {
            self.disconnect(cause);
        } else {
            trace!(generation, "Retired transport closed");
        }
    }

    pub(crate) fn lock_buffers(&self) -> (MutexGuard<'_, Buffer>, MutexGuard<'_, Buffer>) {
        let inbox = lock(&self.shared.inbox);
        let outgoing = lock(&self.shared.outgoing);
        (inbox, outgoing)
    }

    /// Register a one-shot reader for the next frame on `channel`.
    ///
    /// Channel 0 carries initialization traffic and cannot be read this way.
    pub fn add_incoming<F>(&self, channel: u8, reader: F) -> Result<()>
    where
        F: FnOnce(Buffer) -> Result<()> + Send + 'static,
    {
        if channel == INIT_CHANNEL {
            return Err(ProtocolError::InitializationError(
                constants::ERR_RESERVED_CHANNEL.into(),
            ));
        }
        let ready = lock(&self.shared.incoming).register(channel, Box::new(reader))?;
        if let Some((reader, payload)) = ready {
            reader(payload)?;
        }
        Ok(())
    }

    /// Readers still waiting on `channel`
    pub fn pending_readers(&self, channel: u8) -> usize {
        lock(&self.shared.incoming).pending_readers(channel)
    }

    /// Frames on `channel` that arrived before any reader asked for them
    pub fn backlog_len(&self, channel: u8) -> usize {
        lock(&self.shared.incoming).backlog_len(channel)
    }

    /// Route every complete channel frame in the inbox to its reader.
    ///
    /// Does nothing until the communicator is authenticated. Returns the number of
    /// readers invoked.
    pub fn dispatch_incoming(&self) -> Result<usize> {
        if !self.is_authenticated() {
            return Ok(0);
        }
        let mut deliveries = Vec::new();
        {
            let mut inbox = lock(&self.shared.inbox);
            let mut incoming = lock(&self.shared.incoming);
            while let Some((channel, payload)) =
                frame::read_channel_frame(&mut inbox, self.shared.options.max_frame_size)?
            {
                if channel == INIT_CHANNEL {
                    return Err(ProtocolError::FramingError(
                        constants::ERR_RESERVED_CHANNEL.into(),
                    ));
                }
                if let Some(delivery) = incoming.offer(channel, payload)? {
                    deliveries.push(delivery);
                }
            }
        }
        let count = deliveries.len();
        for (reader, payload) in deliveries {
            reader(payload)?;
        }
        Ok(count)
    }

    /// Register a listener called once when the connection closes.
    ///
    /// If the communicator is already closed the listener runs immediately with the
    /// recorded cause.
    pub fn add_disconnected_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DisconnectCause) + Send + Sync + 'static,
    {
        let final_cause = lock(&self.shared.final_cause);
        match &*final_cause {
            Some(cause) => {
                let cause = cause.clone();
                drop(final_cause);
                listener(&cause);
                // Never stored, so there is nothing to unsubscribe later.
                ListenerId::detached()
            }
            None => self.shared.disconnected.subscribe(listener),
        }
    }

    pub fn remove_disconnected_listener(&self, id: ListenerId) -> bool {
        self.shared.disconnected.unsubscribe(id)
    }

    /// Close the connection. Only the first call has any effect.
    pub fn disconnect(&self, cause: DisconnectCause) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connected.store(false, Ordering::Release);
        let previous = std::mem::replace(&mut *lock(&self.shared.route), Route::Detached);

        match &cause {
            None => info!(id = %self.id(), endpoint = %self.endpoint(), "Communicator disconnected"),
            Some(error) => {
                warn!(id = %self.id(), endpoint = %self.endpoint(), error = %error, "Communicator disconnected with error")
            }
        }

        let listeners: Vec<Callback<DisconnectCause>> = {
            let mut final_cause = lock(&self.shared.final_cause);
            *final_cause = Some(cause.clone());
            self.shared.disconnected.drain()
        };
        for listener in listeners {
            listener(&cause);
        }

        lock(&self.shared.incoming).clear();
        self.shared.wake.notify_one();
        self.retire(previous);
    }

    /// Graceful disconnect
    pub fn close(&self) {
        self.disconnect(None);
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Decode a bincode payload received on a channel
pub fn decode_message<T: DeserializeOwned>(payload: &Buffer) -> Result<T> {
    Ok(bincode::deserialize(payload.remaining_slice())?)
}
