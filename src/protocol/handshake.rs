//! # Handshake Phase Sequences
//!
//! Builds the client and server pipelines that take a fresh transport to an
//! authenticated communicator.
//!
//! ## Client
//! 1. **hello**: `[bool fresh]`, then `[len][token]` when resuming
//! 2. **identity**: reads `[u32 id][len][token]` and adopts the id
//! 3. application phases
//! 4. **ack**: `[bool migrate]`, then `[u32 port]` when migrating. "Ready" authenticates;
//!    "migrate" reconnects to the new port, replays the token, re-reads the identity and
//!    returns to this step.
//!
//! ## Server
//! The mirror image: read hello (register or resume), send identity, application phases
//! (skipped for a session arriving from a migration), send ack.
//!
//! Sessions are tracked behind [`SessionDirectory`]; moving a client to another port is
//! delegated to a [`Migrator`]. Neither is a process-wide singleton.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::communicator::{Communicator, ConnectionId};
use crate::core::buffer::Buffer;
use crate::core::frame;
use crate::error::{constants, ProtocolError, Result};
use crate::future::Pending;
use crate::protocol::context::{ContextKey, InitContext};
use crate::protocol::phase::{Phase, PhaseIo};

/// Whether this run started a new session (`false` when resuming one)
pub const FRESH: ContextKey<bool> = ContextKey::new("handshake.fresh");

/// Identity issued by the server for this run
pub const IDENTITY: ContextKey<Identity> = ContextKey::new("handshake.identity");

/// Server side: the resumed session arrived through a migration
pub const MIGRATED: ContextKey<bool> = ContextKey::new("handshake.migrated");

/// Logical identity of a session: connection id plus an opaque resumption token
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: ConnectionId,
    pub token: Vec<u8>,
}

impl Identity {
    pub fn encode(&self, out: &mut Buffer) -> Result<()> {
        out.put_u32(self.id.0);
        out.put_blob(&self.token)
    }

    pub fn decode(input: &mut Buffer) -> Result<Self> {
        let id = ConnectionId(input.get_u32()?);
        let token = input.get_blob()?;
        Ok(Self { id, token })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("token_len", &self.token.len())
            .finish()
    }
}

/// First client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    Fresh,
    Resume(Vec<u8>),
}

impl Hello {
    pub fn encode(&self, out: &mut Buffer) -> Result<()> {
        match self {
            Hello::Fresh => {
                out.put_bool(true);
                Ok(())
            }
            Hello::Resume(token) => {
                out.put_bool(false);
                out.put_blob(token)
            }
        }
    }

    pub fn decode(input: &mut Buffer) -> Result<Self> {
        if input.get_bool()? {
            Ok(Hello::Fresh)
        } else {
            Ok(Hello::Resume(input.get_blob()?))
        }
    }
}

/// Final server frame of a handshake round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ready,
    Migrate(u16),
}

impl Ack {
    pub fn encode(&self, out: &mut Buffer) {
        match *self {
            Ack::Ready => out.put_bool(false),
            Ack::Migrate(port) => {
                out.put_bool(true);
                out.put_u32(u32::from(port));
            }
        }
    }

    pub fn decode(input: &mut Buffer) -> Result<Self> {
        if !input.get_bool()? {
            return Ok(Ack::Ready);
        }
        let port = input.get_u32()?;
        u16::try_from(port)
            .map(Ack::Migrate)
            .map_err(|_| ProtocolError::FramingError(format!("migration port {port} out of range")))
    }
}

/// Moves a live communicator to another port on the same host
pub trait Migrator: Send + Sync {
    /// Drop the current transport and start connecting to `port`.
    ///
    /// The returned [`Pending`] resolves once the new transport is attached. This runs
    /// inside a phase while the communicator's buffers are locked, so it must neither
    /// block nor attach the new transport before returning.
    fn migrate(&self, communicator: &Communicator, port: u16) -> Result<Pending<()>>;
}

/// Result of re-associating a resumed session
#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: Identity,
    /// The session was parked by a migration instruction
    pub migrated: bool,
}

/// Server-side session bookkeeping consulted by the handshake
pub trait SessionDirectory: Send + Sync {
    /// Allocate an identity for a new session bound to `communicator`
    fn register(&self, communicator: &Communicator) -> Result<Identity>;

    /// Re-associate the session holding `token` with `communicator`
    fn resume(&self, token: &[u8], communicator: &Communicator) -> Result<Admission>;

    /// Keep the session alive while its client reconnects elsewhere
    fn mark_migrating(&self, id: ConnectionId) -> Result<()>;
}

/// Decode one channel-0 frame, or `None` while it is still partial
fn read_message<T>(
    io: &mut PhaseIo<'_>,
    decode: impl FnOnce(&mut Buffer) -> Result<T>,
) -> Result<Option<T>> {
    let Some(mut body) = io.read_frame()? else {
        return Ok(None);
    };
    let message = decode(&mut body).map_err(frame::short_read)?;
    frame::expect_consumed(&body)?;
    Ok(Some(message))
}

fn is_fresh(context: &InitContext) -> bool {
    context.try_get(FRESH).copied().unwrap_or(false)
}

fn is_migrated(context: &InitContext) -> bool {
    context.try_get(MIGRATED).copied().unwrap_or(false)
}

/// Run `phase` only for a brand-new session
pub fn fresh_only(phase: Phase) -> Phase {
    phase.and_when(is_fresh)
}

/// Run `phase` only when resuming an existing session
pub fn resumed_only(phase: Phase) -> Phase {
    phase.and_when(|context| !is_fresh(context))
}

/// Client pipeline definition; cheap to clone into every connection attempt
#[derive(Clone, Default)]
pub struct ClientHandshake {
    resume: Option<Vec<u8>>,
    app: Vec<Phase>,
    migrator: Option<Arc<dyn Migrator>>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume the session identified by `token` instead of starting a new one
    pub fn resume_with(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.resume = Some(token.into());
        self
    }

    /// Accept migration instructions, carried out by `migrator`
    pub fn migrator(mut self, migrator: Arc<dyn Migrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    pub fn add_phase(mut self, phase: Phase) -> Self {
        self.app.push(phase);
        self
    }

    pub fn add_consumer<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        self.add_phase(Phase::consumer(label, body))
    }

    pub fn add_producer<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::producer(label, body))
    }

    pub fn add_config<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut InitContext, &Communicator) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::config(label, body))
    }

    pub fn has_migrator(&self) -> bool {
        self.migrator.is_some()
    }

    /// The full phase list to install on an initializer
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = Vec::with_capacity(self.app.len() + 3);
        phases.push(client_hello(self.resume.clone()));
        phases.push(client_identity());
        phases.extend(self.app.iter().cloned());
        phases.push(client_ack(self.migrator.clone()));
        phases
    }
}

fn client_hello(resume: Option<Vec<u8>>) -> Phase {
    Phase::producer("client.hello", move |io| {
        let hello = match &resume {
            Some(token) => Hello::Resume(token.clone()),
            None => Hello::Fresh,
        };
        io.write_frame(|out| hello.encode(out))?;
        io.context.insert(FRESH, resume.is_none());
        Ok(())
    })
}

fn client_identity() -> Phase {
    Phase::consumer("client.identity", |io| {
        let Some(identity) = read_message(io, Identity::decode)? else {
            return Ok(false);
        };
        debug!(id = %identity.id, "Received identity");
        io.communicator.set_id(identity.id);
        io.context.insert(IDENTITY, identity);
        Ok(true)
    })
}

fn client_ack(migrator: Option<Arc<dyn Migrator>>) -> Phase {
    Phase::consumer("client.ack", move |io| {
        let Some(ack) = read_message(io, Ack::decode)? else {
            return Ok(false);
        };
        match ack {
            Ack::Ready => io.communicator.set_authenticated(),
            Ack::Migrate(port) => {
                let Some(migrator) = &migrator else {
                    return Err(ProtocolError::ReconnectError(
                        constants::ERR_MIGRATION_DISABLED.into(),
                    ));
                };
                info!(id = %io.communicator.id(), port, "Server requested migration");
                let reconnect = migrator.migrate(io.communicator, port)?;
                io.then(await_reconnect(reconnect));
                io.then(resume_hello());
                io.then(confirm_identity());
                io.then(client_ack(Some(Arc::clone(migrator))));
            }
        }
        Ok(true)
    })
}

fn await_reconnect(reconnect: Pending<()>) -> Phase {
    Phase::consumer("client.await_reconnect", move |_io| match reconnect.try_result() {
        None => Ok(false),
        Some(Ok(())) => Ok(true),
        Some(Err(error)) => match error.root() {
            ProtocolError::Cancelled => Err(ProtocolError::Cancelled),
            root => Err(ProtocolError::ReconnectError(root.to_string())),
        },
    })
}

fn resume_hello() -> Phase {
    Phase::producer("client.resume_hello", |io| {
        let token = io.context.get(IDENTITY)?.token.clone();
        io.write_frame(|out| Hello::Resume(token).encode(out))
    })
}

fn confirm_identity() -> Phase {
    Phase::consumer("client.identity_confirm", |io| {
        let Some(confirmed) = read_message(io, Identity::decode)? else {
            return Ok(false);
        };
        let expected = io.context.get(IDENTITY)?.id;
        if confirmed.id != expected {
            return Err(ProtocolError::ReconnectError(format!(
                "{}: expected {expected}, got {}",
                constants::ERR_IDENTITY_MISMATCH,
                confirmed.id
            )));
        }
        debug!(id = %confirmed.id, "Identity confirmed after reconnect");
        io.context.insert(IDENTITY, confirmed);
        Ok(true)
    })
}

/// Server pipeline definition
#[derive(Clone)]
pub struct ServerHandshake {
    directory: Arc<dyn SessionDirectory>,
    migrate_to: Option<u16>,
    app: Vec<Phase>,
}

impl ServerHandshake {
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            directory,
            migrate_to: None,
            app: Vec::new(),
        }
    }

    /// Send fresh sessions to `port` instead of acknowledging them here
    pub fn migrate_to(mut self, port: u16) -> Self {
        self.migrate_to = Some(port);
        self
    }

    pub fn add_phase(mut self, phase: Phase) -> Self {
        self.app.push(phase);
        self
    }

    pub fn add_consumer<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        self.add_phase(Phase::consumer(label, body))
    }

    pub fn add_producer<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::producer(label, body))
    }

    pub fn add_config<F>(self, label: &'static str, body: F) -> Self
    where
        F: Fn(&mut InitContext, &Communicator) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::config(label, body))
    }

    pub fn directory(&self) -> &Arc<dyn SessionDirectory> {
        &self.directory
    }

    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = Vec::with_capacity(self.app.len() + 3);
        phases.push(server_hello(Arc::clone(&self.directory)));
        phases.push(server_identity());
        // A migrated client already ran these against the first port.
        phases.extend(
            self.app
                .iter()
                .cloned()
                .map(|phase| phase.and_when(|context| !is_migrated(context))),
        );
        phases.push(server_ack(Arc::clone(&self.directory), self.migrate_to));
        phases
    }
}

fn server_hello(directory: Arc<dyn SessionDirectory>) -> Phase {
    Phase::consumer("server.hello", move |io| {
        let Some(hello) = read_message(io, Hello::decode)? else {
            return Ok(false);
        };
        let (identity, fresh, migrated) = match hello {
            Hello::Fresh => (directory.register(io.communicator)?, true, false),
            Hello::Resume(token) => {
                let admission = directory.resume(&token, io.communicator)?;
                (admission.identity, false, admission.migrated)
            }
        };
        debug!(id = %identity.id, fresh, migrated, "Session admitted");
        io.communicator.set_id(identity.id);
        io.context.insert(FRESH, fresh);
        io.context.insert(MIGRATED, migrated);
        io.context.insert(IDENTITY, identity);
        Ok(true)
    })
}

fn server_identity() -> Phase {
    Phase::producer("server.identity", |io| {
        let identity = io.context.get(IDENTITY)?.clone();
        io.write_frame(|out| identity.encode(out))
    })
}

fn server_ack(directory: Arc<dyn SessionDirectory>, migrate_to: Option<u16>) -> Phase {
    Phase::producer("server.ack", move |io| {
        let ack = match migrate_to {
            Some(port) if is_fresh(io.context) => Ack::Migrate(port),
            _ => Ack::Ready,
        };
        io.write_frame(|out| {
            ack.encode(out);
            Ok(())
        })?;
        match ack {
            Ack::Migrate(port) => {
                let id = io.context.get(IDENTITY)?.id;
                directory.mark_migrating(id)?;
                info!(%id, port, "Instructed client to migrate");
            }
            Ack::Ready => io.communicator.set_authenticated(),
        }
        Ok(())
    })
}
