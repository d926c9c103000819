//! # Initialization Phases
//!
//! One discrete step of an initialization pipeline.
//!
//! A phase is either a **consumer** (reads the inbox, may also write; reports whether it
//! is complete) or a **producer** (writes once, always complete). The runner matches on
//! [`PhaseKind`] exhaustively; there are no other variants.
//!
//! Phase bodies are shared closures so a handshake definition can be cloned into every
//! connection's pipeline. A consumer may be invoked many times before it completes and
//! must not consume a partial frame; [`PhaseIo::read_frame`] takes care of that.
//!
//! ## Re-entrancy
//! While a phase runs, the pipeline holds its own lock and the communicator's inbox and
//! outgoing buffers. Phases therefore write through [`PhaseIo`] and schedule follow-ups
//! with [`PhaseIo::then`]; calling buffer methods on the communicator (`send`, `flush`)
//! or adding phases to the pipeline from inside a phase would deadlock.

use std::fmt;
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::core::buffer::Buffer;
use crate::core::frame;
use crate::error::Result;
use crate::protocol::context::InitContext;

/// Body of a consumer phase; returns `true` once the phase is complete
pub type ConsumeFn = Arc<dyn Fn(&mut PhaseIo<'_>) -> Result<bool> + Send + Sync>;

/// Body of a producer phase
pub type ProduceFn = Arc<dyn Fn(&mut PhaseIo<'_>) -> Result<()> + Send + Sync>;

/// Predicate deciding whether a phase runs at all
pub type Guard = Arc<dyn Fn(&InitContext) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum PhaseKind {
    Consumer(ConsumeFn),
    Producer(ProduceFn),
}

/// A labelled, optionally guarded pipeline step
#[derive(Clone)]
pub struct Phase {
    label: &'static str,
    kind: PhaseKind,
    guard: Option<Guard>,
}

impl Phase {
    pub fn consumer<F>(label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            label,
            kind: PhaseKind::Consumer(Arc::new(body)),
            guard: None,
        }
    }

    pub fn producer<F>(label: &'static str, body: F) -> Self
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            label,
            kind: PhaseKind::Producer(Arc::new(body)),
            guard: None,
        }
    }

    /// A producer that only touches local state: the context or the communicator
    pub fn config<F>(label: &'static str, body: F) -> Self
    where
        F: Fn(&mut InitContext, &Communicator) -> Result<()> + Send + Sync + 'static,
    {
        Self::producer(label, move |io| body(&mut *io.context, io.communicator))
    }

    /// Run this phase only when `guard` holds for the context at the time the phase
    /// reaches the front of the queue; otherwise it is skipped as complete.
    pub fn when<G>(mut self, guard: G) -> Self
    where
        G: Fn(&InitContext) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Like [`Phase::when`], but keeps any guard already present: both must hold
    pub fn and_when<G>(self, guard: G) -> Self
    where
        G: Fn(&InitContext) -> bool + Send + Sync + 'static,
    {
        match self.guard.clone() {
            None => self.when(guard),
            Some(existing) => self.when(move |context| existing(context) && guard(context)),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn kind(&self) -> &PhaseKind {
        &self.kind
    }

    pub fn is_consumer(&self) -> bool {
        matches!(self.kind, PhaseKind::Consumer(_))
    }

    pub(crate) fn guard(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    pub(crate) fn clear_guard(&mut self) {
        self.guard = None;
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PhaseKind::Consumer(_) => "consumer",
            PhaseKind::Producer(_) => "producer",
        };
        f.debug_struct("Phase")
            .field("label", &self.label)
            .field("kind", &kind)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Everything a phase may touch while it runs
pub struct PhaseIo<'a> {
    pub context: &'a mut InitContext,
    pub inbox: &'a mut Buffer,
    pub outgoing: &'a mut Buffer,
    pub communicator: &'a Communicator,
    pub(crate) inserted: &'a mut Vec<Phase>,
}

impl<'a> PhaseIo<'a> {
    pub(crate) fn new(
        context: &'a mut InitContext,
        inbox: &'a mut Buffer,
        outgoing: &'a mut Buffer,
        communicator: &'a Communicator,
        inserted: &'a mut Vec<Phase>,
    ) -> Self {
        Self {
            context,
            inbox,
            outgoing,
            communicator,
            inserted,
        }
    }

    /// Pop the next complete channel-0 frame, or `None` while it is still partial
    pub fn read_frame(&mut self) -> Result<Option<Buffer>> {
        frame::read_frame(self.inbox, self.communicator.options().max_frame_size)
    }

    /// Write one channel-0 frame whose body is encoded by `body`
    pub fn write_frame<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Buffer) -> Result<()>,
    {
        frame::write_frame_with(self.outgoing, body)
    }

    /// Schedule `phase` to run right after the current one.
    ///
    /// Several calls keep their order: the first scheduled phase runs first.
    pub fn then(&mut self, phase: Phase) {
        self.inserted.push(phase);
    }
}
