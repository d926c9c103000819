//! # Initialization Pipeline Runner
//!
//! Drives a connection's queue of [`Phase`]s one step per [`Initializer::run`] call.
//!
//! ## Algorithm
//! 1. Take the front phase. A guarded phase whose predicate is false is skipped.
//! 2. A producer runs unconditionally and is popped.
//! 3. A consumer runs against the inbox. When it reports complete it is popped;
//!    otherwise it stays at the front and the run reports [`RunResult::AwaitingData`].
//! 4. Phases scheduled with [`PhaseIo::then`] are placed right behind the current one.
//! 5. The run reports [`RunResult::PendingNext`] while phases remain and
//!    [`RunResult::Finished`] once the queue is empty.
//!
//! ## Failure
//! Any phase error aborts the pipeline: the remaining phases are dropped and the
//! communicator is disconnected with the error as its cause. The same cause is
//! returned to the caller as [`ProtocolError::Shared`].
//!
//! ## Concurrency
//! Exactly one run may be in flight. A re-entrant call fails fast with
//! `InitializationError("already running")` and touches nothing. Phase installation
//! from other threads (`add_*`, `clear_phases`) serializes on the pipeline mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, trace, warn};

use crate::communicator::Communicator;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::context::InitContext;
use crate::protocol::phase::{Phase, PhaseIo, PhaseKind};
use crate::utils::lock;

/// Outcome of one [`Initializer::run`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The queue is empty
    Finished,
    /// A phase completed and more are queued; run again without waiting for I/O
    PendingNext,
    /// The front consumer needs more inbound bytes
    AwaitingData,
}

#[derive(Default)]
struct PipelineState {
    phases: VecDeque<Phase>,
    context: InitContext,
}

/// Phase queue, shared context and runner for one communicator
pub struct Initializer {
    communicator: Communicator,
    running: AtomicBool,
    state: Mutex<PipelineState>,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ProtocolError::InitializationError(constants::ERR_ALREADY_RUNNING.into()))?;
        Ok(Self(flag))
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Initializer {
    pub fn new(communicator: Communicator) -> Self {
        Self {
            communicator,
            running: AtomicBool::new(false),
            state: Mutex::new(PipelineState::default()),
        }
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn add_phase(&self, phase: Phase) {
        lock(&self.state).phases.push_back(phase);
    }

    pub fn add_phases(&self, phases: impl IntoIterator<Item = Phase>) {
        lock(&self.state).phases.extend(phases);
    }

    pub fn add_consumer<F>(&self, label: &'static str, body: F)
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        self.add_phase(Phase::consumer(label, body));
    }

    pub fn add_producer<F>(&self, label: &'static str, body: F)
    where
        F: Fn(&mut PhaseIo<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::producer(label, body));
    }

    pub fn add_config<F>(&self, label: &'static str, body: F)
    where
        F: Fn(&mut InitContext, &Communicator) -> Result<()> + Send + Sync + 'static,
    {
        self.add_phase(Phase::config(label, body));
    }

    /// Drop every queued phase, keeping the context
    pub fn clear_phases(&self) {
        lock(&self.state).phases.clear();
    }

    /// Drop every queued phase and the context, ready for re-initialization
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.phases.clear();
        state.context.clear();
    }

    /// Replace the queue in one step, so a concurrent run never sees a half-installed pipeline
    pub fn install(&self, phases: impl IntoIterator<Item = Phase>) {
        let mut state = lock(&self.state);
        state.phases.clear();
        state.context.clear();
        state.phases.extend(phases);
    }

    pub fn pending_phases(&self) -> usize {
        lock(&self.state).phases.len()
    }

    /// Labels of the queued phases, front first
    pub fn phase_labels(&self) -> Vec<&'static str> {
        lock(&self.state).phases.iter().map(Phase::label).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Read the context under the pipeline lock
    pub fn with_context<R>(&self, f: impl FnOnce(&mut InitContext) -> R) -> R {
        f(&mut lock(&self.state).context)
    }

    /// Hand the context to the application, leaving an empty one behind
    pub fn take_context(&self) -> InitContext {
        std::mem::take(&mut lock(&self.state).context)
    }

    /// Advance the pipeline by at most one phase
    #[instrument(level = "trace", skip(self), fields(id = %self.communicator.id()))]
    pub fn run(&self) -> Result<RunResult> {
        let _running = RunningFlag::acquire(&self.running)?;
        if self.communicator.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        match self.step() {
            Ok(result) => Ok(result),
            Err(error) => {
                warn!(id = %self.communicator.id(), error = %error, "Initialization phase failed");
                lock(&self.state).phases.clear();
                let cause = Arc::new(error);
                self.communicator.disconnect(Some(Arc::clone(&cause)));
                Err(ProtocolError::Shared(cause))
            }
        }
    }

    /// Call [`Initializer::run`] until it stops reporting [`RunResult::PendingNext`]
    pub fn run_until_blocked(&self) -> Result<RunResult> {
        loop {
            match self.run()? {
                RunResult::PendingNext => continue,
                other => return Ok(other),
            }
        }
    }

    fn step(&self) -> Result<RunResult> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let Some(mut phase) = state.phases.pop_front() else {
            return Ok(RunResult::Finished);
        };

        if let Some(predicate) = phase.guard() {
            if !predicate(&state.context) {
                debug!(phase = phase.label(), "Skipping guarded phase");
                return Ok(Self::after_completion(&state.phases));
            }
        }

        let mut inserted = Vec::new();
        let complete = {
            let (mut inbox, mut outgoing) = self.communicator.lock_buffers();
            let mut io = PhaseIo::new(
                &mut state.context,
                &mut inbox,
                &mut outgoing,
                &self.communicator,
                &mut inserted,
            );
            match phase.kind() {
                PhaseKind::Producer(body) => {
                    body(&mut io)?;
                    true
                }
                PhaseKind::Consumer(body) => body(&mut io)?,
            }
        };

        for follow_up in inserted.into_iter().rev() {
            state.phases.push_front(follow_up);
        }

        if complete {
            trace!(phase = phase.label(), "Phase complete");
            Ok(Self::after_completion(&state.phases))
        } else {
            // The guard already held; it is not re-evaluated on retry.
            phase.clear_guard();
            state.phases.push_front(phase);
            Ok(RunResult::AwaitingData)
        }
    }

    fn after_completion(phases: &VecDeque<Phase>) -> RunResult {
        if phases.is_empty() {
            RunResult::Finished
        } else {
            RunResult::PendingNext
        }
    }
}
