//! # Initialization Protocol
//!
//! Everything that runs between "transport attached" and "authenticated":
//! - [`phase`]: consumer/producer steps and the I/O view they run against
//! - [`context`]: typed values shared by the phases of one run
//! - [`pipeline`]: the per-connection runner
//! - [`handshake`]: the client and server identity/migration sequences
//! - [`session_key`]: symmetric-key bootstrap and encrypted envelopes

pub mod context;
pub mod handshake;
pub mod phase;
pub mod pipeline;
pub mod session_key;

pub use context::{ContextKey, InitContext};
pub use handshake::{ClientHandshake, Identity, Migrator, ServerHandshake, SessionDirectory};
pub use phase::{Phase, PhaseIo, PhaseKind};
pub use pipeline::{Initializer, RunResult};

#[cfg(test)]
mod tests;
