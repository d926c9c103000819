//! # Error Types
//!
//! Error handling for the initialization pipeline and the services built on it.
//!
//! Every failure that can abort a handshake is a variant of [`ProtocolError`].
//! Phase failures bubble up to the pipeline runner, which disconnects the
//! communicator with the originating error as the cause. Because a cause is
//! published to many listeners and to every waiter of a failed future, it is
//! shared as `Arc<ProtocolError>`; [`ProtocolError::Shared`] carries such a
//! cause back to a caller and [`ProtocolError::root`] unwraps it.
//!
//! ## Error Categories
//! - **Framing**: malformed length headers, truncated or oversized frames
//! - **Initialization**: re-entrant runs, missing context keys, phase ordering bugs
//! - **Crypto**: cipher setup or key material failures
//! - **Reconnect**: transport failures while migrating to a new endpoint
//!
//! ## Example Usage
//! ```rust
//! use handshake_pipeline::core::buffer::Buffer;
//! use handshake_pipeline::error::{ProtocolError, Result};
//!
//! fn read_id(buf: &mut Buffer) -> Result<u32> {
//!     buf.get_u32()
//! }
//!
//! let mut empty = Buffer::new();
//! assert!(matches!(read_id(&mut empty), Err(ProtocolError::OutOfRange { .. })));
//! ```

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Pipeline errors
    pub const ERR_ALREADY_RUNNING: &str = "already running";
    pub const ERR_CONTEXT_TYPE: &str = "context value has an unexpected type";
    pub const ERR_PHASE_ORDER: &str = "phase ran out of order";

    /// Framing errors
    pub const ERR_TRUNCATED_FRAME: &str = "frame truncated";
    pub const ERR_FRAME_REWOUND: &str = "frame body moved the cursor before its header";
    pub const ERR_FRAME_TOO_LONG: &str = "frame body does not fit a 4-byte length";
    pub const ERR_EMPTY_CHANNEL_FRAME: &str = "channel frames need at least one payload byte";
    pub const ERR_RESERVED_CHANNEL: &str = "channel 0 is reserved for initialization traffic";
    pub const ERR_CHANNEL_BACKLOG: &str = "channel backlog is full";
    pub const ERR_INVALID_UTF8: &str = "string is not valid UTF-8";
    pub const ERR_HEADER_MISMATCH: &str = "envelope header does not match";

    /// Connection errors
    pub const ERR_NOT_AUTHENTICATED: &str = "communicator is not authenticated";
    pub const ERR_ALREADY_CLOSED: &str = "communicator was disconnected";
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "handshake did not complete in time";

    /// Session errors
    pub const ERR_UNKNOWN_SESSION: &str = "unknown session token";
    pub const ERR_SESSION_CAPACITY: &str = "session capacity reached";
    pub const ERR_IDENTITY_MISMATCH: &str = "server confirmed a different identity";

    /// Crypto errors
    pub const ERR_UNSUPPORTED_CIPHER: &str = "unsupported cipher transformation";
    pub const ERR_KEY_LENGTH: &str = "key material has the wrong length";
    pub const ERR_IV_LENGTH: &str = "IV length does not match the cipher";
    pub const ERR_RANDOM_SOURCE: &str = "system random source failed";

    /// Migration errors
    pub const ERR_MIGRATION_DISABLED: &str = "peer requested migration but no migrator is installed";
    pub const ERR_CROSS_HOST_MIGRATION: &str = "migration to a different host is not supported";
}

/// Primary error type for all pipeline and service operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Read of {requested} bytes past limit ({available} available)")]
    OutOfRange { requested: usize, available: usize },

    #[error("Framing error: {0}")]
    FramingError(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Context key missing: {0}")]
    ContextKeyMissing(&'static str),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Reconnect failed: {0}")]
    ReconnectError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Shared(Arc<ProtocolError>),
}

impl ProtocolError {
    /// Follow [`ProtocolError::Shared`] wrappers down to the originating error.
    pub fn root(&self) -> &ProtocolError {
        match self {
            ProtocolError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// True for the fail-fast error returned by a re-entrant pipeline run.
    pub fn is_already_running(&self) -> bool {
        matches!(self.root(), ProtocolError::InitializationError(msg) if msg == constants::ERR_ALREADY_RUNNING)
    }
}

impl From<Arc<ProtocolError>> for ProtocolError {
    fn from(cause: Arc<ProtocolError>) -> Self {
        ProtocolError::Shared(cause)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
