//! Async timeout helpers and the default durations used across the crate.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default budget for establishing a transport connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default budget for a whole initialization pipeline, reconnects included
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an idle update loop re-checks its connection
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// How long a migrating session waits for its client to come back
pub const RESUME_TTL: Duration = Duration::from_secs(30);

/// Await `future`, failing with [`ProtocolError::Timeout`] once `duration` elapses
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
