//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, metrics, and timing.
//!
//! ## Components
//! - **Crypto**: ChaCha20 / XChaCha20 stream ciphers and secure random bytes
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers and default durations
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for key material (zeroize crate)

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod timeout;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// None of the guarded state can be left half-updated by a panic in a way that
/// matters more than losing the connection, so poisoning is not propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
