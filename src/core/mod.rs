//! # Core Wire Components
//!
//! Low-level byte handling shared by every phase and transport.
//!
//! ## Components
//! - **Buffer**: growable, cursor-addressed binary buffer
//! - **Frame**: length-delimited framing for initialization and channel traffic
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Frame lengths are validated against a maximum before any allocation
//! - Partial frames are never consumed

pub mod buffer;
pub mod frame;
