//! # Services
//!
//! Runtime pieces that sit on top of the initialization protocol:
//! - [`driver`]: per-connection update loop
//! - [`server`]: accept loops and per-connection handshakes
//! - [`client`]: connect/authenticate/migrate for one logical connection
//! - [`registry`]: server-side session ids, resumption tokens and migration parking

pub mod client;
pub mod driver;
pub mod registry;
pub mod server;

pub use client::{Client, ClientStage};
pub use driver::ConnectionDriver;
pub use registry::SessionRegistry;
pub use server::{ReadyHook, Server};
