//! Sockspipe Library
//!
//! Forwards local TCP connections to a fixed target through an upstream
//! SOCKS5 proxy, speaking the client side of the SOCKS5 handshake.

pub mod cli;
pub mod client;
pub mod config;
pub mod forward;
pub mod handshake;
pub mod server;
pub mod stream;
pub mod target;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types for convenience
pub use client::SocksClient;
pub use config::Config;
pub use handshake::{HandshakeState, Socks5Handshake};
pub use server::ForwardServer;
pub use target::TargetAddr;
