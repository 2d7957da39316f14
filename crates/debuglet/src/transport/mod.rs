//! Transports that feed client connections into a [`DebugService`].
//!
//! TCP accepts any number of clients, one session each. Stdio serves a single
//! session over the process's own stdin/stdout.
//!
//! [`DebugService`]: crate::service::DebugService

pub mod stdio;
pub mod tcp;

pub use stdio::serve_stdio;
pub use tcp::{ServerConfig, serve, serve_listener};
