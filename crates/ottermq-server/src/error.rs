//! Server runtime error types.

use thiserror::Error;

/// Errors from the TCP runtime. Per-connection I/O failures never surface
/// here; they end the affected connection and are logged.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Bad startup configuration
    #[error("config error: {0}")]
    Config(String),

    /// Could not bind the listen address
    #[error("bind failed on {addr}: {source}")]
    Bind {
        /// The address that failed
        addr: String,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// The listener itself failed (fd exhaustion, socket revoked)
    #[error("listener failed: {0}")]
    Listener(std::io::Error),

    /// Other I/O at the server level
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
