//! Error types for the migration agent.
//!
//! Every failure the agent can hit maps onto one of these kinds, and every
//! kind maps onto a sysexits-style process exit code so that the
//! orchestrator driving repeated moves can tell usage mistakes, transport
//! failures and broken post-run invariants apart.

use std::io;
use thiserror::Error;

/// Process exit codes understood by the move orchestrator.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const CONFIG: i32 = 65;
    pub const SOFTWARE: i32 = 70;
    pub const OSERR: i32 = 71;
    pub const IOERR: i32 = 74;
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Transport-level read/write failure (non-retryable)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed header, unexpected opcode, or a violated wire contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A header advertised a body larger than the frame cap
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// SASL negotiation rejected by the server
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Per-pipe I/O watchdog or global liveness timer fired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid command line or unparseable selector
    #[error("{0}")]
    Usage(String),

    /// A post-run invariant did not hold
    #[error("Internal error: {0}")]
    Software(String),

    /// Stdin closed while running as an erlang port
    #[error("Standard input closed")]
    PortClosed,
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

impl MigrateError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    pub fn software(msg: impl Into<String>) -> Self {
        Self::Software(msg.into())
    }

    /// Exit code for a failure during the streaming phase.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_)
            | Self::Protocol(_)
            | Self::FrameTooLarge { .. }
            | Self::Timeout(_) => exit_code::IOERR,
            Self::Auth(_) => exit_code::CONFIG,
            Self::Usage(_) => exit_code::USAGE,
            Self::Software(_) => exit_code::SOFTWARE,
            Self::PortClosed => exit_code::OSERR,
        }
    }

    /// Exit code for a failure before the reactor has started.
    ///
    /// During setup a broken handshake means the endpoints are misconfigured,
    /// not that the stream died, so protocol and auth failures map to the
    /// configuration code instead.
    #[must_use]
    pub const fn setup_exit_code(&self) -> i32 {
        match self {
            Self::Protocol(_) | Self::Auth(_) | Self::FrameTooLarge { .. } => exit_code::CONFIG,
            _ => self.exit_code(),
        }
    }

}
