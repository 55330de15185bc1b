// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Crate-wide error type.
//!
//! Every fallible operation in the daemon returns [`Result`]. The variants
//! map onto the recovery policy: transport and timeout failures pause the
//! affected scan session, protocol violations abort it, configuration
//! errors refuse startup.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Daemon error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Invalid configuration file content (line number + reason).
    Config(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// Underlying socket operation failed.
    Io(io::Error),
    /// A bounded wait (poll / receive) expired without data.
    Timeout,
    /// Operation is not valid for this connection kind (e.g. peek on UDP).
    UnsupportedOp(&'static str),

    // ========================================================================
    // Protocol
    // ========================================================================
    /// The peer sent a message violating the scan protocol.
    Protocol(String),
    /// An SNMP exchange failed or the agent reported an error-status.
    Snmp(String),

    // ========================================================================
    // Runtime
    // ========================================================================
    /// Operation attempted in a state that does not allow it.
    InvalidState(&'static str),
    /// User hook could not be spawned.
    Hook(String),
}

impl Error {
    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// True if this error is the bounded-wait expiry (a normal outcome in
    /// the await-page state, an error everywhere else).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Timeout => write!(f, "operation timed out"),
            Error::UnsupportedOp(op) => {
                write!(f, "operation not supported on this connection: {}", op)
            }
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Snmp(msg) => write!(f, "SNMP error: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::Hook(msg) => write!(f, "hook error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}
