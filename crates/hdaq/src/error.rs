// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types of the runtime.
//!
//! Three families live here:
//!
//! - [`Error`]: recoverable failures returned by runtime calls.
//! - [`WaitError`]: outcome of a blocking wait that did not produce its value
//!   (timeout, module stop, port disconnect).
//! - [`FatalError`]: invariant violation that must halt the data path of the
//!   affected node. It replaces process termination; the integrating
//!   application decides on shutdown.

use std::fmt;

/// Result alias used across the runtime.
pub type Result<T> = core::result::Result<T, Error>;

/// Runtime error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid configuration value.
    Config(String),
    /// Unknown on-error policy string.
    InvalidPolicy(String),

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// No module registered under this name.
    ModuleNotFound(String),
    /// Module exists but has no port with this name.
    PortNotFound { module: String, port: String },
    /// No memory pool registered under this name.
    PoolNotFound(String),
    /// No worker thread registered under this name.
    ThreadNotFound(String),
    /// Name already taken by another module, pool or thread.
    AlreadyExists(String),

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Operation not permitted in the current module state.
    InvalidState(String),
    /// Port already bound to a transport.
    AlreadyConnected(String),

    // ========================================================================
    // Data Path Errors
    // ========================================================================
    /// Port has no transport.
    NotConnected(String),
    /// Output queue of the port is full.
    QueueFull(String),
    /// Memory pool cannot provide a block of the requested size.
    PoolExhausted { pool: String, size: usize },
    /// Access through a released buffer handle.
    BufferReleased,
    /// Mutable access requested on a buffer shared with other handles.
    BufferShared,
    /// Buffer capacity smaller than required.
    BufferTooSmall { need: usize, have: usize },

    // ========================================================================
    // Thread Errors
    // ========================================================================
    /// OS thread could not be spawned.
    ThreadSpawn(std::io::Error),
    /// Runtime was shut down, mailbox is closed.
    ShutDown,
    /// Reply did not arrive in time.
    Timeout(String),

    // ========================================================================
    // Fatal
    // ========================================================================
    /// Unrecoverable invariant violation.
    Fatal(FatalError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Configuration
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidPolicy(p) => write!(f, "Invalid on-error policy: {}", p),
            // Registry
            Error::ModuleNotFound(name) => write!(f, "Module not found: {}", name),
            Error::PortNotFound { module, port } => {
                write!(f, "Port not found: {}/{}", module, port)
            }
            Error::PoolNotFound(name) => write!(f, "Memory pool not found: {}", name),
            Error::ThreadNotFound(name) => write!(f, "Thread not found: {}", name),
            Error::AlreadyExists(name) => write!(f, "Name already in use: {}", name),
            // State
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::AlreadyConnected(port) => write!(f, "Port already connected: {}", port),
            // Data path
            Error::NotConnected(port) => write!(f, "Port not connected: {}", port),
            Error::QueueFull(port) => write!(f, "Output queue full: {}", port),
            Error::PoolExhausted { pool, size } => {
                write!(f, "Pool {} has no buffer of {} bytes", pool, size)
            }
            Error::BufferReleased => write!(f, "Buffer handle already released"),
            Error::BufferShared => write!(f, "Buffer is shared, mutable access denied"),
            Error::BufferTooSmall { need, have } => {
                write!(f, "Buffer too small: need {} bytes, have {}", need, have)
            }
            // Threads
            Error::ThreadSpawn(e) => write!(f, "Thread spawn failed: {}", e),
            Error::ShutDown => write!(f, "Runtime is shut down"),
            Error::Timeout(what) => write!(f, "Timeout: {}", what),
            // Fatal
            Error::Fatal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FatalError> for Error {
    fn from(e: FatalError) -> Self {
        Error::Fatal(e)
    }
}

/// Unrecoverable invariant violation on the data path.
///
/// Raised instead of aborting the process: oversized merged event, missing
/// buffer where one is structurally required, size mismatch when closing an
/// event. Once raised through [`crate::RuntimeContext::raise_fatal`] every
/// module of the context is stopped.
#[must_use = "fatal errors must halt the data path"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub component: String,
    pub reason: String,
}

impl FatalError {
    pub fn new(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fatal error in {}: {}", self.component, self.reason)
    }
}

impl std::error::Error for FatalError {}

/// Outcome of a blocking wait that did not produce its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// Deadline reached.
    TimedOut,
    /// Owning module was stopped; unwinds the main loop.
    Stopped,
    /// Awaited port lost its transport.
    Disconnected(String),
    /// Other failure (unknown item, fatal condition).
    Failed(String),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "wait timed out"),
            WaitError::Stopped => write!(f, "module stopped"),
            WaitError::Disconnected(port) => write!(f, "port {} disconnected", port),
            WaitError::Failed(msg) => write!(f, "wait failed: {}", msg),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<FatalError> for WaitError {
    fn from(e: FatalError) -> Self {
        WaitError::Failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::PoolExhausted {
            pool: "Pool".into(),
            size: 1024,
        };
        assert_eq!(e.to_string(), "Pool Pool has no buffer of 1024 bytes");

        let e = Error::PortNotFound {
            module: "Builder".into(),
            port: "Input3".into(),
        };
        assert_eq!(e.to_string(), "Port not found: Builder/Input3");
    }

    #[test]
    fn test_fatal_converts() {
        let fatal = FatalError::new("Builder", "single event does not fit");
        let err: Error = fatal.clone().into();
        assert!(matches!(err, Error::Fatal(ref f) if *f == fatal));
        assert_eq!(
            WaitError::from(fatal),
            WaitError::Failed("Fatal error in Builder: single event does not fit".into())
        );
    }
}
