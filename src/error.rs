//! Error types for bootvm.
//!
//! All error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase (Rust convention for error messages)
//! - **Context**: include relevant identifiers (image id, path, port) when available
//!
//! Errors fall into four classes:
//!
//! - **Busy**: lock contention; callers report "in use" and never block.
//! - **Not found**: a cache entry or file is absent; many callers treat
//!   this as a valid non-error outcome.
//! - **Usage**: operations on a released guard or in the wrong VM state;
//!   defensively checked and returned as typed errors.
//! - **External**: installer, hypervisor, subprocess, or SSH failures;
//!   wrapped with context and surfaced, never silently retried.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using bootvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in bootvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lock / Cache Errors
    // ========================================================================
    /// Another process holds a conflicting lock on this cache entry.
    #[error("cache entry busy: {id}")]
    Busy {
        /// Image id (or prefix) whose entry is locked elsewhere.
        id: String,
    },

    /// Cache entry not found.
    #[error("cache entry not found: {id}")]
    EntryNotFound {
        /// Image id or prefix that matched nothing.
        id: String,
    },

    /// An image-id prefix matched more than one cache entry.
    #[error("ambiguous image prefix: {prefix} matches {count} entries")]
    AmbiguousPrefix {
        /// The prefix given by the user.
        prefix: String,
        /// How many entries matched.
        count: usize,
    },

    /// A guard operation was attempted after the guard was released.
    #[error("guard already released: {operation}")]
    GuardReleased {
        /// The operation that was attempted.
        operation: String,
    },

    /// An image id failed validation (wrong length or charset).
    #[error("invalid image id: {0}")]
    InvalidImageId(String),

    // ========================================================================
    // VM Lifecycle Errors
    // ========================================================================
    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The guest did not reach the running state within the boot timeout.
    #[error("vm boot timed out after {seconds}s: {name}")]
    BootTimeout {
        /// Domain/process name.
        name: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// SSH did not become reachable within the timeout.
    #[error("ssh not ready after {seconds}s on port {port}")]
    SshTimeout {
        /// Host-forwarded SSH port.
        port: u16,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// Hypervisor operation failed.
    #[error("hypervisor operation failed: {operation}: {reason}")]
    Hypervisor {
        /// The operation that failed (e.g., "define", "destroy").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Disk / Install Errors
    // ========================================================================
    /// The privileged install procedure failed.
    #[error("disk install failed: {0}")]
    Install(String),

    /// Disk not found at the expected path.
    #[error("disk not found: {}", path.display())]
    DiskNotFound {
        /// Path to the disk.
        path: PathBuf,
    },

    // ========================================================================
    // External Command Errors
    // ========================================================================
    /// External command failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message or reason for failure.
        reason: String,
    },

    /// Image resolution via the image facility failed.
    #[error("image resolution failed: {reference}: {reason}")]
    ImageResolve {
        /// The image reference being resolved.
        reference: String,
        /// The reason for the failure.
        reason: String,
    },

    // ========================================================================
    // Storage / State Errors
    // ========================================================================
    /// Cache or run-state storage operation failed.
    #[error("storage operation failed: {operation}: {reason}")]
    Storage {
        /// The operation that failed (e.g., "create directory", "read run state").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Relay proxy operation failed.
    #[error("relay proxy failed: {0}")]
    Proxy(String),

    // ========================================================================
    // IO / Serialization Errors
    // ========================================================================
    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error wrapper.
    #[error("json operation failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a busy error for a locked cache entry.
    pub fn busy(id: impl Into<String>) -> Self {
        Self::Busy { id: id.into() }
    }

    /// Create an entry-not-found error.
    pub fn entry_not_found(id: impl Into<String>) -> Self {
        Self::EntryNotFound { id: id.into() }
    }

    /// Create a guard-released error.
    pub fn guard_released(operation: impl Into<String>) -> Self {
        Self::GuardReleased {
            operation: operation.into(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a hypervisor operation error.
    pub fn hypervisor(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an install error.
    pub fn install(reason: impl Into<String>) -> Self {
        Self::Install(reason.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create an image resolution error.
    pub fn image_resolve(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImageResolve {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage operation error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a relay proxy error.
    pub fn proxy(reason: impl Into<String>) -> Self {
        Self::Proxy(reason.into())
    }

    /// Returns true if this error means "locked by another process".
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }

    /// Returns true if this error is any of the not-found class.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EntryNotFound { .. } | Error::DiskNotFound { .. }
        )
    }
}
