//! Error types for the container host daemon.
//!
//! Protocol and input failures never surface here: a malformed request is
//! answered with an `Error` message on its own session, and an unavailable
//! input device drops the event after logging. Both are resolved at the
//! call site by design.

use std::path::PathBuf;

/// Result type alias for host daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the host daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors (fatal at startup)
    // =========================================================================
    /// Malformed bind address or port.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A required startup input is missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// The rootfs directory is missing or has no init binary.
    #[error("rootfs not usable at {path}: {reason}")]
    RootfsUnusable { path: PathBuf, reason: String },

    // =========================================================================
    // Persistence Errors (degrade to defaults, never fatal)
    // =========================================================================
    /// Key-value store read/write failure.
    #[error("persistence failure: {0}")]
    Persistence(String),

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// A file payload could not be written during extraction.
    #[error("failed to extract entry '{entry}': {reason}")]
    Archive { entry: String, reason: String },

    /// The archive itself could not be opened or iterated.
    #[error("unreadable archive {path}: {reason}")]
    ArchiveUnreadable { path: PathBuf, reason: String },

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    /// The guest init process could not be spawned.
    #[error("failed to spawn container init: {0}")]
    SpawnFailed(String),

    /// The guest did not signal boot completion within the deadline, or
    /// exited before doing so.
    #[error("Server did not start within timeout")]
    BootTimeout,

    /// The loader symlink could not be created; the guest cannot boot.
    #[error("failed to link loader at {path}: {reason}")]
    LoaderLinkFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Filesystem or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
