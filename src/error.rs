//! Error types for the sandbox execution engine.

use std::time::Duration;

/// Result type alias for sandbox engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sandbox execution engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration (fatal at startup).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed frame or misplaced response terminator. The instance is
    /// presumed corrupted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No completion terminator within the configured window.
    ///
    /// Carries whatever partial output was buffered, for diagnosis.
    #[error("no response within {duration:?}\noutput: {output}\ndiagnostics: {diagnostics}")]
    Timeout {
        duration: Duration,
        output: String,
        diagnostics: String,
    },

    // =========================================================================
    // Instance Lifecycle Errors
    // =========================================================================
    /// Instance creation failed.
    #[error("failed to create instance: {reason}")]
    CreateFailed { reason: String },

    /// Writable layer grew past the configured ceiling.
    #[error("instance '{id}' exceeded writable-layer quota: {used} > {limit} bytes")]
    Quota { id: String, used: u64, limit: u64 },

    /// Operation attempted from an unexpected cached state. Raised as a
    /// defect signal, never silently corrected.
    #[error("instance '{id}' is in state '{state}', expected '{expected}'")]
    StateInvariant {
        id: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Metadata Errors
    // =========================================================================
    /// Tag mapping carries a schema version this build does not understand.
    #[error("unsupported metadata schema version: {found} (supported: {supported})")]
    SchemaVersion { found: String, supported: u32 },

    /// Tag mapping is missing a required key.
    #[error("metadata tag missing: {0}")]
    TagMissing(&'static str),

    /// Tag value failed to parse.
    #[error("metadata tag '{key}' is malformed: {reason}")]
    TagMalformed { key: &'static str, reason: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// No instance matched the reference.
    #[error("no instance matches '{0}'")]
    NotFound(String),

    /// More than one instance matched the reference.
    #[error("'{reference}' is ambiguous: matches {}", candidates.join(", "))]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },

    // =========================================================================
    // Admission Queue Errors
    // =========================================================================
    /// Queue lifecycle misuse (programmer error).
    #[error("admission queue cannot {operation} while {state}")]
    Lifecycle { operation: String, state: String },

    /// Operation submitted after the queue stopped admitting work.
    #[error("admission queue is not accepting work ({state})")]
    QueueClosed { state: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// The runtime provider reported a failure.
    #[error("runtime provider error: {0}")]
    Provider(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a provider-side failure.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}
