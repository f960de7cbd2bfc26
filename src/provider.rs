//! Runtime provider contract.
//!
//! The engine never touches isolation primitives directly. Everything it
//! needs from the underlying runtime — namespaced processes, filesystem
//! layering, checkpoint/restore, attach streams — is consumed through the
//! [`RuntimeProvider`] trait, the narrow seam a backend implements.
//!
//! Checkpoint/restore support on the host is an operational precondition:
//! the contract requires it, and callers are expected to verify the
//! capability before starting the engine.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// Create Spec
// =============================================================================

/// Parameters for creating one sandbox resource.
///
/// Tags are a flat immutable string→string mapping set at creation; the
/// engine serializes [`SandboxMetadata`] into them and never updates them
/// afterwards.
///
/// [`SandboxMetadata`]: crate::metadata::SandboxMetadata
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Immutable tag mapping.
    pub tags: HashMap<String, String>,
    /// Memory ceiling in bytes, swap included.
    pub memory_bytes: u64,
    /// Maximum processes/threads.
    pub pids_limit: u32,
    /// Open-file limits (soft, hard).
    pub open_files: (u32, u32),
    /// Whether the resource gets network access. Always false for
    /// untrusted programs.
    pub network: bool,
}

// =============================================================================
// Inspect Report
// =============================================================================

/// Snapshot of a resource's live state.
#[derive(Debug, Clone)]
pub struct InspectReport {
    /// Whether the resource's process tree is currently running.
    pub running: bool,
    /// Bytes used by the resource's writable filesystem layer.
    pub writable_layer_bytes: u64,
    /// The immutable tag mapping set at creation.
    pub tags: HashMap<String, String>,
}

// =============================================================================
// Attach Stream
// =============================================================================

/// One duplexed byte stream attached to a running resource.
///
/// The provider demultiplexes the resource's combined output into the
/// primary `output` half (terminator-framed responses) and the secondary
/// `diagnostic` half (best-effort text).
pub struct AttachStream {
    /// Write half feeding the resource's stdin.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Primary output half.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Diagnostic output half.
    pub diagnostic: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for AttachStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachStream").finish_non_exhaustive()
    }
}

// =============================================================================
// Runtime Provider Trait
// =============================================================================

/// Contract the engine requires from an isolation runtime.
///
/// Implementations must be `Send + Sync`; the engine serializes operations
/// against any single resource itself, but distinct resources are driven
/// concurrently up to the admission bound.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Creates a resource and returns its opaque, runtime-assigned id.
    ///
    /// The resource exists but is not running.
    async fn create(&self, spec: &CreateSpec) -> Result<String>;

    /// Starts a created (never-started) resource.
    async fn start(&self, id: &str) -> Result<()>;

    /// Attaches one duplexed byte stream to a running resource.
    async fn attach(&self, id: &str) -> Result<AttachStream>;

    /// Freezes the resource's full state under `name`.
    ///
    /// With `exit_after`, the resource stops once the checkpoint is
    /// written, so an idle instance consumes no CPU.
    async fn checkpoint(&self, id: &str, name: &str, exit_after: bool) -> Result<()>;

    /// Resumes a stopped resource from the checkpoint `name`.
    async fn restore(&self, id: &str, name: &str) -> Result<()>;

    /// Deletes the checkpoint `name`.
    async fn delete_checkpoint(&self, id: &str, name: &str) -> Result<()>;

    /// Removes the resource.
    ///
    /// Without `force` the resource must not be running; with `force` it
    /// is removed regardless of state.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Returns the resource's live state.
    async fn inspect(&self, id: &str) -> Result<InspectReport>;

    /// Lists ids of all resources carrying the tag key `tag_key`.
    async fn list_tagged(&self, tag_key: &str) -> Result<Vec<String>>;

    /// Writes `bytes` to `path` inside the resource's filesystem.
    async fn upload_file(&self, id: &str, path: &str, bytes: &[u8]) -> Result<()>;
}
