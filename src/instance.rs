//! Sandbox instance lifecycle.
//!
//! One [`SandboxInstance`] wraps one provider resource hosting one user
//! program. The program's process is kept checkpointed while idle —
//! consuming no CPU — and restored for each invocation, so a compiled
//! binary or interpreter retains its in-memory state across many separate
//! invocations without recompiling or reinitializing. The cost is a state
//! machine whose every step is a fallible asynchronous call against an
//! external system:
//!
//! ```text
//!                 start            checkpoint
//!   Uncreated ──────────▶ Started ────────────▶ Checkpointed
//!                            ▲                       │
//!                            └───────────────────────┘
//!                                     restore
//!
//!   any state ──(remove)──▶ Removed
//! ```
//!
//! Every transition first asserts the expected prior cached status; a
//! mismatch means the cache and the runtime diverged and raises
//! [`Error::StateInvariant`] rather than proceeding.

use crate::constants::{
    CHECKPOINT_NAME, GUEST_SOURCE_DIR, INSTANCE_MEMORY_BYTES, INSTANCE_OPEN_FILES_HARD,
    INSTANCE_OPEN_FILES_SOFT, INSTANCE_PIDS_LIMIT,
};
use crate::error::{Error, Result};
use crate::metadata::SandboxMetadata;
use crate::protocol::{language_frame, Frame, RuntimeEvent};
use crate::provider::{CreateSpec, RuntimeProvider};
use crate::terminal::{Exchange, SessionTerminal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Instance Status
// =============================================================================

/// Locally cached lifecycle state of a sandbox instance.
///
/// This must equal the runtime's true state except during the narrow
/// windows each operation explicitly manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Resource exists but its process has never started.
    Uncreated,
    /// Process is running (during create or mid-run).
    Started,
    /// Process is frozen in the idle checkpoint, ready to run.
    Checkpointed,
    /// Resource has been removed.
    Removed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncreated => write!(f, "uncreated"),
            Self::Started => write!(f, "started"),
            Self::Checkpointed => write!(f, "checkpointed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

// =============================================================================
// Sandbox Instance
// =============================================================================

/// One isolated, checkpointable user program.
///
/// The instance's own state machine is unsafe for concurrent callers; the
/// controller serializes access through a per-instance mutex.
pub struct SandboxInstance {
    provider: Arc<dyn RuntimeProvider>,
    id: String,
    metadata: SandboxMetadata,
    status: InstanceStatus,
}

impl SandboxInstance {
    /// Creates, compiles, and checkpoints a new instance.
    ///
    /// Steps: create the tagged resource → start it → upload the source →
    /// flush a language selector plus an init event → await the first
    /// response under `compile_timeout` → checkpoint. Returns the instance
    /// (status `Checkpointed`) and the initial response.
    ///
    /// # Errors
    ///
    /// Any failure after the resource exists force-removes the partially
    /// built resource before the error propagates — no leaked resources.
    pub async fn create(
        provider: Arc<dyn RuntimeProvider>,
        metadata: SandboxMetadata,
        compile_timeout: Duration,
    ) -> Result<(Self, Exchange)> {
        let spec = CreateSpec {
            tags: metadata.to_tags(),
            memory_bytes: INSTANCE_MEMORY_BYTES,
            pids_limit: INSTANCE_PIDS_LIMIT,
            open_files: (INSTANCE_OPEN_FILES_SOFT, INSTANCE_OPEN_FILES_HARD),
            network: false,
        };
        let id = provider.create(&spec).await?;
        debug!("created sandbox resource {} ({})", id, metadata.language);

        let mut instance = Self {
            provider,
            id,
            metadata,
            status: InstanceStatus::Uncreated,
        };
        match instance.initialize(compile_timeout).await {
            Ok(initial) => {
                info!("instance {} created and checkpointed", instance.id);
                Ok((instance, initial))
            }
            Err(error) => {
                warn!("create of {} failed, removing partial resource: {error}", instance.id);
                if let Err(cleanup) = instance.provider.remove(&instance.id, true).await {
                    warn!("cleanup of partial resource {} failed: {cleanup}", instance.id);
                }
                instance.status = InstanceStatus::Removed;
                Err(error)
            }
        }
    }

    async fn initialize(&mut self, compile_timeout: Duration) -> Result<Exchange> {
        self.start().await?;

        let path = format!(
            "{GUEST_SOURCE_DIR}/{}",
            self.metadata.language.source_filename()
        );
        self.provider
            .upload_file(&self.id, &path, self.metadata.source_text.as_bytes())
            .await?;

        // The runner compiles (or loads) the source and dispatches the init
        // handler; its first response doubles as the compile result.
        let frames = [
            language_frame(self.metadata.language.as_str())?,
            RuntimeEvent::Init.to_frame()?,
        ];
        let initial = self.exchange(&frames, compile_timeout).await?;

        if !self.inspect_running().await? {
            return Err(Error::CreateFailed {
                reason: "program exited during initialization".to_string(),
            });
        }
        self.checkpoint().await?;
        if self.inspect_running().await? {
            return Err(Error::CreateFailed {
                reason: "resource still running after checkpoint".to_string(),
            });
        }
        Ok(initial)
    }

    /// Reconstructs a handle from an existing resource.
    ///
    /// Inspects the live running flag and decodes the tag metadata;
    /// unknown schema versions are rejected outright.
    pub async fn connect(provider: Arc<dyn RuntimeProvider>, id: &str) -> Result<Self> {
        let report = provider.inspect(id).await?;
        let metadata = SandboxMetadata::from_tags(&report.tags)?;
        let status = if report.running {
            InstanceStatus::Started
        } else {
            InstanceStatus::Checkpointed
        };
        Ok(Self {
            provider,
            id: id.to_string(),
            metadata,
            status,
        })
    }

    /// Delivers one event to the program and returns its response.
    ///
    /// Requires `Checkpointed`. Restores the process, exchanges the event,
    /// enforces the writable-layer quota, replaces the stale checkpoint
    /// with a fresh one, and leaves the instance `Checkpointed` again.
    ///
    /// # Errors
    ///
    /// A failure that occurs once the restore has begun mutating external
    /// state leaves the cached status off `Checkpointed`; callers treat
    /// that as instance-destructive (see [`Self::is_intact`]).
    pub async fn run(
        &mut self,
        event: &RuntimeEvent,
        timeout: Duration,
        max_writable_bytes: u64,
    ) -> Result<Exchange> {
        self.assert_status(InstanceStatus::Checkpointed)?;
        let frames = [event.to_frame()?];

        self.restore().await?;
        let exchange = self.exchange(&frames, timeout).await?;

        let report = self.provider.inspect(&self.id).await?;
        if report.writable_layer_bytes > max_writable_bytes {
            return Err(Error::Quota {
                id: self.id.clone(),
                used: report.writable_layer_bytes,
                limit: max_writable_bytes,
            });
        }

        self.provider
            .delete_checkpoint(&self.id, CHECKPOINT_NAME)
            .await?;
        self.checkpoint().await?;
        debug!("run complete for {}, re-checkpointed", self.id);
        Ok(exchange)
    }

    /// Removes the resource.
    ///
    /// Without `force` the instance must be `Checkpointed`; with `force`
    /// it is removed regardless of state. Marks `Removed` locally.
    pub async fn remove(&mut self, force: bool) -> Result<()> {
        if !force {
            self.assert_status(InstanceStatus::Checkpointed)?;
        }
        self.provider.remove(&self.id, force).await?;
        self.status = InstanceStatus::Removed;
        info!("instance {} removed (force: {force})", self.id);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The opaque, runtime-assigned instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The instance's immutable metadata.
    pub fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    /// The locally cached lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// True while the instance is safely checkpointed.
    ///
    /// A failed operation that left the instance in any other state is
    /// presumed to have corrupted it; the controller force-removes such
    /// instances rather than leave them reachable.
    pub fn is_intact(&self) -> bool {
        self.status == InstanceStatus::Checkpointed
    }

    // =========================================================================
    // Guarded Transitions
    // =========================================================================

    fn assert_status(&self, expected: InstanceStatus) -> Result<()> {
        if self.status != expected {
            return Err(Error::StateInvariant {
                id: self.id.clone(),
                state: self.status.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.assert_status(InstanceStatus::Uncreated)?;
        self.provider.start(&self.id).await?;
        self.status = InstanceStatus::Started;
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        self.assert_status(InstanceStatus::Checkpointed)?;
        self.provider.restore(&self.id, CHECKPOINT_NAME).await?;
        self.status = InstanceStatus::Started;
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.assert_status(InstanceStatus::Started)?;
        self.provider
            .checkpoint(&self.id, CHECKPOINT_NAME, true)
            .await?;
        self.status = InstanceStatus::Checkpointed;
        Ok(())
    }

    /// Queries the runtime's true running flag, the source of truth the
    /// cached status is validated against where divergence is plausible.
    async fn inspect_running(&self) -> Result<bool> {
        Ok(self.provider.inspect(&self.id).await?.running)
    }

    async fn exchange(&mut self, frames: &[Frame], timeout: Duration) -> Result<Exchange> {
        self.assert_status(InstanceStatus::Started)?;
        let stream = self.provider.attach(&self.id).await?;
        let mut terminal = SessionTerminal::new(stream);
        for frame in frames {
            terminal.issue_write(frame);
        }
        terminal.read_to_end(timeout).await
    }
}

impl std::fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("channel", &self.metadata.channel_id)
            .finish_non_exhaustive()
    }
}
