//! # Engine Constants
//!
//! Resource limits, timeouts, tag keys, and protocol bytes for the sandbox
//! execution engine. These constants are the single source of truth for the
//! bounds enforced on untrusted programs.
//!
//! ## Modification Guidelines
//!
//! Before modifying any constant:
//! 1. Evaluate the resource-exhaustion impact of the change
//! 2. Consider interactions with other limits (e.g., memory × concurrency)
//! 3. Update dependent tests and documentation

use std::time::Duration;

// =============================================================================
// Resource Limits
// =============================================================================
//
// Applied to every sandbox instance at creation. The values bound what one
// untrusted program can consume; the admission queue bounds how many run at
// once, so worst-case host usage is limit × concurrency.
// =============================================================================

/// Memory ceiling per instance (256 MiB), swap included.
///
/// A program that allocates past this is OOM-killed inside the sandbox and
/// surfaces as a protocol violation (stream closed without terminator).
pub const INSTANCE_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Maximum processes/threads per instance.
///
/// Bounds fork bombs. Sixteen covers an interpreter plus a handful of
/// worker threads.
pub const INSTANCE_PIDS_LIMIT: u32 = 16;

/// Soft open-file limit per instance.
pub const INSTANCE_OPEN_FILES_SOFT: u32 = 16;

/// Hard open-file limit per instance.
pub const INSTANCE_OPEN_FILES_HARD: u32 = 32;

/// Default writable-layer ceiling (128 MiB).
///
/// Checked after every run; exceeding it is a `Quota` failure and the
/// instance is force-removed. Checkpoint images count toward the layer, so
/// this also bounds checkpoint size.
pub const DEFAULT_MAX_WRITABLE_BYTES: u64 = 128 * 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Default window for compilation and the first response (10 seconds).
///
/// Covers compiler startup and whatever the program's init handler does.
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window for one event round-trip (2 seconds).
///
/// Restore and checkpoint are outside this window; it bounds only the
/// protocol wait between flush and terminator.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(2);

/// Floor for configured timeouts.
///
/// Anything shorter than this cannot complete a single scheduler round-trip
/// and is rejected as a configuration error.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Default consecutive-failure ceiling before an instance is excluded from
/// broadcast dispatch.
///
/// Direct invocation stays available regardless; one success resets the
/// count and restores eligibility.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;

// =============================================================================
// Wire Protocol
// =============================================================================

/// Reserved control byte the sandboxed process writes as the final byte of
/// its output once it has finished responding to one event.
pub const RESPONSE_TERMINATOR: u8 = 0x07;

/// Frame kind selecting the guest-side language shim.
pub const FRAME_KIND_LANGUAGE: &str = "language";

/// Frame kind for the initialization event.
pub const FRAME_KIND_INIT: &str = "init";

/// Frame kind for a message event.
pub const FRAME_KIND_MESSAGE: &str = "message";

/// Maximum accepted frame payload length (1 MiB).
///
/// Bounds decoder allocation against a malicious header like
/// `message 99999999999\n`.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

// =============================================================================
// Checkpointing
// =============================================================================

/// Name under which each instance's idle checkpoint is stored.
///
/// Exactly one checkpoint exists per idle instance; `run` deletes the stale
/// one and writes a fresh one under the same name.
pub const CHECKPOINT_NAME: &str = "paused";

// =============================================================================
// Metadata Tags
// =============================================================================
//
// SandboxMetadata is persisted as a flat string→string tag mapping on the
// provider resource, set once at creation. TAG_SCHEMA_VERSION doubles as
// the inventory marker: a resource carrying it belongs to this engine.
// =============================================================================

/// Tag key marking a resource as engine-managed and carrying its schema
/// version.
pub const TAG_SCHEMA_VERSION: &str = "cryorun.schema-version";

/// Tag key for the owning channel id.
pub const TAG_CHANNEL: &str = "cryorun.channel";

/// Tag key for the program language.
pub const TAG_LANGUAGE: &str = "cryorun.language";

/// Tag key for the user-declared title.
pub const TAG_TITLE: &str = "cryorun.title";

/// Tag key for the submitted source text.
pub const TAG_SOURCE: &str = "cryorun.source";

/// Tag key for the submitting author id.
pub const TAG_AUTHOR: &str = "cryorun.author";

/// Tag key for the creation timestamp (RFC 3339).
pub const TAG_CREATED_AT: &str = "cryorun.created-at";

/// Schema version written by this build.
///
/// An unrecognized version in a decoded tag mapping is rejected outright,
/// never guessed. Migration is out of scope.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Guest Filesystem
// =============================================================================

/// Directory inside the sandbox where the source file is uploaded.
pub const GUEST_SOURCE_DIR: &str = "/app";
