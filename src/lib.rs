//! # cryorun
//!
//! **Checkpoint/Restore Execution Engine for Channel-Owned Sandboxed Programs**
//!
//! This crate lets untrusted, user-submitted source code execute repeatedly
//! inside an isolated sandbox while preserving in-process state (compiled
//! binary, interpreter globals) between invocations. Idle programs are
//! frozen with checkpoint/restore so they consume no CPU; each invocation
//! restores the process, exchanges one event over a framed wire protocol,
//! and freezes it again. Multiple independent logical "channels" each own
//! zero or more such programs.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            cryorun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                    SandboxController                        │    │
//! │  │  channel → registry │ abbreviation lookup │ circuit breaker │    │
//! │  │     create / invoke / remove / list / inspect / broadcast   │    │
//! │  └──────────┬──────────────────────┬───────────────────────────┘    │
//! │             │                      │                                │
//! │  ┌──────────┴──────────┐  ┌────────┴─────────────────────────┐      │
//! │  │   AdmissionQueue    │  │  per-instance Mutex+ErrorTracker │      │
//! │  │  FIFO, K in flight  │  │  at-most-one-in-flight per id    │      │
//! │  └─────────────────────┘  └────────┬─────────────────────────┘      │
//! │                                    │                                │
//! │  ┌─────────────────────────────────┴─────────────────────────┐      │
//! │  │                     SandboxInstance                       │      │
//! │  │   Uncreated → Started ⇄ Checkpointed → Removed            │      │
//! │  └──────────┬───────────────────────────────┬────────────────┘      │
//! │             │                               │                       │
//! │  ┌──────────┴──────────┐          ┌─────────┴────────────────┐      │
//! │  │   SessionTerminal   │          │  RuntimeProvider trait   │      │
//! │  │  frames + terminator│          │  create/start/attach/    │      │
//! │  │  + timeout          │          │  checkpoint/restore/...  │      │
//! │  └─────────────────────┘          └──────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Instance Lifecycle
//!
//! ```text
//!                  start             checkpoint(exit)
//!   Uncreated ───────────▶ Started ──────────────────▶ Checkpointed
//!                             ▲                             │
//!                             └─────────────────────────────┘
//!                                        restore
//!
//!   remove(force) from any state ──▶ Removed
//! ```
//!
//! # Concurrency Model
//!
//! Cooperative async scheduling on tokio. Operations against one instance
//! are strictly serialized by its FIFO-fair mutex; across instances only
//! the process-wide [`AdmissionQueue`] couples them — checkpoint/restore
//! has its own scaling cost on the runtime, so in-flight operations are
//! bounded independently of instance count. Cancellation is timeout-only:
//! a timed-out run is reported as failed and the instance is force-removed,
//! since its internal state is then of unknown consistency.
//!
//! # Wire Protocol
//!
//! Requests are length-prefixed frames — `"<kind> <N>\n"` followed by
//! exactly N raw payload bytes — so payloads may contain newlines. A
//! response is complete when the sandboxed process writes one reserved
//! control byte as the final byte of its primary output stream; diagnostic
//! output is unterminated, best-effort text.
//!
//! # Example
//!
//! ```rust,ignore
//! use cryorun::{Config, Language, SandboxController};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cryorun::Result<()> {
//!     let provider = Arc::new(MyProvider::connect()?);
//!     let controller = SandboxController::bootstrap(provider, Config::default()).await?;
//!
//!     let created = controller
//!         .create("chan-1", "print(1)", Language::Python, "greeter", "user-7")
//!         .await?;
//!     let reply = controller.invoke("chan-1", &created.id, "hello").await?;
//!     println!("{}", reply.response);
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod instance;
pub mod metadata;
pub mod protocol;
pub mod provider;
pub mod terminal;

// Re-exports
pub use admission::{AdmissionPermit, AdmissionQueue, QueueState};
pub use config::Config;
pub use controller::{
    BroadcastReply, CreateOutcome, ErrorTracker, InstanceReport, RunOutcome, SandboxController,
};
pub use error::{Error, Result};
pub use instance::{InstanceStatus, SandboxInstance};
pub use metadata::{Language, SandboxMetadata};
pub use protocol::{Frame, RuntimeEvent};
pub use provider::{AttachStream, CreateSpec, InspectReport, RuntimeProvider};
pub use terminal::{Exchange, SessionTerminal};
