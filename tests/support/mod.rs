//! Shared test harness: a scripted in-memory runtime provider.
//!
//! `ScriptedProvider` implements the full `RuntimeProvider` contract with
//! strict state-transition checking (restoring a running resource or
//! checkpointing a stopped one is an error, so a missing mutex shows up as
//! a hard failure) and spawns a guest task per attach that speaks the real
//! wire protocol, mirroring the in-sandbox runner loop.

#![allow(dead_code)]

use async_trait::async_trait;
use cryorun::{AttachStream, CreateSpec, Error, Frame, InspectReport, Result, RuntimeProvider};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use uuid::Uuid;

/// Reserved completion byte, mirrored from the engine's protocol.
const TERMINATOR: u8 = 0x07;

// =============================================================================
// Guest Behavior
// =============================================================================

/// How the emulated guest runner behaves once attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMode {
    /// Responds `ready` to init and `echo: <payload>` to messages.
    Echo,
    /// Responds to init but never answers a message (driving timeouts).
    MuteOnMessage,
    /// Responds to init; on a message writes partial output and closes the
    /// stream without a terminator (driving protocol violations).
    CrashOnMessage,
}

// =============================================================================
// Resource State
// =============================================================================

#[derive(Debug, Default)]
struct Resource {
    tags: HashMap<String, String>,
    running: bool,
    checkpoints: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Core {
    resources: HashMap<String, Resource>,
    next_seq: u64,
}

// =============================================================================
// Scripted Provider
// =============================================================================

pub struct ScriptedProvider {
    core: Mutex<Core>,
    mode: Mutex<GuestMode>,
    mode_overrides: Mutex<HashMap<String, GuestMode>>,
    /// Remaining `restore` calls that fail before touching state.
    restore_failures: AtomicI64,
    /// Next `upload_file` calls that fail (construction-atomicity tests).
    upload_failures: AtomicI64,
    /// Value reported as the writable-layer size.
    writable_bytes: AtomicU64,
    /// Live restore→checkpoint spans and the maximum ever observed.
    spans_active: AtomicI64,
    spans_max: AtomicI64,
    /// Restores attempted against an already-running resource.
    overlap_violations: AtomicU32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(Core::default()),
            mode: Mutex::new(GuestMode::Echo),
            mode_overrides: Mutex::new(HashMap::new()),
            restore_failures: AtomicI64::new(0),
            upload_failures: AtomicI64::new(0),
            writable_bytes: AtomicU64::new(4096),
            spans_active: AtomicI64::new(0),
            spans_max: AtomicI64::new(0),
            overlap_violations: AtomicU32::new(0),
        }
    }

    // =========================================================================
    // Test Knobs
    // =========================================================================

    pub fn set_mode(&self, mode: GuestMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Overrides the guest behavior for one resource id only.
    pub fn set_mode_for(&self, id: &str, mode: GuestMode) {
        self.mode_overrides
            .lock()
            .unwrap()
            .insert(id.to_string(), mode);
    }

    /// Makes the next `n` restore calls fail without touching state.
    pub fn fail_next_restores(&self, n: i64) {
        self.restore_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` upload calls fail.
    pub fn fail_next_uploads(&self, n: i64) {
        self.upload_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_writable_bytes(&self, bytes: u64) {
        self.writable_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Number of resources currently in the inventory.
    pub fn resource_count(&self) -> usize {
        self.core.lock().unwrap().resources.len()
    }

    /// True if the resource exists, is stopped, and holds a checkpoint.
    pub fn is_checkpointed(&self, id: &str) -> bool {
        let core = self.core.lock().unwrap();
        core.resources
            .get(id)
            .map(|r| !r.running && !r.checkpoints.is_empty())
            .unwrap_or(false)
    }

    /// Flips the live running flag behind the engine's back (simulating a
    /// process found running after a reconnect).
    pub fn force_running(&self, id: &str, running: bool) {
        if let Some(resource) = self.core.lock().unwrap().resources.get_mut(id) {
            resource.running = running;
        }
    }

    /// Inserts a raw resource with arbitrary tags, bypassing the engine.
    pub fn insert_raw(&self, tags: HashMap<String, String>) -> String {
        let mut core = self.core.lock().unwrap();
        core.next_seq += 1;
        let id = format!("sbx{:04}{}", core.next_seq, Uuid::new_v4().simple());
        core.resources.insert(
            id.clone(),
            Resource {
                tags,
                ..Resource::default()
            },
        );
        id
    }

    /// Maximum concurrently active restore→checkpoint spans observed.
    pub fn max_concurrent_runs(&self) -> i64 {
        self.spans_max.load(Ordering::SeqCst)
    }

    /// Restores attempted while the resource was already running.
    pub fn overlap_violations(&self) -> u32 {
        self.overlap_violations.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicI64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
    }

    fn begin_span(&self) {
        let active = self.spans_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.spans_max.fetch_max(active, Ordering::SeqCst);
    }

    fn end_span(&self) {
        self.spans_active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuntimeProvider for ScriptedProvider {
    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        Ok(self.insert_raw(spec.tags.clone()))
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let resource = lookup_mut(&mut core, id)?;
        if resource.running {
            return Err(Error::provider(format!("{id} is already running")));
        }
        resource.running = true;
        self.begin_span();
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachStream> {
        let mode = {
            let core = self.core.lock().unwrap();
            let resource = lookup(&core, id)?;
            if !resource.running {
                return Err(Error::provider(format!("{id} is not running")));
            }
            self.mode_overrides
                .lock()
                .unwrap()
                .get(id)
                .copied()
                .unwrap_or(*self.mode.lock().unwrap())
        };
        let (writer, stdin) = duplex(64 * 1024);
        let (output_guest, output) = duplex(64 * 1024);
        let (diag_guest, diagnostic) = duplex(64 * 1024);
        tokio::spawn(guest_runner(stdin, output_guest, diag_guest, mode));
        Ok(AttachStream {
            writer: Box::new(writer),
            output: Box::new(output),
            diagnostic: Box::new(diagnostic),
        })
    }

    async fn checkpoint(&self, id: &str, name: &str, exit_after: bool) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let resource = lookup_mut(&mut core, id)?;
        if !resource.running {
            return Err(Error::provider(format!(
                "cannot checkpoint {id}: not running"
            )));
        }
        resource.checkpoints.insert(name.to_string());
        if exit_after {
            resource.running = false;
            self.end_span();
        }
        Ok(())
    }

    async fn restore(&self, id: &str, name: &str) -> Result<()> {
        if Self::take_fault(&self.restore_failures) {
            return Err(Error::provider("checkpoint engine busy"));
        }
        let mut core = self.core.lock().unwrap();
        let resource = lookup_mut(&mut core, id)?;
        if resource.running {
            self.overlap_violations.fetch_add(1, Ordering::SeqCst);
            return Err(Error::provider(format!(
                "cannot restore {id}: already running"
            )));
        }
        if !resource.checkpoints.contains(name) {
            return Err(Error::provider(format!("{id} has no checkpoint '{name}'")));
        }
        resource.running = true;
        self.begin_span();
        Ok(())
    }

    async fn delete_checkpoint(&self, id: &str, name: &str) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let resource = lookup_mut(&mut core, id)?;
        if !resource.checkpoints.remove(name) {
            return Err(Error::provider(format!("{id} has no checkpoint '{name}'")));
        }
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let resource = lookup(&core, id)?;
        if resource.running && !force {
            return Err(Error::provider(format!(
                "cannot remove {id} while running without force"
            )));
        }
        if resource.running {
            self.end_span();
        }
        core.resources.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<InspectReport> {
        let core = self.core.lock().unwrap();
        let resource = lookup(&core, id)?;
        Ok(InspectReport {
            running: resource.running,
            writable_layer_bytes: self.writable_bytes.load(Ordering::SeqCst),
            tags: resource.tags.clone(),
        })
    }

    async fn list_tagged(&self, tag_key: &str) -> Result<Vec<String>> {
        let core = self.core.lock().unwrap();
        let mut ids: Vec<String> = core
            .resources
            .iter()
            .filter(|(_, r)| r.tags.contains_key(tag_key))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn upload_file(&self, id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        if Self::take_fault(&self.upload_failures) {
            return Err(Error::provider("upload rejected"));
        }
        let mut core = self.core.lock().unwrap();
        let resource = lookup_mut(&mut core, id)?;
        resource.files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Coerces a shared scripted provider into the trait object the engine
/// consumes.
pub fn provider_handle(provider: &std::sync::Arc<ScriptedProvider>) -> std::sync::Arc<dyn RuntimeProvider> {
    provider.clone()
}

fn lookup<'a>(core: &'a Core, id: &str) -> Result<&'a Resource> {
    core.resources
        .get(id)
        .ok_or_else(|| Error::provider(format!("no such resource: {id}")))
}

fn lookup_mut<'a>(core: &'a mut Core, id: &str) -> Result<&'a mut Resource> {
    core.resources
        .get_mut(id)
        .ok_or_else(|| Error::provider(format!("no such resource: {id}")))
}

// =============================================================================
// Guest Runner
// =============================================================================

/// Emulates the in-sandbox runner: decode frames off stdin, answer each
/// init/message event with terminated output, narrate on the diagnostic
/// stream.
async fn guest_runner(
    mut stdin: DuplexStream,
    mut output: DuplexStream,
    mut diagnostic: DuplexStream,
    mode: GuestMode,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
        while let Ok((frame, consumed)) = Frame::decode(&pending) {
            pending.drain(..consumed);
            let payload = String::from_utf8_lossy(frame.payload()).into_owned();
            let _ = diagnostic
                .write_all(format!("event {}\n", frame.kind()).as_bytes())
                .await;
            match frame.kind() {
                "language" => {}
                "init" => respond(&mut output, "ready").await,
                "message" => match mode {
                    GuestMode::Echo => respond(&mut output, &format!("echo: {payload}")).await,
                    GuestMode::MuteOnMessage => {}
                    GuestMode::CrashOnMessage => {
                        let _ = output.write_all(b"segfault").await;
                        return;
                    }
                },
                _ => return,
            }
        }
    }
}

async fn respond(output: &mut DuplexStream, text: &str) {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(TERMINATOR);
    let _ = output.write_all(&bytes).await;
}
