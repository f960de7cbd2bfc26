//! Channel registry and controller.
//!
//! The controller maps channel identity to the set of that channel's
//! sandbox instances and exposes the protocol-agnostic surface a front end
//! drives: create, invoke, remove, list, inspect, broadcast.
//!
//! Every operation against an existing instance holds that instance's
//! FIFO-fair mutex, because the instance's own state machine is unsafe for
//! concurrent callers. Each instance also carries a consecutive-error
//! tracker: incremented before each run attempt, reset to zero only on
//! success, and consulted read-only when deciding broadcast eligibility —
//! an instance past the configured ceiling is silently excluded from
//! broadcast dispatch (but stays reachable via direct invoke) until one
//! success resets it.

use crate::admission::AdmissionQueue;
use crate::config::Config;
use crate::constants::TAG_SCHEMA_VERSION;
use crate::error::{Error, Result};
use crate::instance::SandboxInstance;
use crate::metadata::{Language, SandboxMetadata};
use crate::protocol::RuntimeEvent;
use crate::provider::RuntimeProvider;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// =============================================================================
// Error Tracker
// =============================================================================

/// Consecutive-failure counter for one instance.
///
/// Created lazily with the instance's registry entry. The count is
/// incremented optimistically before each attempt and reset to zero only
/// on success, so a crashed attempt still counts against the instance.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    consecutive: AtomicU32,
}

impl ErrorTracker {
    /// Records the start of an attempt; returns the new count.
    pub fn record_attempt(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a success, resetting the count to zero.
    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    /// Current consecutive-failure count.
    pub fn count(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Registry Entry
// =============================================================================

/// One instance's bookkeeping: the exclusivity lock, the error tracker,
/// and an immutable metadata copy for lock-free lookup and listing.
#[derive(Clone)]
struct InstanceEntry {
    instance: Arc<Mutex<SandboxInstance>>,
    tracker: Arc<ErrorTracker>,
    metadata: SandboxMetadata,
}

type ChannelRegistry = HashMap<String, InstanceEntry>;

// =============================================================================
// Operation Results
// =============================================================================

/// Result of a successful `create`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    /// The new instance's id.
    pub id: String,
    /// The program's compilation/init response.
    pub initial_response: String,
}

/// Result of a successful `invoke`.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// The resolved instance id.
    pub id: String,
    /// Primary response text.
    pub response: String,
    /// Diagnostic output that arrived during the run.
    pub diagnostics: String,
}

/// Read-only view of one registered instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    /// Instance id.
    pub id: String,
    /// Immutable metadata.
    pub metadata: SandboxMetadata,
    /// Live consecutive-error count.
    pub consecutive_errors: u32,
}

/// Per-instance outcome of one broadcast.
///
/// Broadcast never fails as a whole; each instance's success or captured
/// failure lands here.
#[derive(Debug)]
pub struct BroadcastReply {
    /// Instance id.
    pub id: String,
    /// The instance's outcome.
    pub result: Result<RunOutcome>,
}

// =============================================================================
// Controller
// =============================================================================

/// Top-level engine surface: channel registries, admission gate, and the
/// per-instance serialization and circuit-breaking policy.
pub struct SandboxController {
    provider: Arc<dyn RuntimeProvider>,
    queue: Arc<AdmissionQueue>,
    config: Config,
    channels: RwLock<HashMap<String, ChannelRegistry>>,
}

impl std::fmt::Debug for SandboxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxController {
    /// Builds a controller with an empty registry and starts its admission
    /// queue.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if the configuration fails validation.
    pub fn new(provider: Arc<dyn RuntimeProvider>, config: Config) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(AdmissionQueue::new(config.concurrency)?);
        queue.start()?;
        Ok(Self {
            provider,
            queue,
            config,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Builds a controller and reconstructs every engine-tagged instance
    /// from the provider's inventory, grouped by owning channel.
    ///
    /// # Errors
    ///
    /// Propagates provider failures and tag-decoding failures — an
    /// inventory entry with an unrecognized schema version fails the cold
    /// start loudly rather than being guessed at or silently orphaned.
    pub async fn bootstrap(provider: Arc<dyn RuntimeProvider>, config: Config) -> Result<Self> {
        let controller = Self::new(provider, config)?;
        let ids = controller.provider.list_tagged(TAG_SCHEMA_VERSION).await?;
        let mut channels = controller.channels.write().await;
        for id in ids {
            let instance =
                SandboxInstance::connect(Arc::clone(&controller.provider), &id).await?;
            let metadata = instance.metadata().clone();
            debug!("reconstructed instance {id} in channel {}", metadata.channel_id);
            channels
                .entry(metadata.channel_id.clone())
                .or_default()
                .insert(
                    id,
                    InstanceEntry {
                        instance: Arc::new(Mutex::new(instance)),
                        tracker: Arc::new(ErrorTracker::default()),
                        metadata,
                    },
                );
        }
        info!("cold start reconstructed {} channel(s)", channels.len());
        drop(channels);
        Ok(controller)
    }

    /// Drains in-flight work and closes the admission queue.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.stop().await
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Resolves an abbreviation — an id prefix or an exact title — to a
    /// registered instance.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when nothing matches; [`Error::Ambiguous`]
    /// (naming every candidate) when more than one instance matches —
    /// never a silent pick. A reference equal to a full id always resolves
    /// to exactly that instance.
    pub async fn find(&self, channel_id: &str, reference: &str) -> Result<String> {
        let (id, _) = self.resolve(channel_id, reference).await?;
        Ok(id)
    }

    async fn resolve(&self, channel_id: &str, reference: &str) -> Result<(String, InstanceEntry)> {
        if reference.is_empty() {
            return Err(Error::NotFound(reference.to_string()));
        }
        let channels = self.channels.read().await;
        let registry = channels
            .get(channel_id)
            .ok_or_else(|| Error::NotFound(reference.to_string()))?;

        if let Some(entry) = registry.get(reference) {
            return Ok((reference.to_string(), entry.clone()));
        }
        let mut candidates: Vec<&String> = registry
            .iter()
            .filter(|(id, entry)| id.starts_with(reference) || entry.metadata.title == reference)
            .map(|(id, _)| id)
            .collect();
        match candidates.as_slice() {
            [] => Err(Error::NotFound(reference.to_string())),
            [id] => Ok(((*id).clone(), registry[*id].clone())),
            _ => {
                candidates.sort();
                Err(Error::Ambiguous {
                    reference: reference.to_string(),
                    candidates: candidates.into_iter().cloned().collect(),
                })
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Creates a new instance in `channel_id` from submitted source text.
    pub async fn create(
        &self,
        channel_id: &str,
        source_text: &str,
        language: Language,
        title: &str,
        author_id: &str,
    ) -> Result<CreateOutcome> {
        let metadata =
            SandboxMetadata::new(channel_id, language, title, source_text, author_id);
        let (instance, initial) = self
            .queue
            .with(SandboxInstance::create(
                Arc::clone(&self.provider),
                metadata,
                self.config.compile_timeout_for(language),
            ))
            .await?;

        let id = instance.id().to_string();
        let metadata = instance.metadata().clone();
        self.channels
            .write()
            .await
            .entry(channel_id.to_string())
            .or_default()
            .insert(
                id.clone(),
                InstanceEntry {
                    instance: Arc::new(Mutex::new(instance)),
                    tracker: Arc::new(ErrorTracker::default()),
                    metadata,
                },
            );
        Ok(CreateOutcome {
            id,
            initial_response: initial.output,
        })
    }

    /// Delivers one message to the instance resolved from `reference`.
    ///
    /// # Errors
    ///
    /// On a failure that left the instance off its checkpoint, the
    /// instance is force-removed and unregistered before the error is
    /// reported — nothing stays reachable in an ambiguous state.
    pub async fn invoke(
        &self,
        channel_id: &str,
        reference: &str,
        message: &str,
    ) -> Result<RunOutcome> {
        let (id, entry) = self.resolve(channel_id, reference).await?;
        let event = RuntimeEvent::Message(message.to_string());
        let reply = self.dispatch(&id, &entry, &event).await;
        if reply.destroyed {
            self.unregister(channel_id, &id).await;
        }
        reply.result.map(|exchange| RunOutcome {
            id,
            response: exchange.output,
            diagnostics: exchange.diagnostics,
        })
    }

    /// Removes the instance resolved from `reference` and drops its
    /// bookkeeping.
    pub async fn remove(&self, channel_id: &str, reference: &str, force: bool) -> Result<String> {
        let (id, entry) = self.resolve(channel_id, reference).await?;
        {
            let mut instance = entry.instance.lock().await;
            instance.remove(force).await?;
        }
        self.unregister(channel_id, &id).await;
        Ok(id)
    }

    /// Lists every instance registered to `channel_id`, oldest first.
    pub async fn list(&self, channel_id: &str) -> Vec<InstanceReport> {
        let channels = self.channels.read().await;
        let mut reports: Vec<InstanceReport> = channels
            .get(channel_id)
            .map(|registry| {
                registry
                    .iter()
                    .map(|(id, entry)| InstanceReport {
                        id: id.clone(),
                        metadata: entry.metadata.clone(),
                        consecutive_errors: entry.tracker.count(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        reports.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
        reports
    }

    /// Returns the report for the instance resolved from `reference`.
    pub async fn inspect(&self, channel_id: &str, reference: &str) -> Result<InstanceReport> {
        let (id, entry) = self.resolve(channel_id, reference).await?;
        Ok(InstanceReport {
            id,
            metadata: entry.metadata.clone(),
            consecutive_errors: entry.tracker.count(),
        })
    }

    /// Fans one message out to every broadcast-eligible instance in
    /// `channel_id`, concurrently.
    ///
    /// Instances whose consecutive-error count exceeds the configured
    /// ceiling are skipped (circuit breaker). Broadcast itself never
    /// fails: every per-instance failure is captured in its reply, and a
    /// destructive failure removes that instance exactly as in `invoke`.
    pub async fn broadcast(&self, channel_id: &str, message: &str) -> Vec<BroadcastReply> {
        let eligible: Vec<(String, InstanceEntry)> = {
            let channels = self.channels.read().await;
            let Some(registry) = channels.get(channel_id) else {
                return Vec::new();
            };
            let mut entries: Vec<_> = registry
                .iter()
                .filter(|(id, entry)| {
                    let count = entry.tracker.count();
                    if count > self.config.max_consecutive_errors {
                        debug!("skipping {id} past error ceiling ({count} consecutive failures)");
                        return false;
                    }
                    true
                })
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect();
            entries.sort_by(|a, b| a.1.metadata.created_at.cmp(&b.1.metadata.created_at));
            entries
        };

        let mut tasks = JoinSet::new();
        for (id, entry) in &eligible {
            let id = id.clone();
            let entry = entry.clone();
            let event = RuntimeEvent::Message(message.to_string());
            let context = self.clone_dispatch_context();
            tasks.spawn(async move {
                let reply = context.dispatch(&id, &entry, &event).await;
                (id, reply)
            });
        }

        let mut replies: HashMap<String, DispatchReply> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, reply)) => {
                    replies.insert(id, reply);
                }
                Err(join_error) => warn!("broadcast task failed to join: {join_error}"),
            }
        }

        let mut out = Vec::with_capacity(replies.len());
        for (id, _) in eligible {
            let Some(reply) = replies.remove(&id) else {
                continue;
            };
            if reply.destroyed {
                self.unregister(channel_id, &id).await;
            }
            out.push(BroadcastReply {
                result: reply.result.map(|exchange| RunOutcome {
                    id: id.clone(),
                    response: exchange.output,
                    diagnostics: exchange.diagnostics,
                }),
                id,
            });
        }
        out
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn clone_dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
        }
    }

    async fn dispatch(
        &self,
        id: &str,
        entry: &InstanceEntry,
        event: &RuntimeEvent,
    ) -> DispatchReply {
        self.clone_dispatch_context().dispatch(id, entry, event).await
    }

    async fn unregister(&self, channel_id: &str, id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(registry) = channels.get_mut(channel_id) {
            registry.remove(id);
        }
    }
}

/// The slice of controller state a broadcast task needs; cheap to move
/// into spawned tasks.
struct DispatchContext {
    queue: Arc<AdmissionQueue>,
    config: Config,
}

struct DispatchReply {
    result: Result<crate::terminal::Exchange>,
    /// True when the failure left the instance off its checkpoint and it
    /// was force-removed; the caller drops the registry entry.
    destroyed: bool,
}

impl DispatchContext {
    /// Runs one event against one instance under its mutex and one
    /// admitted slot, applying the error-tracking and forced-removal
    /// policy.
    async fn dispatch(
        &self,
        id: &str,
        entry: &InstanceEntry,
        event: &RuntimeEvent,
    ) -> DispatchReply {
        let mut instance = entry.instance.lock().await;
        entry.tracker.record_attempt();
        let result = self
            .queue
            .with(instance.run(event, self.config.run_timeout, self.config.max_writable_bytes))
            .await;
        match result {
            Ok(exchange) => {
                entry.tracker.record_success();
                DispatchReply {
                    result: Ok(exchange),
                    destroyed: false,
                }
            }
            Err(error) => {
                let destroyed = !instance.is_intact();
                if destroyed {
                    warn!("run on {id} failed off-checkpoint, force-removing: {error}");
                    if let Err(cleanup) = instance.remove(true).await {
                        warn!("forced removal of {id} failed: {cleanup}");
                    }
                } else {
                    debug!(
                        "run on {id} failed before leaving checkpoint ({} consecutive): {error}",
                        entry.tracker.count()
                    );
                }
                DispatchReply {
                    result: Err(error),
                    destroyed,
                }
            }
        }
    }
}
