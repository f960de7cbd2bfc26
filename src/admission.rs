//! Admission queue.
//!
//! A fair, FIFO counting gate bounding concurrently in-flight operations
//! process-wide, independent of instance count — checkpoint/restore imposes
//! its own scaling cost on the runtime, so admission is bounded even when
//! every instance is idle most of the time.
//!
//! The gate is built on a fair [`tokio::sync::Semaphore`] with the
//! lifecycle modeled as an explicit enum with guarded transitions:
//!
//! ```text
//!   Off ──start()──▶ Running ──stop()──▶ Stopping ──(drained)──▶ Stopped
//! ```
//!
//! `stop()` resolves only once every in-flight operation has released its
//! slot; afterwards new acquisitions fail rather than wait forever.
//! Calling `start`/`stop` out of their required states is a
//! programmer-error [`Error::Lifecycle`] failure.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Queue State
// =============================================================================

/// Lifecycle state of the admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Constructed, no slots seeded.
    Off,
    /// Admitting work.
    Running,
    /// Draining in-flight work; nothing new admitted.
    Stopping,
    /// Drained and closed.
    Stopped,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Admission Permit
// =============================================================================

/// One admitted slot. Dropping the permit releases the slot, waking the
/// longest-waiting acquirer if any.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

// =============================================================================
// Admission Queue
// =============================================================================

/// Process-wide bounded-concurrency gate.
#[derive(Debug)]
pub struct AdmissionQueue {
    concurrency: usize,
    state: Mutex<QueueState>,
    slots: Arc<Semaphore>,
}

impl AdmissionQueue {
    /// Creates a queue admitting at most `concurrency` operations at once.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for a zero bound.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::Configuration(
                "admission concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            concurrency,
            state: Mutex::new(QueueState::Off),
            slots: Arc::new(Semaphore::new(0)),
        })
    }

    /// Returns the configured concurrency bound.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> QueueState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seeds the slots and begins admitting work (`Off → Running`).
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != QueueState::Off {
            return Err(Error::Lifecycle {
                operation: "start".to_string(),
                state: state.to_string(),
            });
        }
        *state = QueueState::Running;
        self.slots.add_permits(self.concurrency);
        Ok(())
    }

    /// Waits for a free slot; waiters resume strictly in call order.
    ///
    /// # Errors
    ///
    /// [`Error::QueueClosed`] once the queue is no longer `Running` — a
    /// caller that raced `stop()` fails instead of waiting forever.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != QueueState::Running {
                return Err(Error::QueueClosed {
                    state: state.to_string(),
                });
            }
        }
        match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            // The semaphore closes only during stop(); the waiter lost the
            // race and reports the post-transition state.
            Err(_) => Err(Error::QueueClosed {
                state: self.state().to_string(),
            }),
        }
    }

    /// Runs `task` inside one admitted slot: acquire → run → guaranteed
    /// release.
    pub async fn with<T>(&self, task: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = self.acquire().await?;
        task.await
    }

    /// Drains all in-flight work, then closes the gate (`Running →
    /// Stopping → Stopped`).
    ///
    /// Resolves once every seeded slot is simultaneously free — i.e. every
    /// operation admitted before the stop has released. Pending acquirers
    /// that were already waiting are served first (the drain joins the
    /// same FIFO queue behind them).
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != QueueState::Running {
                return Err(Error::Lifecycle {
                    operation: "stop".to_string(),
                    state: state.to_string(),
                });
            }
            *state = QueueState::Stopping;
        }
        let drained = self
            .slots
            .acquire_many(self.concurrency as u32)
            .await
            .map_err(|_| Error::Lifecycle {
                operation: "stop".to_string(),
                state: QueueState::Stopped.to_string(),
            })?;
        drained.forget();
        self.slots.close();
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = QueueState::Stopped;
        Ok(())
    }
}
