//! Engine configuration.
//!
//! One [`Config`] value parameterizes a controller: the process-wide
//! concurrency bound, the compile timeout (with per-language overrides),
//! the run timeout, the circuit-breaker ceiling, and the writable-layer
//! quota. Validation happens once at startup; a bad value is fatal there
//! rather than surfacing mid-run.

use crate::constants::{
    DEFAULT_COMPILE_TIMEOUT, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_MAX_WRITABLE_BYTES,
    DEFAULT_RUN_TIMEOUT, MIN_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::metadata::Language;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the sandbox execution engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of operations admitted concurrently, process-wide.
    ///
    /// Checkpoint/restore imposes its own scaling cost on the runtime, so
    /// this bounds in-flight operations independently of instance count.
    pub concurrency: usize,

    /// Window for compilation and the first response during `create`, for
    /// languages without an entry in `compile_timeouts`.
    pub compile_timeout: Duration,

    /// Per-language compile windows; a compiled language typically needs a
    /// wider one than an interpreted one.
    pub compile_timeouts: HashMap<Language, Duration>,

    /// Window for one event round-trip during `run`.
    pub run_timeout: Duration,

    /// Consecutive-failure ceiling beyond which an instance is excluded
    /// from broadcast dispatch.
    pub max_consecutive_errors: u32,

    /// Writable-layer byte ceiling checked after every run.
    pub max_writable_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            compile_timeout: DEFAULT_COMPILE_TIMEOUT,
            compile_timeouts: HashMap::new(),
            run_timeout: DEFAULT_RUN_TIMEOUT,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            max_writable_bytes: DEFAULT_MAX_WRITABLE_BYTES,
        }
    }
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a zero concurrency bound, a
    /// timeout below [`MIN_TIMEOUT`], or a zero writable-layer quota.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.compile_timeout < MIN_TIMEOUT {
            return Err(Error::Configuration(format!(
                "compile_timeout must be at least {MIN_TIMEOUT:?}"
            )));
        }
        for (language, timeout) in &self.compile_timeouts {
            if *timeout < MIN_TIMEOUT {
                return Err(Error::Configuration(format!(
                    "compile timeout for {language} must be at least {MIN_TIMEOUT:?}"
                )));
            }
        }
        if self.run_timeout < MIN_TIMEOUT {
            return Err(Error::Configuration(format!(
                "run_timeout must be at least {MIN_TIMEOUT:?}"
            )));
        }
        if self.max_writable_bytes == 0 {
            return Err(Error::Configuration(
                "max_writable_bytes must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Compile window for `language`, falling back to the global default.
    pub fn compile_timeout_for(&self, language: Language) -> Duration {
        self.compile_timeouts
            .get(&language)
            .copied()
            .unwrap_or(self.compile_timeout)
    }
}
