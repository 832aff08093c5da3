//! Guard failure tracking
//!
//! Remembers which guards recently failed circuit handshakes and benches
//! them for a while so path selection prefers guards that work.
//!
//! ## Rules
//!
//! - A handshake failure at hop 0 counts against that guard
//! - `max_failures_before_bad` consecutive failures bench the guard for
//!   `bad_guard_timeout_secs`
//! - A successful build through a guard clears its record
//! - If every guard is benched, selection ignores the bench entirely

use crate::config::GuardConfig;
use crate::error::{OnionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Failure info older than this is dropped by `cleanup`
const FAILURE_MEMORY_MS: u64 = 24 * 60 * 60 * 1000;

/// Information about a failed guard attempt
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FailureInfo {
    /// Number of consecutive failures
    pub consecutive_failures: u32,

    /// When the last failure happened (unix millis)
    pub last_failure_time: u64,

    /// Last error message
    pub last_error: String,
}

/// Guard failure state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardState {
    /// Guards that have failed recently (node_id -> failure info)
    pub failed_guards: HashMap<String, FailureInfo>,

    /// Guards that should not be used (node_id -> bad_until unix millis)
    pub bad_guards: HashMap<String, u64>,

    #[serde(default)]
    config: GuardConfig,
}

impl Default for GuardState {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

impl GuardState {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            failed_guards: HashMap::new(),
            bad_guards: HashMap::new(),
            config,
        }
    }

    /// Record a handshake failure against a guard
    pub fn record_failure(&mut self, node_id: &str, error: &str, now_ms: u64) {
        let failure = self.failed_guards.entry(node_id.to_string()).or_default();

        failure.consecutive_failures += 1;
        failure.last_failure_time = now_ms;
        failure.last_error = error.to_string();

        log::warn!(
            "⚠️ Guard {} failed ({} times): {}",
            crate::short_id(node_id),
            failure.consecutive_failures,
            error
        );

        if failure.consecutive_failures >= self.config.max_failures_before_bad {
            self.mark_bad(node_id, now_ms);
        }
    }

    /// Record a guard success (clears failure count and bench)
    pub fn record_success(&mut self, node_id: &str) {
        self.failed_guards.remove(node_id);
        self.bad_guards.remove(node_id);
    }

    fn mark_bad(&mut self, node_id: &str, now_ms: u64) {
        let bad_until = now_ms + self.config.bad_guard_timeout_secs * 1000;
        self.bad_guards.insert(node_id.to_string(), bad_until);

        log::warn!(
            "🚫 Guard {} benched for {}s",
            crate::short_id(node_id),
            self.config.bad_guard_timeout_secs
        );
    }

    /// Check if a guard is currently benched
    pub fn is_bad_guard(&self, node_id: &str, now_ms: u64) -> bool {
        self.bad_guards
            .get(node_id)
            .is_some_and(|&bad_until| now_ms < bad_until)
    }

    /// Ids of all currently benched guards
    pub fn bad_guards(&self, now_ms: u64) -> HashSet<String> {
        self.bad_guards
            .iter()
            .filter(|(_, &bad_until)| now_ms < bad_until)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn consecutive_failures(&self, node_id: &str) -> u32 {
        self.failed_guards
            .get(node_id)
            .map(|f| f.consecutive_failures)
            .unwrap_or(0)
    }

    /// Serialize state to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| OnionError::Config(format!("Failed to serialize guard state: {}", e)))
    }

    /// Deserialize state from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OnionError::Config(format!("Failed to deserialize guard state: {}", e)))
    }

    /// Drop expired benches and stale failure records
    pub fn cleanup(&mut self, now_ms: u64) {
        self.bad_guards.retain(|_, &mut bad_until| now_ms < bad_until);

        let cutoff = now_ms.saturating_sub(FAILURE_MEMORY_MS);
        self.failed_guards
            .retain(|_, info| info.last_failure_time > cutoff);
    }
}
