//! Rate limiter facade over a counter store and a rule set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::decision::{check, Decision};
use super::rules::RulesConfig;
use crate::error::{Result, TollgateError};
use crate::store::{CounterStore, WindowState};

/// Applies configured limits to keys using a shared counter store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// The counter store, in-process or networked
    store: Arc<dyn CounterStore>,
    /// Configured limits, replaceable at runtime
    rules: RwLock<RulesConfig>,
}

impl RateLimiter {
    /// Create a rate limiter with no rules; use [`check_with`](Self::check_with)
    /// or add rules with [`set_rules`](Self::set_rules).
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_rules(store, RulesConfig::new())
    }

    pub fn with_rules(store: Arc<dyn CounterStore>, rules: RulesConfig) -> Self {
        Self {
            store,
            rules: RwLock::new(rules),
        }
    }

    /// Replace the rule set.
    pub fn set_rules(&self, rules: RulesConfig) {
        info!(rules = rules.len(), "Updated rate limit rules");
        *self.rules.write() = rules;
    }

    /// Get the current rule set.
    pub fn rules(&self) -> RulesConfig {
        self.rules.read().clone()
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Check `key` against the first matching rule.
    pub async fn check(&self, key: &str) -> Result<Decision> {
        let (limit, window, label) = {
            let rules = self.rules.read();
            let rule = rules
                .find_limit(key)
                .ok_or_else(|| TollgateError::NoMatchingRule(key.to_string()))?;
            (rule.requests_per_unit, rule.window(), rule.label().to_string())
        };

        debug!(key, rule = %label, limit, "Matched rate limit rule");
        self.check_with(key, limit, window).await
    }

    /// Check `key` against an explicit limit and window.
    pub async fn check_with(&self, key: &str, limit: i64, window: Duration) -> Result<Decision> {
        check(self.store.as_ref(), key, limit, window).await
    }

    /// Read the live window for `key` without counting against it.
    pub async fn peek(&self, key: &str) -> Result<WindowState> {
        self.store.get(key).await
    }

    /// Clear the window for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        debug!(key, store = self.store.name(), "Resetting window");
        self.store.reset(key).await
    }

    /// Clear every window whose key matches `pattern`.
    pub async fn reset_all(&self, pattern: &str) -> Result<()> {
        debug!(pattern, store = self.store.name(), "Resetting matching windows");
        self.store.reset_all(pattern).await
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}
