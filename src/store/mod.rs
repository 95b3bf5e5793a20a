//! Counter stores backing the admission engine.
//!
//! Every backend implements [`CounterStore`] on its own. The in-process
//! [`MemoryStore`] keeps windows in a locked map; the networked
//! [`RedisStore`] relies on a server-side script for its atomic
//! increment-with-expiry.

pub mod glob;
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{Backend, StoreConfig};
use crate::error::Result;

pub use memory::{MemoryStore, MemoryStoreConfig};
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};

/// The observable state of one key's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState {
    /// Units counted in the live window, 0 when there is none.
    pub count: i64,
    /// When the live window ends. `None` when there is no live window, or
    /// when the backend could not report it.
    pub expires_at: Option<DateTime<Utc>>,
}

impl WindowState {
    /// The state reported for absent or expired keys.
    pub const fn empty() -> Self {
        Self {
            count: 0,
            expires_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Storage capability for fixed-window counters.
///
/// Keys are opaque, caller-namespaced strings used verbatim by every backend.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for log fields.
    fn name(&self) -> &'static str;

    /// Read the live window for `key` without incrementing it.
    ///
    /// Expired windows are reported as [`WindowState::empty`] even if the
    /// backend still holds them.
    async fn get(&self, key: &str) -> Result<WindowState>;

    /// Count one unit against `key`.
    ///
    /// Starts a new window of length `window` with a count of 1 when no live
    /// window exists; otherwise increments the live window without extending
    /// its expiry. Indivisible with respect to concurrent callers on the same
    /// key.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState>;

    /// Clear the window for a single key.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Clear every key matching a glob pattern. Best-effort: a malformed
    /// pattern is logged and skipped rather than reported.
    async fn reset_all(&self, pattern: &str) -> Result<()>;

    /// Release background resources. Only the first call has any effect.
    async fn close(&self) -> Result<()>;
}

/// Expiry for a window of length `window` starting at `now`, saturating at
/// the largest representable timestamp.
pub(crate) fn expiry_after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Build the configured counter store.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend() {
        Backend::Memory => {
            info!(
                gc_interval_secs = config.gc_interval_secs,
                "Using in-process counter store"
            );
            let store = MemoryStore::new(MemoryStoreConfig {
                gc_interval: Duration::from_secs(config.gc_interval_secs),
            });
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let store = RedisStore::connect(RedisStoreConfig::from_store_config(config)?).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Backend::Redis => Err(crate::error::TollgateError::Config(
            "redis backend requested but tollgate was built without the `redis` feature"
                .to_string(),
        )),
    }
}
