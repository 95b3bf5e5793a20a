//! In-process counter store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::glob::Pattern;
use super::{expiry_after, CounterStore, WindowState};
use crate::advisory::{self, Environment};
use crate::error::Result;

/// Default interval between reclamation sweeps.
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(600);

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// How often expired windows are swept from memory. Zero disables the
    /// sweep; expired windows are then only replaced lazily.
    pub gc_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: i64,
    expires_at: DateTime<Utc>,
}

impl WindowEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

type Entries = Arc<RwLock<HashMap<String, WindowEntry>>>;

/// Counter store held in process memory.
///
/// All windows live in one map behind a single reader/writer lock. A
/// background task removes expired windows every `gc_interval` so keys that
/// are seen once do not accumulate. Counters are per process: see
/// [`crate::advisory`] for multi-instance deployments.
pub struct MemoryStore {
    entries: Entries,
    closed: AtomicBool,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store, checking the process environment for a
    /// multi-instance deployment.
    ///
    /// Must be called inside a tokio runtime for the reclamation task to
    /// start; otherwise expired windows are only replaced lazily.
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self::with_environment(config, &Environment::capture())
    }

    /// Create a store, running the deployment advisory against `env`.
    pub fn with_environment(config: MemoryStoreConfig, env: &Environment) -> Self {
        advisory::warn_if_multi_instance(env);

        let entries: Entries = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown, reclaimer) = match spawn_reclaimer(entries.clone(), config.gc_interval) {
            Some((tx, handle)) => (Some(tx), Some(handle)),
            None => (None, None),
        };

        Self {
            entries,
            closed: AtomicBool::new(false),
            shutdown: Mutex::new(shutdown),
            reclaimer: Mutex::new(reclaimer),
        }
    }

    /// Number of windows physically held, including expired ones not yet
    /// swept.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired window now. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries, Utc::now())
    }

    /// Whether the background reclamation task is still running.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaimer
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Send the stop signal if no caller has yet. Returns whether this call
    /// was the one that stopped the store.
    fn stop(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            // The task may already be gone if the runtime shut down
            let _ = tx.send(());
        }
        true
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(entries: &RwLock<HashMap<String, WindowEntry>>, now: DateTime<Utc>) -> usize {
    let mut map = entries.write();
    let before = map.len();
    map.retain(|_, entry| entry.is_live(now));
    before - map.len()
}

fn spawn_reclaimer(
    entries: Entries,
    interval: Duration,
) -> Option<(oneshot::Sender<()>, JoinHandle<()>)> {
    if interval.is_zero() {
        debug!("Reclamation disabled, expired windows are replaced lazily");
        return None;
    }

    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("No tokio runtime available, in-process store will not reclaim expired windows");
            return None;
        }
    };

    let (tx, mut rx) = oneshot::channel::<()>();
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut rx => break,
                _ = ticker.tick() => {
                    let removed = sweep(&entries, Utc::now());
                    if removed > 0 {
                        debug!(removed, "Reclaimed expired rate limit windows");
                    }
                }
            }
        }

        debug!("Reclamation task stopped");
    });

    debug!(interval_ms = interval.as_millis() as u64, "Started reclamation task");
    Some((tx, handle))
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<WindowState> {
        let map = self.entries.read();
        let now = Utc::now();
        let state = match map.get(key) {
            Some(entry) if entry.is_live(now) => WindowState {
                count: entry.count,
                expires_at: Some(entry.expires_at),
            },
            _ => WindowState::empty(),
        };
        Ok(state)
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState> {
        // Read the clock only once the lock is held, so time spent waiting
        // for it counts against the current window
        let mut map = self.entries.write();
        let now = Utc::now();

        let fresh = WindowEntry {
            count: 1,
            expires_at: expiry_after(now, window),
        };
        let entry = match map.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.count = entry.count.saturating_add(1);
                *entry
            }
            Some(entry) => {
                *entry = fresh;
                fresh
            }
            None => {
                map.insert(key.to_string(), fresh);
                fresh
            }
        };
        if entry.count == 1 {
            trace!(key, window_ms = window.as_millis() as u64, "Started new window");
        }

        Ok(WindowState {
            count: entry.count,
            expires_at: Some(entry.expires_at),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn reset_all(&self, pattern: &str) -> Result<()> {
        let pattern = match Pattern::new(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(error = %e, "Skipping reset with malformed pattern");
                return Ok(());
            }
        };

        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|key, _| !pattern.matches(key));
        debug!(
            pattern = %pattern,
            removed = before - map.len(),
            "Reset matching windows"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.stop() {
            info!("Closed in-process counter store");
        }
        Ok(())
    }
}
