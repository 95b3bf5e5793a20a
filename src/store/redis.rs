//! Redis counter store.
//!
//! Windows are plain Redis integers with a millisecond TTL equal to the
//! window length, stored under the caller's key with no prefix. The
//! increment runs as a server-side script so creating the window, counting,
//! and setting its expiry happen as one indivisible step.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::{debug, info, warn};

use super::glob::Pattern;
use super::{expiry_after, CounterStore, WindowState};
use crate::config::StoreConfig;
use crate::error::{Result, TollgateError};

/// Keys requested per `SCAN` round trip during bulk resets.
const SCAN_BATCH: usize = 500;

/// Increment `KEYS[1]`, giving it a TTL of `ARGV[1]` ms when the window is
/// new. Returns `{count, pttl_ms}`.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Redis counter store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Time allowed to establish the connection
    pub connect_timeout: Duration,
    /// Time allowed for each round trip
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
        }
    }
}

impl RedisStoreConfig {
    pub fn from_store_config(config: &StoreConfig) -> Result<Self> {
        let url = config.redis_url.clone().ok_or_else(|| {
            TollgateError::Config("redis backend requires store.redis_url or REDIS_URL".to_string())
        })?;

        Ok(Self {
            url,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
        })
    }
}

/// Counter store shared through Redis.
pub struct RedisStore {
    /// Cleared on close; cloned per call otherwise
    conn: RwLock<Option<ConnectionManager>>,
    config: RedisStoreConfig,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis, failing with `BackendUnavailable` if the server
    /// cannot be reached within the connect timeout.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| TollgateError::Config(format!("Invalid Redis URL: {}", e)))?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TollgateError::BackendUnavailable(format!(
                    "Connection timed out after {:?}",
                    config.connect_timeout
                ))
            })??;

        info!(url = %redact(&config.url), "Connected to Redis counter store");

        Ok(Self {
            conn: RwLock::new(Some(conn)),
            config,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| TollgateError::BackendUnavailable("store closed".to_string()))
    }

    async fn round_trip<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        with_timeout(op, self.config.command_timeout, fut).await
    }
}

/// Await one Redis round trip, bounded by `timeout`. Both a command error and
/// a timeout are reported as `BackendUnavailable`.
async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(op, error = %e, "Redis command failed");
            Err(e.into())
        }
        Err(_) => {
            warn!(
                op,
                timeout_ms = timeout.as_millis() as u64,
                "Redis command timed out"
            );
            Err(TollgateError::BackendUnavailable(format!(
                "{} timed out after {:?}",
                op, timeout
            )))
        }
    }
}

/// `SCAN MATCH` argument selecting every key that starts with `prefix`.
fn scan_match(prefix: &str) -> String {
    let mut arg = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            arg.push('\\');
        }
        arg.push(c);
    }
    arg.push('*');
    arg
}

/// Expiry implied by a `PTTL` reply observed at `now`.
fn expiry_from_pttl(now: DateTime<Utc>, pttl_ms: i64) -> Option<DateTime<Utc>> {
    (pttl_ms > 0).then(|| expiry_after(now, Duration::from_millis(pttl_ms as u64)))
}

fn window_millis(window: Duration) -> u64 {
    (window.as_millis().min(i64::MAX as u128) as u64).max(1)
}

/// Hide credentials in a connection URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<WindowState> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);

        let (count, pttl): (Option<i64>, i64) =
            self.round_trip("get", pipe.query_async(&mut conn)).await?;

        Ok(match count {
            Some(count) if pttl != -2 => WindowState {
                count,
                expires_at: expiry_from_pttl(Utc::now(), pttl),
            },
            _ => WindowState::empty(),
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowState> {
        let mut conn = self.connection()?;
        let mut invocation = self.script.key(key);
        invocation.arg(window_millis(window));

        let reply: Vec<i64> = self
            .round_trip("increment", invocation.invoke_async(&mut conn))
            .await?;

        let count = reply.first().copied().ok_or_else(|| {
            TollgateError::BackendUnavailable("empty reply from increment script".to_string())
        })?;
        let pttl = reply.get(1).copied().unwrap_or(-1);

        Ok(WindowState {
            count,
            expires_at: expiry_from_pttl(Utc::now(), pttl),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let cmd = redis::cmd("DEL").arg(key).clone();
        let _: i64 = self.round_trip("reset", cmd.query_async(&mut conn)).await?;
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

        // Redis glob syntax differs from ours (no `!` negation, byte-wise
        // `?`), so the server only narrows by literal prefix and the pattern
        // itself is applied here.
        let broad = scan_match(&pattern.literal_prefix());
        let mut conn = self.connection()?;
        let mut cursor: u64 = 0;
        let mut removed: i64 = 0;

        loop {
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&broad)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .clone();
            let (next, keys): (u64, Vec<Vec<u8>>) =
                self.round_trip("scan", scan.query_async(&mut conn)).await?;

            let doomed: Vec<Vec<u8>> = keys
                .into_iter()
                .filter(|key| std::str::from_utf8(key).is_ok_and(|key| pattern.matches(key)))
                .collect();

            if !doomed.is_empty() {
                let del = redis::cmd("DEL").arg(&doomed).clone();
                let deleted: i64 = self
                    .round_trip("reset_all", del.query_async(&mut conn))
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "Reset matching windows");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.conn.write().take().is_some() {
            info!("Closed Redis counter store");
        }
        Ok(())
    }
}
