//! Key/value store connector.
//!
//! Lazy, verified connection to the KV store with JSON values and TTL.
//! One multiplexed client is shared by every caller; `client()` returns
//! `None` when the store is unreachable and callers treat that as a
//! transient miss. The resilient get/set variants wait for the store to
//! come back for a caller-supplied wall-clock budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{KvError, is_dns_failure};
use crate::retry::{Deadline, RetryConfig, resilient_read_delay, resilient_write_delay};
use crate::settings::{Settings, redact_url};

pub struct KvConnector {
    url: Option<String>,
    connect_schedule: RetryConfig,
    conn: Mutex<Option<MultiplexedConnection>>,
    ready: AtomicBool,
    connection_logged: AtomicBool,
}

impl KvConnector {
    pub fn new(url: Option<String>, jitter: Duration) -> Self {
        Self {
            url,
            connect_schedule: RetryConfig::connect_schedule(jitter),
            conn: Mutex::new(None),
            ready: AtomicBool::new(false),
            connection_logged: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.redis_url.clone(), settings.jitter)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Explicit connect for process startup: bounded to 10 attempts on the
    /// shared connection schedule.
    pub async fn connect(&self) -> Result<(), KvError> {
        if self.url.is_none() {
            return Err(KvError::Unconfigured);
        }
        let ok = self
            .connect_schedule
            .clone()
            .bounded(10)
            .run_until("kv_connect", |_| self.try_init())
            .await;
        if ok { Ok(()) } else { Err(KvError::NotConnected) }
    }

    pub async fn disconnect(&self) {
        *self.conn.lock().await = None;
        self.ready.store(false, Ordering::Relaxed);
        self.connection_logged.store(false, Ordering::Relaxed);
        tracing::info!("kv store disconnected");
    }

    /// Single connection attempt: open a client, ping, and share it.
    async fn try_init(&self) -> bool {
        let Some(url) = &self.url else {
            tracing::warn!("kv URL not set");
            return false;
        };

        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(err) => {
                self.log_connect_failure(&err);
                return false;
            }
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                self.log_connect_failure(&err);
                return false;
            }
        };
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        if let Err(err) = pong {
            self.log_connect_failure(&err);
            return false;
        }

        *self.conn.lock().await = Some(conn);
        self.ready.store(true, Ordering::Relaxed);
        if !self.connection_logged.swap(true, Ordering::Relaxed) {
            tracing::info!(url = %redact_url(url), "kv store connected");
        }
        true
    }

    fn log_connect_failure(&self, err: &redis::RedisError) {
        let message = err.to_string();
        let error_kind = if is_dns_failure(&message) { "dns" } else { "connection" };
        tracing::warn!(error = %message, error_kind, "kv connection attempt failed");
        self.ready.store(false, Ordering::Relaxed);
        self.connection_logged.store(false, Ordering::Relaxed);
    }

    /// Verify the shared client, reconnecting once if the ping fails.
    /// Idempotent and cheap when the connection is healthy.
    pub async fn init(&self) -> bool {
        if self.is_ready() {
            let existing = self.conn.lock().await.clone();
            if let Some(mut conn) = existing {
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                if pong.is_ok() {
                    return true;
                }
                tracing::warn!("kv connection lost, reinitializing");
                self.mark_lost().await;
            }
        }
        self.try_init().await
    }

    /// The shared client, or `None` when the store is not reachable right
    /// now. Callers must treat `None` as a transient miss.
    pub async fn client(&self) -> Option<MultiplexedConnection> {
        if !self.init().await {
            return None;
        }
        self.conn.lock().await.clone()
    }

    async fn mark_lost(&self) {
        *self.conn.lock().await = None;
        self.ready.store(false, Ordering::Relaxed);
        self.connection_logged.store(false, Ordering::Relaxed);
    }

    /// Read and JSON-decode a key. A value that is not valid JSON comes
    /// back as a raw string.
    pub async fn get_json(&self, key: &str) -> Option<Value> {
        let Some(mut conn) = self.client().await else {
            tracing::warn!(key, "kv client not available for get");
            return None;
        };
        let data: redis::RedisResult<Option<Vec<u8>>> = conn.get(key).await;
        match data {
            Ok(Some(bytes)) => Some(decode_value(&bytes)),
            Ok(None) => None,
            Err(err) => {
                tracing::error!(key, error = %err, "kv get failed");
                self.mark_lost().await;
                None
            }
        }
    }

    /// Write a JSON value, optionally with expiry. Returns true iff the
    /// store confirmed the SET.
    pub async fn set_json(&self, key: &str, value: &Value, ex: Option<u64>) -> bool {
        let Some(mut conn) = self.client().await else {
            tracing::warn!(key, "kv client not available for set");
            return false;
        };
        let payload = value.to_string();
        let result: redis::RedisResult<()> = match ex {
            Some(seconds) => conn.set_ex(key, payload, seconds).await,
            None => conn.set(key, payload).await,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(key, error = %err, "kv set failed");
                self.mark_lost().await;
                false
            }
        }
    }

    /// Read with a wall-clock budget, waiting out store downtime. A key
    /// that is confirmed absent returns `None` without retrying.
    pub async fn get_json_resilient(&self, key: &str, max_wait: Duration) -> Option<Value> {
        let deadline = Deadline::new(max_wait);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(mut conn) = self.client().await {
                let data: redis::RedisResult<Option<Vec<u8>>> = conn.get(key).await;
                match data {
                    Ok(Some(bytes)) => return Some(decode_value(&bytes)),
                    Ok(None) => return None,
                    Err(err) => {
                        if attempt == 1 || attempt.is_multiple_of(10) {
                            tracing::debug!(
                                key,
                                attempt,
                                elapsed_s = deadline.elapsed().as_secs(),
                                error = %err,
                                "resilient get attempt failed"
                            );
                        }
                        self.mark_lost().await;
                    }
                }
            }
            if !deadline.sleep(resilient_read_delay(attempt)).await {
                tracing::debug!(key, elapsed_s = deadline.elapsed().as_secs(), "resilient get timed out");
                return None;
            }
        }
    }

    /// Write with a wall-clock budget, waiting out store downtime. Used
    /// for every critical status transition.
    pub async fn set_json_resilient(
        &self,
        key: &str,
        value: &Value,
        ex: Option<u64>,
        max_wait: Duration,
    ) -> bool {
        let deadline = Deadline::new(max_wait);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.set_json_once(key, value, ex).await {
                if attempt > 1 {
                    tracing::debug!(key, attempt, "resilient set succeeded");
                }
                return true;
            }
            if attempt == 1 || attempt.is_multiple_of(10) {
                tracing::debug!(
                    key,
                    attempt,
                    elapsed_s = deadline.elapsed().as_secs(),
                    "resilient set attempt failed"
                );
            }
            if !deadline.sleep(resilient_write_delay(attempt)).await {
                tracing::warn!(key, elapsed_s = deadline.elapsed().as_secs(), "resilient set timed out");
                return false;
            }
        }
    }

    async fn set_json_once(&self, key: &str, value: &Value, ex: Option<u64>) -> bool {
        let Some(mut conn) = self.client().await else {
            return false;
        };
        let payload = value.to_string();
        let result: redis::RedisResult<()> = match ex {
            Some(seconds) => conn.set_ex(key, payload, seconds).await,
            None => conn.set(key, payload).await,
        };
        match result {
            Ok(()) => true,
            Err(_) => {
                self.mark_lost().await;
                false
            }
        }
    }
}

fn decode_value(bytes: &[u8]) -> Value {
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "kv value is not JSON, returning raw string");
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

/// Scan the keyspace for `pattern`, paging with the given count hint.
pub async fn scan_keys(
    conn: &mut MultiplexedConnection,
    pattern: &str,
    count: usize,
) -> Result<Vec<String>, KvError> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(conn)
            .await
            .map_err(KvError::Backend)?;
        keys.extend(page);
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_falls_back_to_raw_string() {
        assert_eq!(decode_value(b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(decode_value(b"not json"), json!("not json"));
    }

    #[tokio::test]
    async fn unconfigured_connector_stays_unready() {
        let kv = KvConnector::new(None, Duration::ZERO);
        assert!(matches!(kv.connect().await, Err(KvError::Unconfigured)));
        assert!(!kv.init().await);
        assert!(kv.client().await.is_none());
        assert!(!kv.is_ready());
        assert!(kv.get_json("task:none").await.is_none());
        assert!(!kv.set_json("task:none", &json!({}), Some(1)).await);
    }

    #[tokio::test]
    async fn resilient_set_gives_up_at_deadline() {
        tokio::time::pause();
        let kv = KvConnector::new(None, Duration::ZERO);
        let ok = kv
            .set_json_resilient("task:x", &json!({"status": "failed"}), Some(600), Duration::from_secs(20))
            .await;
        assert!(!ok);
    }
}
