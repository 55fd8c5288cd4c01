//! Daily tick quotas.
//!
//! A task submission consumes `max_ticks` units against the submitting
//! user's daily budget before anything is published. The check must stay
//! atomic under concurrent submissions for the same user and day; the KV
//! backend runs a server-side compare-and-increment script, the in-memory
//! backend serializes behind a lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::error::QuotaError;
use crate::kv::KvConnector;

/// Outcome of a check-and-consume call. `remaining` is `None` when the
/// backend does not enforce a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: Option<i64>,
}

impl QuotaDecision {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
        }
    }
}

/// Strategy seam for quota backends. The relational backend lives outside
/// this crate; in here are the no-op, in-memory, and in-KV strategies.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Atomically check the remaining budget for `(user, today UTC)` and
    /// consume `units` if the budget covers them.
    async fn check_and_consume(
        &self,
        user_id: &str,
        email: &str,
        units: u32,
    ) -> Result<QuotaDecision, QuotaError>;
}

/// Allows everything. Used when quota enforcement is disabled.
pub struct NoopQuota;

#[async_trait]
impl QuotaManager for NoopQuota {
    async fn check_and_consume(
        &self,
        _user_id: &str,
        _email: &str,
        _units: u32,
    ) -> Result<QuotaDecision, QuotaError> {
        Ok(QuotaDecision::unlimited())
    }
}

/// Process-local quota with UTC-day rollover. Not suitable for
/// multi-instance deployments; the gateway uses it for dev runs and tests.
pub struct MemoryDailyQuota {
    limit: u32,
    usage: Mutex<DayUsage>,
}

struct DayUsage {
    day: NaiveDate,
    used: std::collections::HashMap<String, u64>,
}

impl MemoryDailyQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            usage: Mutex::new(DayUsage {
                day: Utc::now().date_naive(),
                used: std::collections::HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl QuotaManager for MemoryDailyQuota {
    async fn check_and_consume(
        &self,
        user_id: &str,
        _email: &str,
        units: u32,
    ) -> Result<QuotaDecision, QuotaError> {
        if self.limit == 0 || units == 0 {
            return Ok(QuotaDecision::unlimited());
        }
        let mut usage = self.usage.lock().await;
        let today = Utc::now().date_naive();
        if usage.day != today {
            usage.day = today;
            usage.used.clear();
        }
        let used = usage.used.entry(user_id.to_string()).or_insert(0);
        let limit = u64::from(self.limit);
        if *used + u64::from(units) > limit {
            let remaining = limit.saturating_sub(*used) as i64;
            return Ok(QuotaDecision {
                allowed: false,
                remaining: Some(remaining),
            });
        }
        *used += u64::from(units);
        Ok(QuotaDecision {
            allowed: true,
            remaining: Some((limit - *used) as i64),
        })
    }
}

/// Atomic read-check-increment. Creating the counter also stamps the TTL
/// so the key evicts itself at UTC midnight.
const CONSUME_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local units = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local current = tonumber(redis.call('GET', key) or '0')
if (current + units) > limit then
  return {0, limit - current}
end
local newv = redis.call('INCRBY', key, units)
if redis.call('TTL', key) < 0 then
  redis.call('EXPIRE', key, ttl)
end
return {1, limit - newv}
";

/// KV-backed daily quota: one counter per `(user, UTC day)` under
/// `quota:daily:{YYYYMMDD}:{user_id}`, expiring at UTC midnight.
///
/// Fails open: when the KV store is unreachable the request is allowed
/// with a warning, so store downtime does not take the gateway down with
/// it. Backend script errors are still surfaced as `QuotaError`.
pub struct KvDailyQuota {
    kv: Arc<KvConnector>,
    limit: u32,
}

impl KvDailyQuota {
    pub fn new(kv: Arc<KvConnector>, limit: u32) -> Self {
        Self { kv, limit }
    }

    fn key(user_id: &str) -> String {
        let day = Utc::now().format("%Y%m%d");
        format!("quota:daily:{day}:{user_id}")
    }
}

#[async_trait]
impl QuotaManager for KvDailyQuota {
    async fn check_and_consume(
        &self,
        user_id: &str,
        _email: &str,
        units: u32,
    ) -> Result<QuotaDecision, QuotaError> {
        if self.limit == 0 || units == 0 {
            return Ok(QuotaDecision::unlimited());
        }
        let Some(mut conn) = self.kv.client().await else {
            tracing::warn!(user_id, "kv unavailable, quota check bypassed (fail-open)");
            return Ok(QuotaDecision::unlimited());
        };

        let script = redis::Script::new(CONSUME_SCRIPT);
        let outcome: redis::RedisResult<(i64, i64)> = script
            .key(Self::key(user_id))
            .arg(i64::from(self.limit))
            .arg(i64::from(units))
            .arg(seconds_until_utc_midnight())
            .invoke_async(&mut conn)
            .await;

        match outcome {
            Ok((allowed, remaining)) => Ok(QuotaDecision {
                allowed: allowed == 1,
                remaining: Some(remaining.max(0)),
            }),
            Err(err) => {
                tracing::error!(user_id, error = %err, "quota script failed");
                Err(QuotaError::Backend(err.to_string()))
            }
        }
    }
}

/// Seconds from now until the next UTC midnight, at least 1.
pub fn seconds_until_utc_midnight() -> i64 {
    let now = Utc::now();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .expect("calendar does not end")
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc();
    (tomorrow - now).num_seconds().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_always_allows() {
        let decision = NoopQuota
            .check_and_consume("u-1", "u@example.com", 1_000_000)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, None);
    }

    #[tokio::test]
    async fn memory_quota_enforces_daily_limit() {
        let quota = MemoryDailyQuota::new(32);

        let first = quota.check_and_consume("u-1", "e", 15).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, Some(17));

        let second = quota.check_and_consume("u-1", "e", 15).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, Some(2));

        let third = quota.check_and_consume("u-1", "e", 15).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, Some(2));

        // A different user has an untouched budget.
        let other = quota.check_and_consume("u-2", "e", 15).await.unwrap();
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn zero_units_and_zero_limit_are_unlimited() {
        let quota = MemoryDailyQuota::new(0);
        assert!(quota.check_and_consume("u", "e", 50).await.unwrap().allowed);

        let quota = MemoryDailyQuota::new(10);
        let decision = quota.check_and_consume("u", "e", 0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, None);
    }

    #[tokio::test]
    async fn concurrent_grants_never_exceed_limit() {
        let quota = Arc::new(MemoryDailyQuota::new(32));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let quota = quota.clone();
            handles.push(tokio::spawn(async move {
                quota.check_and_consume("u-1", "e", 3).await.unwrap()
            }));
        }

        let mut granted = 0u64;
        for handle in handles {
            if handle.await.unwrap().allowed {
                granted += 3;
            }
        }
        assert!(granted <= 32, "granted {granted} units over a 32 limit");
        // 10 grants of 3 fit, the 11th does not.
        assert_eq!(granted, 30);
    }

    #[test]
    fn midnight_countdown_is_sane() {
        let seconds = seconds_until_utc_midnight();
        assert!(seconds >= 1);
        assert!(seconds <= 86_400);
    }
}
