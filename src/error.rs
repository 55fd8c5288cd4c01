//! Error types for the execution plane.
//!
//! Connectors recover transient failures internally through the retry
//! driver and only surface exhaustion. The gateway maps these onto HTTP
//! statuses; the worker records them on the task instead of crashing.

/// Errors from the message-broker connector.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No broker URL configured; the connector stays un-ready.
    #[error("broker URL not configured")]
    Unconfigured,

    /// The connector could not reach a ready channel.
    #[error("broker not connected")]
    NotConnected,

    /// Underlying AMQP failure.
    #[error("broker protocol error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Payload could not be serialized to UTF-8 JSON.
    #[error("payload encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// All publish attempts for a message were used up.
    #[error("publish to '{queue}' failed after {attempts} attempts")]
    PublishExhausted { queue: String, attempts: u32 },
}

/// Errors from the key/value store connector.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// No KV URL configured; the connector stays un-ready.
    #[error("kv URL not configured")]
    Unconfigured,

    /// The connector could not produce a live client.
    #[error("kv store not connected")]
    NotConnected,

    /// Underlying store failure.
    #[error("kv store error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Errors from the task-record layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A critical write was not confirmed by the store. The gateway must
    /// not return 202 when this is raised for the intake record.
    #[error("storage unavailable for key '{key}'")]
    Unavailable { key: String },

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Errors from a quota backend. Exhausted quota is not an error; it is an
/// `allowed = false` decision.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota backend failure: {0}")]
    Backend(String),
}

/// Errors from bearer-token validation.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization: Bearer` header on the request.
    #[error("missing bearer token")]
    Missing,

    /// The identity service rejected the token.
    #[error("invalid bearer token")]
    Invalid,

    /// The identity service could not be reached.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by an agent run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent execution failed: {0}")]
    Failed(String),
}

/// Errors from the orchestration API that owns the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("orchestrator not configured")]
    Unconfigured,

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

/// Classify a connection failure as a DNS resolution problem from its
/// message. These are logged distinctly but retried on the same schedule.
pub fn is_dns_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("failed to lookup address")
        || lower.contains("cannot resolve")
        || lower.contains("name resolution")
        || lower.contains("dns error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_failures_are_classified() {
        assert!(is_dns_failure(
            "Name or service not known (os error -2)"
        ));
        assert!(is_dns_failure("failed to lookup address information"));
        assert!(!is_dns_failure("connection refused"));
        assert!(!is_dns_failure("timed out"));
    }
}
