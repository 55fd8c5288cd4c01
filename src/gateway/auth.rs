//! Bearer-token validation for the gateway.
//!
//! Token issuance and user management live in an external identity
//! service; the gateway only asks it "who is this token" and receives a
//! subject id and email back. Transport failure is distinct from
//! rejection: a rejected token is the caller's problem (401), an
//! unreachable identity service is ours (503).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AuthError;

/// The authenticated submitter of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: String,
    pub email: String,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError>;
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    #[serde(alias = "id", alias = "sub")]
    user_id: String,
    #[serde(default)]
    email: String,
}

/// Asks the identity service to resolve the token.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenVerifier {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError> {
        let url = format!("{}/auth/user", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::Invalid);
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!(
                "identity service answered {status}"
            )));
        }

        let identity: IdentityResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(Subject {
            user_id: identity.user_id,
            email: identity.email,
        })
    }
}

/// Fixed token map for tests and single-user dev runs.
#[derive(Default)]
pub struct StaticTokenVerifier {
    subjects: HashMap<String, Subject>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.subjects.insert(
            token.into(),
            Subject {
                user_id: user_id.into(),
                email: email.into(),
            },
        );
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError> {
        self.subjects.get(token).cloned().ok_or(AuthError::Invalid)
    }
}

/// Pull the bearer token out of an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_resolves_known_tokens() {
        let verifier = StaticTokenVerifier::new().with_token("tok-1", "u-1", "u@example.com");
        let subject = verifier.verify("tok-1").await.unwrap();
        assert_eq!(subject.user_id, "u-1");
        assert!(matches!(
            verifier.verify("tok-2").await,
            Err(AuthError::Invalid)
        ));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(matches!(bearer_token(Some("Basic abc")), Err(AuthError::Missing)));
        assert!(matches!(bearer_token(Some("Bearer ")), Err(AuthError::Missing)));
        assert!(matches!(bearer_token(None), Err(AuthError::Missing)));
    }

    #[test]
    fn identity_response_accepts_id_aliases() {
        let parsed: IdentityResponse =
            serde_json::from_str(r#"{"sub": "u-9", "email": "x@y.z"}"#).unwrap();
        assert_eq!(parsed.user_id, "u-9");

        let parsed: IdentityResponse = serde_json::from_str(r#"{"id": "u-8"}"#).unwrap();
        assert_eq!(parsed.user_id, "u-8");
        assert_eq!(parsed.email, "");
    }
}
