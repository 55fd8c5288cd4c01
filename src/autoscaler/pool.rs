//! Worker-pool sizing through the external orchestration API.
//!
//! The orchestrator owning the container fleet is not this crate's
//! concern; it only needs "read desired count" and "set desired count".
//! The HTTP implementation speaks a minimal JSON contract:
//! `GET {base}/pool/desired -> {"desired": n}` and
//! `PUT {base}/pool/desired {"desired": n}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn desired_count(&self) -> Result<u32, PoolError>;
    async fn set_desired_count(&self, desired: u32) -> Result<(), PoolError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct DesiredCount {
    desired: u32,
}

pub struct HttpWorkerPool {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkerPool {
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

    fn endpoint(&self) -> String {
        format!("{}/pool/desired", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl WorkerPool for HttpWorkerPool {
    async fn desired_count(&self) -> Result<u32, PoolError> {
        let response = self
            .client
            .get(self.endpoint())
            .send()
            .await
            .map_err(|err| PoolError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PoolError::Unavailable(format!(
                "orchestrator answered {}",
                response.status()
            )));
        }
        let body: DesiredCount = response
            .json()
            .await
            .map_err(|err| PoolError::Unavailable(err.to_string()))?;
        Ok(body.desired)
    }

    async fn set_desired_count(&self, desired: u32) -> Result<(), PoolError> {
        let response = self
            .client
            .put(self.endpoint())
            .json(&DesiredCount { desired })
            .send()
            .await
            .map_err(|err| PoolError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PoolError::Unavailable(format!(
                "orchestrator answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}
