//! Idempotency module
//!
//! Prevents duplicate request processing using idempotency keys. A key is
//! claimed before the operation runs; a repeat of a completed request replays
//! the stored response instead of writing again.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{LedgerError, OperationContext};
use crate::store::LedgerStore;

/// A key still processing after this long is considered abandoned
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 5;

/// Idempotency key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }
}

impl From<String> for IdempotencyStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "completed" => IdempotencyStatus::Completed,
            "failed" => IdempotencyStatus::Failed,
            _ => IdempotencyStatus::Processing,
        }
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored idempotency key information
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: Uuid,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response: Option<serde_json::Value>,
    pub processing_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(key: Uuid, request_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            key,
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Processing,
            response: None,
            processing_started_at: now,
            created_at: now,
        }
    }
}

/// Compute SHA-256 hash of a request for conflict detection
pub fn compute_request_hash(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Runs an operation at most once per (owner, key)
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Run `op` unless `key` was already completed for an identical request.
    /// Without a key, `op` simply runs.
    pub async fn run<Req, Res, F, Fut>(
        &self,
        ctx: &OperationContext,
        key: Option<Uuid>,
        request: &Req,
        op: F,
    ) -> Result<Res, LedgerError>
    where
        Req: Serialize + ?Sized,
        Res: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Res, LedgerError>>,
    {
        let Some(key) = key else {
            return op().await;
        };

        let body = serde_json::to_vec(request)
            .map_err(|e| LedgerError::validation(format!("unserializable request: {}", e)))?;
        let request_hash = compute_request_hash(&body);

        if let Some(existing) = self
            .store
            .start_idempotent(ctx.owner(), key, &request_hash)
            .await?
        {
            tracing::info!(
                idempotency_key = %key,
                "Returning cached response for idempotent request"
            );
            let response = existing.response.unwrap_or(serde_json::Value::Null);
            return serde_json::from_value(response)
                .map_err(|e| LedgerError::Store(e.into()));
        }

        match op().await {
            Ok(response) => {
                let stored = serde_json::to_value(&response)
                    .map_err(|e| LedgerError::Store(e.into()))?;
                if let Err(e) = self
                    .store
                    .complete_idempotent(ctx.owner(), key, stored)
                    .await
                {
                    // The operation itself succeeded; a retry will be reported
                    // as in flight until the key times out
                    tracing::warn!(idempotency_key = %key, error = %e, "Failed to store idempotent response");
                }
                Ok(response)
            }
            Err(err) => {
                if let Err(e) = self.store.fail_idempotent(ctx.owner(), key).await {
                    tracing::warn!(idempotency_key = %key, error = %e, "Failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}
