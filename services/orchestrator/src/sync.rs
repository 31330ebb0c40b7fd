use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use modelops::{Modality, Urgency};
use serde::Serialize;
use sha2::Sha256;
use taskstore::OfflineTask;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

/// What the remote receives for one completed task.
#[derive(Clone, Debug, Serialize)]
pub struct SyncRecord {
    pub task_id: Uuid,
    pub kind: Modality,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub result: serde_json::Value,
}

impl SyncRecord {
    pub fn new(task: &OfflineTask, result: serde_json::Value) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            urgency: task.urgency,
            created_at: task.created_at,
            completed_at: task.completed_at,
            attempt_count: task.attempt_count,
            result,
        }
    }
}

/// The remote that completed results are delivered to. Delivery is
/// at-least-once; the remote deduplicates on the task id.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn push(&self, record: &SyncRecord) -> Result<(), SyncError>;
}

pub struct HttpSyncClient {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpSyncClient {
    pub fn new(url: String, secret: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        if secret.is_none() {
            warn!(url = %url, "sync: no SYNC_SECRET set, pushes are signed with an empty key");
        }
        Ok(Self { client, url, secret: secret.unwrap_or_default() })
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn push(&self, record: &SyncRecord) -> Result<(), SyncError> {
        let body = serde_json::to_string(record).map_err(|e| SyncError::Payload(e.to_string()))?;
        let ts = Utc::now().timestamp();
        let signature = sign_payload(&self.secret, ts, &body)?;

        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", record.task_id.to_string())
            .header("X-Timestamp", ts.to_string())
            .header("X-Signature", signature)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        // 409: the remote already has this task from an earlier push.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            info!(task_id = %record.task_id, status = %status, "sync: delivered");
            Ok(())
        } else {
            Err(SyncError::Rejected { status: status.as_u16() })
        }
    }
}

pub fn sign_payload(secret: &str, ts: i64, body: &str) -> Result<String, SyncError> {
    let payload = format!("{}.{}", ts, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::Payload(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Exponential push backoff on the number of failed pushes so far, with up
/// to 10% jitter so a fleet coming back online does not push in lockstep.
pub fn push_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    use rand::Rng;
    let exp = failures.saturating_sub(1).min(16);
    let delay = base.saturating_mul(2u32.pow(exp)).min(max);
    let jitter_ms = (delay.as_millis() as u64) / 10;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_keyed() {
        let a = sign_payload("s3cret", 1_700_000_000, r#"{"task_id":"x"}"#).unwrap();
        let b = sign_payload("s3cret", 1_700_000_000, r#"{"task_id":"x"}"#).unwrap();
        let c = sign_payload("other", 1_700_000_000, r#"{"task_id":"x"}"#).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_push_backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        let first = push_backoff(1, base, max);
        assert!(first >= base && first <= base + base / 10);
        let capped = push_backoff(30, base, max);
        assert!(capped >= max && capped <= max + max / 10);
    }
}
