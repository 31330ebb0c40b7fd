use std::fmt;

use chrono::{DateTime, Utc};
use modelops::{Modality, Urgency};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TaskStoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    /// Failed, waiting for its backoff to elapse before going back to pending.
    Failed,
    /// Attempt cap reached. Kept for operator attention, never retried automatically.
    PermanentlyFailed,
    Synced,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::PermanentlyFailed => "permanently_failed",
            TaskStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "permanently_failed" => TaskStatus::PermanentlyFailed,
            "synced" => TaskStatus::Synced,
            _ => return None,
        })
    }

    /// Position along the forward lifecycle, used to check monotonic progress.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::PermanentlyFailed => 2,
            TaskStatus::Synced => 3,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub kind: Modality,
    pub urgency: Urgency,
    /// Where the media lives. Never the media itself.
    pub payload_ref: String,
    /// Instruction or text input accompanying the media.
    pub prompt: Option<String>,
    /// Set when the caller wants identical payloads collapsed into one task.
    pub content_hash: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfflineTask {
    pub id: Uuid,
    pub kind: Modality,
    pub urgency: Urgency,
    pub payload_ref: String,
    pub prompt: Option<String>,
    pub content_hash: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sync_attempts: u32,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// What `mark_failed` did with the task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    RetryScheduled { attempt: u32, next_attempt_at: DateTime<Utc> },
    Permanent { attempts: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed_unsynced: u64,
    pub failed: u64,
    pub permanently_failed: u64,
    pub synced: u64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub kind: String,
    pub urgency: String,
    pub payload_ref: String,
    pub prompt: Option<String>,
    pub content_hash: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub attempt_count: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub result_ref: Option<String>,
    pub completed_at: Option<i64>,
    pub sync_attempts: i64,
    pub next_sync_at: Option<i64>,
    pub last_sync_error: Option<String>,
    pub synced_at: Option<i64>,
}

fn ts(ms: i64) -> Result<DateTime<Utc>, TaskStoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| TaskStoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn ts_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, TaskStoreError> {
    ms.map(ts).transpose()
}

impl TryFrom<TaskRow> for OfflineTask {
    type Error = TaskStoreError;

    fn try_from(r: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, v: &str| TaskStoreError::Corrupt(format!("{what}: {v}"));
        Ok(OfflineTask {
            id: Uuid::parse_str(&r.id).map_err(|_| corrupt("id", &r.id))?,
            kind: r.kind.parse().map_err(|_| corrupt("kind", &r.kind))?,
            urgency: r.urgency.parse().map_err(|_| corrupt("urgency", &r.urgency))?,
            status: TaskStatus::parse(&r.status).ok_or_else(|| corrupt("status", &r.status))?,
            payload_ref: r.payload_ref,
            prompt: r.prompt,
            content_hash: r.content_hash,
            created_at: ts(r.created_at)?,
            updated_at: ts(r.updated_at)?,
            attempt_count: r.attempt_count.max(0) as u32,
            next_attempt_at: ts(r.next_attempt_at)?,
            last_error: r.last_error,
            result_ref: r.result_ref,
            completed_at: ts_opt(r.completed_at)?,
            sync_attempts: r.sync_attempts.max(0) as u32,
            next_sync_at: ts_opt(r.next_sync_at)?,
            last_sync_error: r.last_sync_error,
            synced_at: ts_opt(r.synced_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::PermanentlyFailed,
            TaskStatus::Synced,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("done"), None);
    }

    #[test]
    fn test_rank_is_forward_only() {
        assert!(TaskStatus::Pending.rank() < TaskStatus::Processing.rank());
        assert!(TaskStatus::Processing.rank() < TaskStatus::Completed.rank());
        assert!(TaskStatus::Completed.rank() < TaskStatus::Synced.rank());
    }
}
