use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelops::{Modality, Urgency};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::schema::TaskRow;
use crate::{
    FailureOutcome, NewTask, OfflineTask, Result, RetryPolicy, StorageStats, TaskStatus,
    TaskStoreError,
};

const DB_FILE: &str = "offline_tasks.db";

const TASK_COLUMNS: &str = "id, kind, urgency, payload_ref, prompt, content_hash, status, created_at, \
     updated_at, attempt_count, next_attempt_at, last_error, result_ref, completed_at, \
     sync_attempts, next_sync_at, last_sync_error, synced_at";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn after(d: Duration) -> i64 {
    now_ms().saturating_add(d.as_millis().min(i64::MAX as u128) as i64)
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Durable queue of work deferred while the device was offline or saturated.
///
/// Claiming is a single `UPDATE ... RETURNING` guarded on `status = 'pending'`,
/// so concurrent callers of [`TaskStore::next_pending`] never receive the same
/// task. Every other transition is guarded on the status it leaves.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    payload_dir: PathBuf,
    retry: RetryPolicy,
}

impl TaskStore {
    /// Opens (or creates) the store under `root` and applies migrations.
    pub async fn open(root: impl AsRef<Path>, retry: RetryPolicy) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;

        let opts = SqliteConnectOptions::new()
            .filename(root.join(DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let payload_dir = root.join("pending");
        tokio::fs::create_dir_all(&payload_dir).await?;

        info!(root = %root.display(), "task store opened");
        Ok(Self { pool, payload_dir, retry })
    }

    /// Resets tasks left in `processing` by a crash. Nothing about a partial
    /// run is trusted, the attempt that was interrupted still counts: tasks
    /// that already used their last attempt are parked instead of requeued,
    /// so a payload that takes the process down every time stops doing so.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let now = now_ms();
        let max = self.retry.max_attempts as i64;

        let parked = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'permanently_failed',
                last_error = 'interrupted by a restart on its last attempt',
                updated_at = ?1
            WHERE status = 'processing' AND attempt_count >= ?2
            "#,
        )
        .bind(now)
        .bind(max)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if parked > 0 {
            warn!(count = parked, "interrupted tasks out of attempts, parked as permanently failed");
        }

        let res = sqlx::query(
            "UPDATE offline_tasks SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let n = res.rows_affected();
        if n > 0 {
            warn!(count = n, "recovered tasks interrupted mid-processing");
        }
        Ok(n + parked)
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
        if let Some(hash) = &task.content_hash {
            if let Some(existing) = self.find_duplicate(task.kind, hash).await? {
                info!(task_id = %existing, kind = %task.kind, "duplicate payload, reusing task");
                return Ok(existing);
            }
        }
        let id = Uuid::new_v4();
        self.insert(id, &task).await?;
        Ok(id)
    }

    /// Copies `source` into the store's own payload area and enqueues it, so
    /// the task keeps its media even if the upload area is cleaned up.
    pub async fn enqueue_file(
        &self,
        kind: Modality,
        urgency: Urgency,
        source: &Path,
        prompt: Option<String>,
        dedupe: bool,
    ) -> Result<Uuid> {
        let content_hash = if dedupe {
            Some(hash_file(source.to_path_buf(), prompt.clone()).await?)
        } else {
            None
        };

        if let Some(hash) = &content_hash {
            if let Some(existing) = self.find_duplicate(kind, hash).await? {
                info!(task_id = %existing, kind = %kind, "duplicate payload, reusing task");
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4();
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload".to_string());
        let kind_dir = self.payload_dir.join(kind.as_str());
        tokio::fs::create_dir_all(&kind_dir).await?;
        let dest = kind_dir.join(format!("{id}_{file_name}"));
        tokio::fs::copy(source, &dest).await?;

        let task = NewTask {
            kind,
            urgency,
            payload_ref: dest.to_string_lossy().into_owned(),
            prompt,
            content_hash,
        };
        self.insert(id, &task).await?;
        Ok(id)
    }

    async fn insert(&self, id: Uuid, task: &NewTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO offline_tasks
                (id, kind, urgency, payload_ref, prompt, content_hash, status,
                 created_at, updated_at, attempt_count, next_attempt_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7, 0, ?7)
            "#,
        )
        .bind(id.to_string())
        .bind(task.kind.as_str())
        .bind(task.urgency.as_str())
        .bind(&task.payload_ref)
        .bind(&task.prompt)
        .bind(&task.content_hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        info!(task_id = %id, kind = %task.kind, payload = %task.payload_ref, "task enqueued");
        Ok(())
    }

    async fn find_duplicate(&self, kind: Modality, hash: &str) -> Result<Option<Uuid>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM offline_tasks
            WHERE kind = ?1 AND content_hash = ?2 AND status != 'permanently_failed'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        id.map(|s| Uuid::parse_str(&s).map_err(|_| TaskStoreError::Corrupt(format!("id: {s}"))))
            .transpose()
    }

    /// Claims the oldest due pending task (pending -> processing) and bumps its
    /// attempt count. Tasks out of attempts are never claimed. Returns `None`
    /// when nothing is due.
    pub async fn next_pending(&self) -> Result<Option<OfflineTask>> {
        let sql = format!(
            r#"
            UPDATE offline_tasks
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                updated_at = ?1
            WHERE id = (
                SELECT id FROM offline_tasks
                WHERE status = 'pending' AND next_attempt_at <= ?1 AND attempt_count < ?2
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(now_ms())
            .bind(self.retry.max_attempts as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OfflineTask::try_from).transpose()
    }

    /// Hands a claimed task back without counting the attempt. Used when the
    /// device could not even start the work (no permit, no model).
    pub async fn unclaim(&self, id: Uuid) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'pending',
                attempt_count = MAX(attempt_count - 1, 0),
                updated_at = ?2
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.ensure_moved(id, res.rows_affected(), TaskStatus::Pending).await
    }

    pub async fn mark_completed(&self, id: Uuid, result_ref: &str) -> Result<()> {
        let now = now_ms();
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'completed',
                result_ref = ?2,
                last_error = NULL,
                completed_at = ?3,
                next_sync_at = ?3,
                updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id.to_string())
        .bind(result_ref)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.ensure_moved(id, res.rows_affected(), TaskStatus::Completed).await?;
        info!(task_id = %id, result = %result_ref, "task completed");
        Ok(())
    }

    /// Records a failed attempt. Schedules a retry after backoff, or parks the
    /// task as permanently failed once the attempt cap is reached.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<FailureOutcome> {
        let task = self.get(id).await?.ok_or(TaskStoreError::NotFound(id))?;
        if task.status != TaskStatus::Processing {
            return Err(TaskStoreError::InvalidTransition {
                id,
                from: task.status,
                to: TaskStatus::Failed,
            });
        }

        let attempts = task.attempt_count;
        let now = now_ms();

        if self.retry.exhausted(attempts) {
            let res = sqlx::query(
                r#"
                UPDATE offline_tasks
                SET status = 'permanently_failed', last_error = ?2, updated_at = ?3
                WHERE id = ?1 AND status = 'processing'
                "#,
            )
            .bind(id.to_string())
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?;
            self.ensure_moved(id, res.rows_affected(), TaskStatus::PermanentlyFailed)
                .await?;

            warn!(task_id = %id, attempts, error = %error, "task permanently failed, needs operator attention");
            return Ok(FailureOutcome::Permanent { attempts });
        }

        let next = after(self.retry.backoff_for(attempts));
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'failed', last_error = ?2, next_attempt_at = ?3, updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(next)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.ensure_moved(id, res.rows_affected(), TaskStatus::Failed).await?;

        warn!(task_id = %id, attempts, error = %error, "task failed, retry scheduled");
        Ok(FailureOutcome::RetryScheduled {
            attempt: attempts,
            next_attempt_at: to_datetime(next),
        })
    }

    /// Moves failed tasks whose backoff has elapsed back to pending.
    pub async fn release_due_retries(&self) -> Result<u64> {
        let now = now_ms();
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'pending', updated_at = ?1
            WHERE status = 'failed' AND next_attempt_at <= ?1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Completed tasks whose next delivery attempt is due, oldest first.
    pub async fn due_for_sync(&self, limit: u32) -> Result<Vec<OfflineTask>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM offline_tasks
            WHERE status = 'completed' AND (next_sync_at IS NULL OR next_sync_at <= ?1)
            ORDER BY completed_at ASC
            LIMIT ?2
            "#
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(now_ms())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OfflineTask::try_from).collect()
    }

    /// Notes a failed delivery. The task stays completed; its result is kept.
    pub async fn record_sync_failure(&self, id: Uuid, error: &str, retry_in: Duration) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET sync_attempts = sync_attempts + 1,
                last_sync_error = ?2,
                next_sync_at = ?3,
                updated_at = ?4
            WHERE id = ?1 AND status = 'completed'
            "#,
        )
        .bind(id.to_string())
        .bind(error)
        .bind(after(retry_in))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.ensure_moved(id, res.rows_affected(), TaskStatus::Completed).await
    }

    /// Completed -> synced, after the remote acknowledged. Repeating it is a no-op.
    pub async fn mark_synced(&self, id: Uuid) -> Result<()> {
        let now = now_ms();
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'synced', synced_at = ?2, updated_at = ?2, last_sync_error = NULL
            WHERE id = ?1 AND status = 'completed'
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            if let Some(t) = self.get(id).await? {
                if t.status == TaskStatus::Synced {
                    return Ok(());
                }
            }
        }
        self.ensure_moved(id, res.rows_affected(), TaskStatus::Synced).await?;
        info!(task_id = %id, "task synced");
        Ok(())
    }

    /// Operator retry: puts a (permanently) failed task back in the queue with a fresh attempt budget.
    pub async fn retry_failed(&self, id: Uuid) -> Result<()> {
        let now = now_ms();
        let res = sqlx::query(
            r#"
            UPDATE offline_tasks
            SET status = 'pending', attempt_count = 0, next_attempt_at = ?2, updated_at = ?2
            WHERE id = ?1 AND status IN ('failed', 'permanently_failed')
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.ensure_moved(id, res.rows_affected(), TaskStatus::Pending).await?;
        info!(task_id = %id, "task re-queued by operator");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<OfflineTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM offline_tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OfflineTask::try_from).transpose()
    }

    pub async fn list_by_status(&self, status: TaskStatus, limit: u32) -> Result<Vec<OfflineTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offline_tasks WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OfflineTask::try_from).collect()
    }

    /// Pending tasks in creation order, optionally of one kind. Does not claim.
    pub async fn list_pending(&self, kind: Option<Modality>) -> Result<Vec<OfflineTask>> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM offline_tasks
            WHERE status = 'pending' AND (?1 IS NULL OR kind = ?1)
            ORDER BY created_at ASC, rowid ASC
            "#
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(kind.map(|k| k.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OfflineTask::try_from).collect()
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM offline_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = StorageStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => stats.pending = count,
                Some(TaskStatus::Processing) => stats.processing = count,
                Some(TaskStatus::Completed) => stats.completed_unsynced = count,
                Some(TaskStatus::Failed) => stats.failed = count,
                Some(TaskStatus::PermanentlyFailed) => stats.permanently_failed = count,
                Some(TaskStatus::Synced) => stats.synced = count,
                None => warn!(status = %status, count, "unknown task status in store"),
            }
        }
        Ok(stats)
    }

    /// Deletes synced tasks acknowledged more than `older_than` ago, together
    /// with payload copies this store made. Returns the removed records.
    pub async fn purge_synced(&self, older_than: Duration) -> Result<Vec<OfflineTask>> {
        let cutoff = now_ms().saturating_sub(older_than.as_millis().min(i64::MAX as u128) as i64);
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offline_tasks WHERE status = 'synced' AND synced_at <= ?1"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        let tasks: Vec<OfflineTask> = rows
            .into_iter()
            .map(OfflineTask::try_from)
            .collect::<Result<_>>()?;

        for t in &tasks {
            let payload = Path::new(&t.payload_ref);
            if payload.starts_with(&self.payload_dir) {
                if let Err(e) = tokio::fs::remove_file(payload).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(task_id = %t.id, error = %e, "could not remove payload copy");
                    }
                }
            }
            sqlx::query("DELETE FROM offline_tasks WHERE id = ?1 AND status = 'synced'")
                .bind(t.id.to_string())
                .execute(&self.pool)
                .await?;
        }

        if !tasks.is_empty() {
            info!(count = tasks.len(), "purged synced tasks");
        }
        Ok(tasks)
    }

    async fn ensure_moved(&self, id: Uuid, rows: u64, to: TaskStatus) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }
        match self.get(id).await? {
            None => Err(TaskStoreError::NotFound(id)),
            Some(t) => Err(TaskStoreError::InvalidTransition { id, from: t.status, to }),
        }
    }
}

/// Hash of the payload bytes and the instruction that goes with them. The
/// same media asked about twice in different ways is two pieces of work.
async fn hash_file(path: PathBuf, prompt: Option<String>) -> Result<String> {
    let hash = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        let mut f = std::fs::File::open(&path)?;
        std::io::copy(&mut f, &mut hasher)?;
        hasher.update(b"\n");
        hasher.update(prompt.as_deref().unwrap_or("").as_bytes());
        Ok(hex::encode(hasher.finalize().as_bytes()))
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
    Ok(hash)
}
