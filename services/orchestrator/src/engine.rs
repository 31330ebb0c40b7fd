//! The narrow interface the rest of the application talks to.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelops::{DeviceCapabilityProfile, LoadLevel, Modality, Urgency, VariantId};
use serde::{Deserialize, Serialize};
use taskstore::{content_hash, NewTask, OfflineTask, StorageStats, TaskStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectivity::Connectivity;
use crate::dispatcher::{Dispatcher, InferenceJob, JobOrigin};
use crate::drainer::Drainer;
use crate::error::{DispatchError, EngineError};
use crate::monitor::LoadSample;
use crate::provider::InferenceInput;
use crate::runtime::LoadState;

/// `payload_ref` of queued requests that carried only text.
pub const INLINE_PAYLOAD: &str = "inline";

#[derive(Clone, Debug, Deserialize)]
pub struct SubmitRequest {
    pub modality: Modality,
    #[serde(default)]
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Completed {
        variant: VariantId,
        model_tag: String,
        result: String,
        elapsed_ms: u64,
    },
    Queued {
        task_id: Uuid,
        /// Which transient failure sent the request to the queue.
        cause: &'static str,
        reason: String,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    pub kind: Modality,
    pub urgency: Urgency,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl From<&OfflineTask> for TaskView {
    fn from(t: &OfflineTask) -> Self {
        Self {
            id: t.id,
            kind: t.kind,
            urgency: t.urgency,
            status: t.status,
            attempt_count: t.attempt_count,
            result_ref: t.result_ref.clone(),
            error: t.last_error.clone().or_else(|| t.last_sync_error.clone()),
            created_at: t.created_at,
            updated_at: t.updated_at,
            synced_at: t.synced_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub load_level: LoadLevel,
    pub latest_sample: Option<LoadSample>,
    pub active_variant: Option<VariantId>,
    pub load_state: LoadState,
    pub model_override: Option<VariantId>,
    pub in_flight: usize,
    pub capacity: usize,
    pub available_permits: usize,
    pub device_profile: DeviceCapabilityProfile,
    pub pending_task_count: u64,
    pub storage: StorageStats,
    pub online: bool,
    /// False once no variant can be loaded; requests are then only queued.
    pub inference_available: bool,
}

#[derive(Clone)]
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    drainer: Arc<Drainer>,
    connectivity: Connectivity,
    dedupe: bool,
}

impl Engine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        drainer: Arc<Drainer>,
        connectivity: Connectivity,
        dedupe: bool,
    ) -> Self {
        Self { dispatcher, drainer, connectivity, dedupe }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs the request on-device now, or queues it when that is not possible.
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitOutcome, EngineError> {
        self.admit(&req)?;
        let urgency = req.urgency.unwrap_or_else(|| Urgency::default_for(req.modality));

        let job = InferenceJob {
            urgency,
            input: InferenceInput {
                modality: req.modality,
                prompt: req.prompt.clone(),
                payload_ref: req.payload_ref.clone(),
            },
            origin: JobOrigin::Live,
        };

        match self.dispatcher.run(job).await {
            Ok(done) => Ok(SubmitOutcome::Completed {
                variant: done.variant,
                model_tag: done.model_tag,
                result: done.output,
                elapsed_ms: done.elapsed_ms,
            }),
            Err(DispatchError::ModelLoad { variant, reason }) => {
                // No variant would load. Keep the work, tell the caller.
                let task_id = self.queue(&req, urgency).await?;
                Err(EngineError::Unavailable { task_id, reason: format!("{variant}: {reason}") })
            }
            Err(DispatchError::Store(e)) => Err(e.into()),
            Err(e) => {
                let task_id = self.queue(&req, urgency).await?;
                info!(task_id = %task_id, kind = %req.modality, cause = e.kind(), reason = %e, "engine: request queued");
                Ok(SubmitOutcome::Queued { task_id, cause: e.kind(), reason: e.to_string() })
            }
        }
    }

    /// Puts a request straight into the offline queue.
    pub async fn enqueue(&self, req: SubmitRequest) -> Result<Uuid, EngineError> {
        self.admit(&req)?;
        let urgency = req.urgency.unwrap_or_else(|| Urgency::default_for(req.modality));
        self.queue(&req, urgency).await
    }

    /// Refuses what could never run here, before anything is queued.
    fn admit(&self, req: &SubmitRequest) -> Result<(), EngineError> {
        validate(req)?;
        if !self.dispatcher.catalog().serves(req.modality) {
            return Err(EngineError::Unsupported(req.modality));
        }
        Ok(())
    }

    async fn queue(&self, req: &SubmitRequest, urgency: Urgency) -> Result<Uuid, EngineError> {
        let store = self.dispatcher.store();

        if let Some(path) = req.payload_ref.as_deref() {
            let p = Path::new(path);
            let is_file = tokio::fs::metadata(p).await.map(|m| m.is_file()).unwrap_or(false);
            if is_file {
                let id = store
                    .enqueue_file(req.modality, urgency, p, req.prompt.clone(), self.dedupe)
                    .await?;
                return Ok(id);
            }
        }

        let payload_ref = req.payload_ref.clone().unwrap_or_else(|| INLINE_PAYLOAD.to_string());
        let hash = self.dedupe.then(|| {
            let key = format!("{payload_ref}\n{}", req.prompt.as_deref().unwrap_or(""));
            content_hash(key.as_bytes())
        });
        let id = store
            .enqueue(NewTask {
                kind: req.modality,
                urgency,
                payload_ref,
                prompt: req.prompt.clone(),
                content_hash: hash,
            })
            .await?;
        Ok(id)
    }

    pub async fn task_status(&self, id: Uuid) -> Result<TaskView, EngineError> {
        let task = self.dispatcher.store().get(id).await?.ok_or(EngineError::TaskNotFound(id))?;
        Ok(TaskView::from(&task))
    }

    /// The stored result, `None` while the task is still on its way.
    pub async fn task_result(&self, id: Uuid) -> Result<Option<serde_json::Value>, EngineError> {
        let task = self.dispatcher.store().get(id).await?.ok_or(EngineError::TaskNotFound(id))?;
        match (task.status, task.result_ref.as_deref()) {
            (TaskStatus::Completed | TaskStatus::Synced, Some(r)) => {
                Ok(Some(self.dispatcher.results().read(r).await?))
            }
            (TaskStatus::PermanentlyFailed, _) => Err(EngineError::PermanentTaskFailure {
                id,
                attempts: task.attempt_count,
            }),
            _ => Ok(None),
        }
    }

    pub async fn system_status(&self) -> Result<SystemStatus, EngineError> {
        let d = &self.dispatcher;
        let snap = d.runtime().snapshot();
        let storage = d.store().stats().await?;
        Ok(SystemStatus {
            load_level: d.monitor().current_level(),
            latest_sample: d.monitor().latest(),
            active_variant: snap.active_variant,
            load_state: snap.load_state,
            model_override: d.override_variant(),
            in_flight: snap.in_flight,
            capacity: d.capacity(),
            available_permits: d.available_permits(),
            device_profile: d.profile().clone(),
            pending_task_count: storage.pending,
            storage,
            online: self.connectivity.is_online(),
            inference_available: snap.load_state != LoadState::Failed,
        })
    }

    pub fn set_override(&self, variant: Option<VariantId>) {
        self.dispatcher.set_override(variant);
    }

    /// Operator retry of a failed or permanently failed task.
    pub async fn retry(&self, id: Uuid) -> Result<TaskView, EngineError> {
        self.dispatcher.store().retry_failed(id).await?;
        self.task_status(id).await
    }

    /// Tasks waiting on their backoff and tasks parked for operator attention.
    pub async fn failed_tasks(&self, limit: u32) -> Result<Vec<TaskView>, EngineError> {
        let store = self.dispatcher.store();
        let mut out = store.list_by_status(TaskStatus::PermanentlyFailed, limit).await?;
        out.extend(store.list_by_status(TaskStatus::Failed, limit).await?);
        Ok(out.iter().map(TaskView::from).collect())
    }

    pub async fn pending_tasks(&self, kind: Option<Modality>) -> Result<Vec<TaskView>, EngineError> {
        let tasks = self.dispatcher.store().list_pending(kind).await?;
        Ok(tasks.iter().map(TaskView::from).collect())
    }

    /// Removes synced tasks older than `older_than`, with their payload copies
    /// and result files. Returns how many went.
    pub async fn purge_synced(&self, older_than: Duration) -> Result<usize, EngineError> {
        let purged = self.dispatcher.store().purge_synced(older_than).await?;
        for t in &purged {
            if let Some(r) = t.result_ref.as_deref() {
                if let Err(e) = self.dispatcher.results().remove(r).await {
                    warn!(task_id = %t.id, error = %e, "engine: could not remove result file");
                }
            }
        }
        Ok(purged.len())
    }

    /// Pushes one completed task now instead of waiting for the drainer.
    pub async fn push_now(&self, id: Uuid) -> Result<TaskView, EngineError> {
        let store = self.dispatcher.store();
        let task = store.get(id).await?.ok_or(EngineError::TaskNotFound(id))?;
        if task.status == TaskStatus::Completed {
            self.drainer.push_now(&task).await?;
            store.mark_synced(id).await?;
        }
        self.task_status(id).await
    }
}

fn validate(req: &SubmitRequest) -> Result<(), EngineError> {
    let has_payload = req.payload_ref.as_deref().is_some_and(|p| !p.trim().is_empty());
    let has_prompt = req.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
    match req.modality {
        Modality::Text if !(has_payload || has_prompt) => {
            Err(EngineError::BadRequest("text request needs a prompt or payload_ref".into()))
        }
        Modality::Text => Ok(()),
        other if !has_payload => Err(EngineError::BadRequest(format!("{other} request needs payload_ref"))),
        _ => Ok(()),
    }
}
