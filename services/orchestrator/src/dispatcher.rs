//! Inference dispatcher: permit, variant choice, model reference, timeout.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use modelops::{
    select, DeviceCapabilityProfile, Modality, SelectionRequest, Urgency, VariantCatalog, VariantId,
};
use serde::Serialize;
use taskstore::{FailureOutcome, OfflineTask, ResultStore, TaskStore};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{AcquireError, DispatchError};
use crate::monitor::LoadMonitor;
use crate::provider::InferenceInput;
use crate::runtime::{ModelRef, ModelRuntime};

#[derive(Clone, Debug)]
pub enum JobOrigin {
    Live,
    /// Claimed from the offline store; the dispatcher records the outcome on it.
    Drainer { task_id: Uuid },
}

#[derive(Clone, Debug)]
pub struct InferenceJob {
    pub urgency: Urgency,
    pub input: InferenceInput,
    pub origin: JobOrigin,
}

impl InferenceJob {
    pub fn from_task(task: &OfflineTask) -> Self {
        let payload_ref = (!task.payload_ref.is_empty() && task.payload_ref != crate::engine::INLINE_PAYLOAD)
            .then(|| task.payload_ref.clone());
        Self {
            urgency: task.urgency,
            input: InferenceInput {
                modality: task.kind,
                prompt: task.prompt.clone(),
                payload_ref,
            },
            origin: JobOrigin::Drainer { task_id: task.id },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Completion {
    pub variant: VariantId,
    pub model_tag: String,
    pub output: String,
    pub elapsed_ms: u64,
    /// Set for drained tasks: where the result was written.
    pub result_ref: Option<String>,
}

pub struct Dispatcher {
    permits: Arc<Semaphore>,
    capacity: usize,
    runtime: ModelRuntime,
    monitor: Arc<LoadMonitor>,
    profile: DeviceCapabilityProfile,
    override_variant: RwLock<Option<VariantId>>,
    store: TaskStore,
    results: ResultStore,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        runtime: ModelRuntime,
        monitor: Arc<LoadMonitor>,
        profile: DeviceCapabilityProfile,
        store: TaskStore,
        results: ResultStore,
        cfg: DispatchConfig,
    ) -> Self {
        let capacity = cfg.max_concurrent.unwrap_or_else(|| profile.safe_concurrency()).max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            runtime,
            monitor,
            profile,
            override_variant: RwLock::new(None),
            store,
            results,
            cfg,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn runtime(&self) -> &ModelRuntime {
        &self.runtime
    }

    pub fn monitor(&self) -> &Arc<LoadMonitor> {
        &self.monitor
    }

    pub fn profile(&self) -> &DeviceCapabilityProfile {
        &self.profile
    }

    pub fn catalog(&self) -> &VariantCatalog {
        self.runtime.catalog()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn override_variant(&self) -> Option<VariantId> {
        self.override_variant.read().map(|g| *g).unwrap_or(None)
    }

    pub fn set_override(&self, variant: Option<VariantId>) {
        if let Ok(mut g) = self.override_variant.write() {
            *g = variant;
        }
        info!(variant = ?variant, "dispatcher: model override set");
    }

    /// Variant the policy picks for this request right now.
    pub fn choose(&self, modality: Modality, urgency: Urgency) -> VariantId {
        let req = SelectionRequest {
            level: self.monitor.current_level(),
            urgency,
            modality,
            override_variant: self.override_variant(),
        };
        select(self.catalog(), &self.profile, &req)
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        if let Ok(p) = self.permits.clone().try_acquire_owned() {
            return Ok(p);
        }
        match tokio::time::timeout(self.cfg.permit_wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(p)) => Ok(p),
            _ => Err(DispatchError::CapacityExceeded),
        }
    }

    /// Acquires the chosen variant, falling back to the small one if the
    /// large one cannot be loaded.
    async fn model(&self, variant: VariantId) -> Result<ModelRef, DispatchError> {
        match self.runtime.acquire(variant, self.cfg.acquire_wait).await {
            Ok(m) => Ok(m),
            Err(AcquireError::LoadFailed { variant: VariantId::Large, reason }) => {
                warn!(error = %reason, "dispatcher: large variant failed to load, falling back to small");
                self.runtime
                    .acquire(VariantId::Small, self.cfg.acquire_wait)
                    .await
                    .map_err(acquire_to_dispatch)
            }
            Err(e) => Err(acquire_to_dispatch(e)),
        }
    }

    pub async fn run(&self, job: InferenceJob) -> Result<Completion, DispatchError> {
        let outcome = self.execute(&job).await;
        match job.origin {
            JobOrigin::Live => outcome,
            JobOrigin::Drainer { task_id } => self.record(task_id, &job, outcome).await,
        }
    }

    async fn execute(&self, job: &InferenceJob) -> Result<Completion, DispatchError> {
        let modality = job.input.modality;
        let _permit = self.permit().await?;

        let variant = self.choose(modality, job.urgency);
        let model = self.model(variant).await?;
        let model_tag = model.descriptor().model_tag.clone();

        let limit = self.cfg.timeout_for(modality);
        let started = Instant::now();
        // On timeout the inference future is dropped, and with it the model
        // reference and the permit.
        let output = match tokio::time::timeout(limit, model.infer(&job.input)).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(DispatchError::Inference(format!("{e:#}"))),
            Err(_) => {
                warn!(modality = %modality, variant = %model.variant(), after = ?limit, "dispatcher: inference timed out");
                return Err(DispatchError::Timeout { modality, after: limit });
            }
        };

        Ok(Completion {
            variant: model.variant(),
            model_tag,
            output,
            elapsed_ms: started.elapsed().as_millis() as u64,
            result_ref: None,
        })
    }

    /// Writes the outcome of a drained task back to the store.
    async fn record(
        &self,
        task_id: Uuid,
        job: &InferenceJob,
        outcome: Result<Completion, DispatchError>,
    ) -> Result<Completion, DispatchError> {
        match outcome {
            Ok(mut done) => {
                let result = serde_json::json!({
                    "task_id": task_id,
                    "kind": job.input.modality,
                    "variant": done.variant,
                    "model_tag": done.model_tag,
                    "response": done.output,
                    "elapsed_ms": done.elapsed_ms,
                    "completed_at": Utc::now(),
                });
                let result_ref = self.results.write(task_id, &result).await?;
                self.store.mark_completed(task_id, &result_ref).await?;
                done.result_ref = Some(result_ref);
                Ok(done)
            }
            // The device could not start the work; not the task's fault.
            Err(e @ (DispatchError::CapacityExceeded | DispatchError::ModelLoad { .. })) => {
                self.store.unclaim(task_id).await?;
                Err(e)
            }
            Err(e @ (DispatchError::Timeout { .. } | DispatchError::Inference(_))) => {
                match self.store.mark_failed(task_id, &e.to_string()).await? {
                    FailureOutcome::RetryScheduled { attempt, next_attempt_at } => {
                        info!(task_id = %task_id, attempt, next = %next_attempt_at, "dispatcher: task will be retried");
                    }
                    FailureOutcome::Permanent { attempts } => {
                        warn!(task_id = %task_id, attempts, "dispatcher: task parked as permanently failed");
                    }
                }
                Err(e)
            }
            Err(e @ DispatchError::Store(_)) => Err(e),
        }
    }
}

fn acquire_to_dispatch(e: AcquireError) -> DispatchError {
    match e {
        AcquireError::LoadFailed { variant, reason } => DispatchError::ModelLoad { variant, reason },
        // The model is busy changing; treat like having no capacity.
        AcquireError::TimedOut { .. } => DispatchError::CapacityExceeded,
    }
}

/// Waits until all permits are free again, or `limit` passes. Used on shutdown.
pub async fn drain_permits(d: &Dispatcher, limit: Duration) -> bool {
    let all = d.capacity() as u32;
    tokio::time::timeout(limit, d.permits.acquire_many(all)).await.is_ok()
}
