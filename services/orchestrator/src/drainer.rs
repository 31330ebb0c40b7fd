use std::sync::Arc;

use modelops::LoadLevel;
use serde::Serialize;
use taskstore::OfflineTask;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DrainerConfig;
use crate::connectivity::Connectivity;
use crate::dispatcher::{Dispatcher, InferenceJob};
use crate::error::{DispatchError, SyncError};
use crate::sync::{push_backoff, SyncClient, SyncRecord};

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub released: u64,
    pub processed: u32,
    pub completed: u32,
    pub failed: u32,
    /// Claimed but handed back because the device had no room.
    pub deferred: u32,
    pub synced: u32,
    pub sync_failed: u32,
}

impl DrainReport {
    fn is_idle(&self) -> bool {
        *self == DrainReport::default()
    }
}

/// Works the offline queue through the dispatcher and pushes completed
/// results to the remote.
pub struct Drainer {
    dispatcher: Arc<Dispatcher>,
    connectivity: Connectivity,
    sync: Option<Arc<dyn SyncClient>>,
    cfg: DrainerConfig,
}

impl Drainer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        connectivity: Connectivity,
        sync: Option<Arc<dyn SyncClient>>,
        cfg: DrainerConfig,
    ) -> Self {
        Self { dispatcher, connectivity, sync, cfg }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(poll = ?self.cfg.poll_interval, sync = self.sync.is_some(), "drainer: started");
        let mut level_rx = self.dispatcher.monitor().subscribe();

        loop {
            let report = self.run_once().await;
            if report.is_idle() {
                debug!("drainer: nothing to do");
            } else {
                info!(?report, "drainer: pass done");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                // Load dropping below HIGH is worth acting on right away.
                Ok(()) = level_rx.changed() => {}
            }
        }
        info!("drainer: stopped");
    }

    pub async fn run_once(&self) -> DrainReport {
        let mut report = DrainReport::default();

        match self.dispatcher.store().release_due_retries().await {
            Ok(n) => report.released = n,
            Err(e) => warn!(error = %e, "drainer: releasing due retries failed"),
        }

        self.process(&mut report).await;

        if self.connectivity.is_online() {
            self.push(&mut report).await;
        }
        report
    }

    async fn process(&self, report: &mut DrainReport) {
        for _ in 0..self.cfg.process_batch {
            if self.dispatcher.monitor().current_level() == LoadLevel::High {
                debug!("drainer: load HIGH, not processing");
                return;
            }

            let task = match self.dispatcher.store().next_pending().await {
                Ok(Some(t)) => t,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "drainer: claim failed");
                    return;
                }
            };

            report.processed += 1;
            info!(task_id = %task.id, kind = %task.kind, attempt = task.attempt_count, "drainer: processing task");

            match self.dispatcher.run(InferenceJob::from_task(&task)).await {
                Ok(done) => {
                    report.completed += 1;
                    info!(task_id = %task.id, variant = %done.variant, elapsed_ms = done.elapsed_ms, "drainer: task completed");
                }
                Err(e @ (DispatchError::CapacityExceeded | DispatchError::ModelLoad { .. })) => {
                    report.deferred += 1;
                    info!(task_id = %task.id, reason = %e, "drainer: no room on device, backing off");
                    return;
                }
                Err(DispatchError::Store(e)) => {
                    warn!(task_id = %task.id, error = %e, "drainer: could not record outcome");
                    return;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(task_id = %task.id, error = %e, "drainer: task failed");
                }
            }
        }
    }

    async fn push(&self, report: &mut DrainReport) {
        let Some(client) = &self.sync else { return };
        let store = self.dispatcher.store();

        let due = match store.due_for_sync(self.cfg.sync_batch).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "drainer: listing tasks to sync failed");
                return;
            }
        };

        for task in due {
            match self.push_one(client.as_ref(), &task).await {
                Ok(()) => match store.mark_synced(task.id).await {
                    Ok(()) => report.synced += 1,
                    Err(e) => warn!(task_id = %task.id, error = %e, "drainer: marking synced failed"),
                },
                Err(e) => {
                    report.sync_failed += 1;
                    let wait = push_backoff(
                        task.sync_attempts + 1,
                        self.cfg.sync_base_backoff,
                        self.cfg.sync_max_backoff,
                    );
                    warn!(task_id = %task.id, error = %e, retry_in = ?wait, "drainer: push failed");
                    if let Err(e) = store.record_sync_failure(task.id, &e.to_string(), wait).await {
                        warn!(task_id = %task.id, error = %e, "drainer: recording push failure failed");
                    }
                    // The remote is not answering at all; leave the rest for the next pass.
                    if matches!(e, SyncError::Transport(_) | SyncError::Timeout(_)) {
                        return;
                    }
                }
            }
        }
    }

    async fn push_one(&self, client: &dyn SyncClient, task: &OfflineTask) -> Result<(), SyncError> {
        let result_ref = task
            .result_ref
            .as_deref()
            .ok_or_else(|| SyncError::Payload("completed task has no result".into()))?;
        let result = self
            .dispatcher
            .results()
            .read(result_ref)
            .await
            .map_err(|e| SyncError::Payload(e.to_string()))?;
        let record = SyncRecord::new(task, result);

        match tokio::time::timeout(self.cfg.sync_timeout, client.push(&record)).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Timeout(self.cfg.sync_timeout)),
        }
    }

    /// Pushes one completed task right away, outside the normal cadence.
    pub async fn push_now(&self, task: &OfflineTask) -> Result<(), SyncError> {
        let client = self
            .sync
            .as_ref()
            .ok_or_else(|| SyncError::Payload("no sync endpoint configured".into()))?;
        self.push_one(client.as_ref(), task).await
    }
}
