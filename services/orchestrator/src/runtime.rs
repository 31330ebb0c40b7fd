//! Model lifecycle controller.
//!
//! Exactly one variant is resident at a time. Callers get a [`ModelRef`] from
//! [`ModelRuntime::acquire`]; while any reference is alive the resident model
//! is never unloaded. A request for the other variant sets a pending target:
//! new grants for the current variant are held, in-flight calls drain, then a
//! detached task unloads the old model and loads the new one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelops::{ModelVariantDescriptor, VariantCatalog, VariantId};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::AcquireError;
use crate::provider::{InferenceBackend, InferenceInput, ProviderInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Swapping,
    Failed,
}

#[derive(Debug)]
struct Handle {
    active: Option<VariantId>,
    state: LoadState,
    ready_since: Option<DateTime<Utc>>,
    /// Variant a transition is (or will be) moving to.
    target: Option<VariantId>,
    failure: Option<(VariantId, String)>,
    /// Bumped each time a transition finishes.
    epoch: u64,
    /// Callers waiting on a transition to each variant, indexed by [`slot`].
    /// A finished transition serves these before another target is taken.
    joined: [usize; 2],
}

fn slot(variant: VariantId) -> usize {
    match variant {
        VariantId::Small => 0,
        VariantId::Large => 1,
    }
}

impl Handle {
    /// Whether a new target may be set: not while callers that waited for
    /// the resident variant have yet to be granted it.
    fn can_retarget(&self) -> bool {
        match (self.state, self.active) {
            (LoadState::Ready, Some(cur)) => self.joined[slot(cur)] == 0,
            _ => true,
        }
    }
}

/// A caller's registration on a pending transition. Dropped without
/// [`Waiting::leave`] (the caller gave up), it deregisters itself.
struct Waiting {
    shared: Arc<Shared>,
    variant: VariantId,
    registered: bool,
}

impl Waiting {
    fn join(shared: &Arc<Shared>, h: &mut Handle, variant: VariantId) -> Self {
        h.joined[slot(variant)] += 1;
        Self { shared: shared.clone(), variant, registered: true }
    }

    /// Deregisters under a lock the caller already holds.
    fn leave(mut self, h: &mut Handle) {
        self.registered = false;
        if deregister(h, self.variant) {
            self.shared.changed.notify_waiters();
        }
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let last = deregister(&mut self.shared.lock(), self.variant);
        if last {
            self.shared.changed.notify_waiters();
        }
    }
}

/// Returns true when the last caller waiting on `variant` went away.
fn deregister(h: &mut Handle, variant: VariantId) -> bool {
    let n = &mut h.joined[slot(variant)];
    *n = n.saturating_sub(1);
    *n == 0
}

struct Shared {
    handle: Mutex<Handle>,
    in_flight: Arc<AtomicUsize>,
    changed: Notify,
    backend: Arc<dyn InferenceBackend>,
    catalog: VariantCatalog,
    load_timeout: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Handle> {
        // Nothing panics while holding the lock; recover the data if it ever does.
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RuntimeSnapshot {
    pub active_variant: Option<VariantId>,
    pub load_state: LoadState,
    pub ready_since: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub pending_variant: Option<VariantId>,
    pub last_error: Option<String>,
    pub provider: ProviderInfo,
}

#[derive(Clone)]
pub struct ModelRuntime {
    shared: Arc<Shared>,
}

impl ModelRuntime {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        catalog: VariantCatalog,
        load_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle: Mutex::new(Handle {
                    active: None,
                    state: LoadState::Unloaded,
                    ready_since: None,
                    target: None,
                    failure: None,
                    epoch: 0,
                    joined: [0; 2],
                }),
                in_flight: Arc::new(AtomicUsize::new(0)),
                changed: Notify::new(),
                backend,
                catalog,
                load_timeout,
            }),
        }
    }

    /// Waits up to `wait` for `variant` to be ready and returns a reference
    /// to it, starting a load or swap when needed. The transition keeps going
    /// if this caller gives up.
    pub async fn acquire(&self, variant: VariantId, wait: Duration) -> Result<ModelRef, AcquireError> {
        let deadline = Instant::now() + wait;
        // Epoch at which this caller started waiting on a transition to `variant`.
        let mut joined: Option<u64> = None;
        let mut waiting: Option<Waiting> = None;

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let spawn = {
                let mut h = self.shared.lock();

                if h.state == LoadState::Ready
                    && h.active == Some(variant)
                    && h.target.map_or(true, |t| t == variant)
                {
                    self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    if let Some(w) = waiting.take() {
                        w.leave(&mut h);
                    }
                    return Ok(ModelRef { shared: self.shared.clone(), variant });
                }

                let failed = match (joined, h.state, &h.failure) {
                    (Some(epoch), LoadState::Failed, Some((v, reason)))
                        if *v == variant && h.epoch > epoch =>
                    {
                        Some(reason.clone())
                    }
                    _ => None,
                };
                if let Some(reason) = failed {
                    if let Some(w) = waiting.take() {
                        w.leave(&mut h);
                    }
                    return Err(AcquireError::LoadFailed { variant, reason });
                }

                match h.target {
                    None if h.can_retarget() => {
                        h.target = Some(variant);
                        joined = Some(h.epoch);
                        if waiting.is_none() {
                            waiting = Some(Waiting::join(&self.shared, &mut h, variant));
                        }
                        true
                    }
                    // Callers of the variant just made resident go first.
                    None => false,
                    Some(t) if t == variant => {
                        joined.get_or_insert(h.epoch);
                        if waiting.is_none() {
                            waiting = Some(Waiting::join(&self.shared, &mut h, variant));
                        }
                        false
                    }
                    // Another transition is pending; ours is requested once it settles.
                    Some(_) => false,
                }
            };

            if spawn {
                tokio::spawn(run_transition(self.shared.clone()));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(AcquireError::TimedOut { variant, waited: wait });
            }
        }
    }

    /// Starts loading `variant` in the background if nothing else is going on.
    pub fn preload(&self, variant: VariantId) {
        let spawn = {
            let mut h = self.shared.lock();
            let resident = h.state == LoadState::Ready && h.active == Some(variant);
            if h.target.is_none() && !resident && h.can_retarget() {
                h.target = Some(variant);
                true
            } else {
                false
            }
        };
        if spawn {
            tokio::spawn(run_transition(self.shared.clone()));
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let h = self.shared.lock();
        RuntimeSnapshot {
            active_variant: h.active,
            load_state: h.state,
            ready_since: h.ready_since,
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            pending_variant: h.target,
            last_error: h.failure.as_ref().map(|(v, reason)| format!("{v}: {reason}")),
            provider: self.shared.backend.info(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Shared counter of outstanding model references, for the load monitor.
    pub fn in_flight_gauge(&self) -> Arc<AtomicUsize> {
        self.shared.in_flight.clone()
    }

    pub fn catalog(&self) -> &VariantCatalog {
        &self.shared.catalog
    }
}

async fn run_transition(shared: Arc<Shared>) {
    // Wait for in-flight calls on the resident model to drain. Grants for it
    // are held while a target is set, so the count only goes down.
    let (target, previous) = loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut h = shared.lock();
            let Some(target) = h.target else { return };
            if shared.in_flight.load(Ordering::SeqCst) == 0 {
                let previous = if h.state == LoadState::Ready { h.active } else { None };
                h.state = if previous.is_some() { LoadState::Swapping } else { LoadState::Loading };
                break (target, previous);
            }
        }
        notified.await;
    };
    shared.changed.notify_waiters();

    if let Some(prev) = previous {
        info!(from = %prev, to = %target, "model runtime: swapping");
        if let Err(e) = shared.backend.unload(shared.catalog.get(prev)).await {
            warn!(variant = %prev, error = %e, "model runtime: unload failed");
        }
    } else {
        info!(variant = %target, "model runtime: loading");
    }

    let desc = shared.catalog.get(target);
    let outcome = match tokio::time::timeout(shared.load_timeout, shared.backend.load(desc)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("load timed out after {:?}", shared.load_timeout)),
    };

    if outcome.is_err() {
        // Do not leave a half-loaded model behind.
        if let Err(e) = shared.backend.unload(desc).await {
            warn!(variant = %target, error = %e, "model runtime: cleanup unload failed");
        }
    }

    {
        let mut h = shared.lock();
        h.epoch += 1;
        h.target = None;
        match &outcome {
            Ok(()) => {
                h.active = Some(target);
                h.state = LoadState::Ready;
                h.ready_since = Some(Utc::now());
                h.failure = None;
            }
            Err(reason) => {
                h.active = None;
                h.state = LoadState::Failed;
                h.ready_since = None;
                h.failure = Some((target, reason.clone()));
            }
        }
    }

    match outcome {
        Ok(()) => info!(variant = %target, model = %desc.model_tag, "model runtime: ready"),
        Err(reason) => error!(variant = %target, error = %reason, "model runtime: load failed"),
    }
    shared.changed.notify_waiters();
}

/// A borrowed, ready model. Dropping it releases the reference.
pub struct ModelRef {
    shared: Arc<Shared>,
    variant: VariantId,
}

impl ModelRef {
    pub fn variant(&self) -> VariantId {
        self.variant
    }

    pub fn descriptor(&self) -> &ModelVariantDescriptor {
        self.shared.catalog.get(self.variant)
    }

    pub async fn infer(&self, input: &InferenceInput) -> anyhow::Result<String> {
        self.shared.backend.infer(self.descriptor(), input).await
    }

    pub fn release(self) {}
}

impl Drop for ModelRef {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.changed.notify_waiters();
        }
    }
}
