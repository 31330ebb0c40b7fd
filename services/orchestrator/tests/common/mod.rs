#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use modelops::{DeviceCapabilityProfile, HostProbe, Modality, ModelVariantDescriptor, VariantCatalog};
use taskstore::{ResultStore, RetryPolicy, TaskStore};
use tempfile::TempDir;
use uuid::Uuid;

use orchestrator::config::{DispatchConfig, DrainerConfig, MonitorConfig};
use orchestrator::connectivity::Connectivity;
use orchestrator::dispatcher::Dispatcher;
use orchestrator::drainer::Drainer;
use orchestrator::engine::Engine;
use orchestrator::error::SyncError;
use orchestrator::monitor::{LoadMonitor, LoadSample, MetricsSource, RawMetrics};
use orchestrator::provider::{InferenceBackend, InferenceInput, ProviderInfo};
use orchestrator::runtime::ModelRuntime;
use orchestrator::sync::{SyncClient, SyncRecord};

pub const SMALL_TAG: &str = "gemma3n:e2b";
pub const LARGE_TAG: &str = "gemma3n:e4b";

/// Backend that checks the one-model-at-a-time contract as it goes.
#[derive(Default)]
pub struct FakeBackend {
    pub infer_delay: Duration,
    pub fail_loads: Mutex<HashSet<String>>,
    pub fail_infer: AtomicBool,
    resident: Mutex<Option<String>>,
    active_infers: AtomicUsize,
    /// Contract breaches seen: two models resident, load/unload during
    /// inference, inference on a model that is not loaded.
    pub violations: AtomicUsize,
    pub events: Mutex<Vec<String>>,
    /// Payload kinds this backend takes; every kind when unset.
    pub modalities: Option<&'static [Modality]>,
}

impl FakeBackend {
    pub fn with_delay(infer_delay: Duration) -> Self {
        Self { infer_delay, ..Default::default() }
    }

    pub fn serving(modalities: &'static [Modality]) -> Self {
        Self { modalities: Some(modalities), ..Default::default() }
    }

    pub fn fail_load(&self, tag: &str) {
        self.fail_loads.lock().unwrap().insert(tag.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    fn log(&self, e: String) {
        self.events.lock().unwrap().push(e);
    }

    fn violation(&self) {
        self.violations.fetch_add(1, Ordering::SeqCst);
    }
}

struct InferGuard<'a>(&'a AtomicUsize);

impl Drop for InferGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn load(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        if self.active_infers.load(Ordering::SeqCst) > 0 {
            self.violation();
        }
        self.log(format!("load {}", variant.model_tag));
        if self.fail_loads.lock().unwrap().contains(&variant.model_tag) {
            bail!("out of memory loading {}", variant.model_tag);
        }
        let mut resident = self.resident.lock().unwrap();
        if resident.as_deref().is_some_and(|r| r != variant.model_tag) {
            self.violation();
        }
        *resident = Some(variant.model_tag.clone());
        Ok(())
    }

    async fn unload(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        if self.active_infers.load(Ordering::SeqCst) > 0 {
            self.violation();
        }
        self.log(format!("unload {}", variant.model_tag));
        let mut resident = self.resident.lock().unwrap();
        if resident.as_deref() == Some(variant.model_tag.as_str()) {
            *resident = None;
        }
        Ok(())
    }

    async fn infer(&self, variant: &ModelVariantDescriptor, input: &InferenceInput) -> anyhow::Result<String> {
        if self.resident.lock().unwrap().as_deref() != Some(variant.model_tag.as_str()) {
            self.violation();
        }
        self.active_infers.fetch_add(1, Ordering::SeqCst);
        let _guard = InferGuard(&self.active_infers);
        self.log(format!("infer-start {}", variant.model_tag));
        tokio::time::sleep(self.infer_delay).await;
        self.log(format!("infer-end {}", variant.model_tag));
        if self.fail_infer.load(Ordering::SeqCst) {
            bail!("backend returned 500");
        }
        Ok(format!("[{}] {}", variant.model_tag, input.instruction()))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo { name: "fake".into(), base_url: "mem://".into() }
    }

    fn modalities(&self) -> &'static [Modality] {
        self.modalities.unwrap_or(&Modality::ALL[..])
    }
}

#[derive(Default)]
pub struct FakeSync {
    pub fail: AtomicBool,
    pub pushed: Mutex<Vec<Uuid>>,
}

impl FakeSync {
    pub fn pushed(&self) -> Vec<Uuid> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncClient for FakeSync {
    async fn push(&self, record: &SyncRecord) -> Result<(), SyncError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected { status: 503 });
        }
        self.pushed.lock().unwrap().push(record.task_id);
        Ok(())
    }
}

/// Never sampled in these tests; levels are driven through `set_load`.
pub struct NoMetrics;

impl MetricsSource for NoMetrics {
    fn read(&self) -> RawMetrics {
        RawMetrics::default()
    }
}

pub fn cpu_sample(cpu: f64) -> LoadSample {
    LoadSample {
        timestamp: Utc::now(),
        cpu_pct: Some(cpu),
        mem_pct: None,
        gpu_pct: None,
        temperature_c: None,
        in_flight_count: 0,
    }
}

/// Monitor that flips level on every sample.
pub fn instant_monitor() -> Arc<LoadMonitor> {
    let cfg = MonitorConfig { window: 1, dwell: Duration::ZERO, ..MonitorConfig::default() };
    Arc::new(LoadMonitor::new(Arc::new(NoMetrics), cfg))
}

/// 0 → LOW, 60 → MODERATE, 100 → HIGH with the default thresholds.
pub fn set_load(monitor: &LoadMonitor, cpu: f64) {
    monitor.record(cpu_sample(cpu), Instant::now());
}

pub fn catalog() -> VariantCatalog {
    VariantCatalog::with_tags(SMALL_TAG, 2_000, LARGE_TAG, 4_000).unwrap()
}

pub fn jetson_profile(catalog: &VariantCatalog) -> DeviceCapabilityProfile {
    let probe = HostProbe {
        jetson_marker: true,
        has_cuda: true,
        total_memory_mb: 64_000,
        available_memory_mb: 48_000,
    };
    DeviceCapabilityProfile::from_probe(&probe, catalog)
}

pub struct Harness {
    pub engine: Engine,
    pub dispatcher: Arc<Dispatcher>,
    pub drainer: Arc<Drainer>,
    pub backend: Arc<FakeBackend>,
    pub sync: Arc<FakeSync>,
    pub connectivity: Connectivity,
    pub monitor: Arc<LoadMonitor>,
    _dir: TempDir,
}

pub struct HarnessOpts {
    pub backend: FakeBackend,
    pub dispatch: DispatchConfig,
    pub retry: RetryPolicy,
    pub drainer: DrainerConfig,
}

impl Default for HarnessOpts {
    fn default() -> Self {
        Self {
            backend: FakeBackend::default(),
            dispatch: DispatchConfig {
                max_concurrent: Some(2),
                acquire_wait: Duration::from_secs(10),
                load_timeout: Duration::from_secs(5),
                ..DispatchConfig::default()
            },
            retry: RetryPolicy::default(),
            drainer: DrainerConfig::default(),
        }
    }
}

pub async fn harness(opts: HarnessOpts) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::open(dir.path().join("tasks"), opts.retry).await.unwrap();
    let results = ResultStore::open(dir.path().join("results")).await.unwrap();

    let backend = Arc::new(opts.backend);
    let catalog = catalog().limited_to(backend.modalities()).unwrap();
    let profile = jetson_profile(&catalog);
    let runtime = ModelRuntime::new(backend.clone(), catalog, opts.dispatch.load_timeout);
    let monitor = instant_monitor();

    let dispatcher = Arc::new(Dispatcher::new(runtime, monitor.clone(), profile, store, results, opts.dispatch));
    let connectivity = Connectivity::new(true);
    let sync = Arc::new(FakeSync::default());
    let drainer = Arc::new(Drainer::new(
        dispatcher.clone(),
        connectivity.clone(),
        Some(sync.clone() as Arc<dyn SyncClient>),
        opts.drainer,
    ));
    let engine = Engine::new(dispatcher.clone(), drainer.clone(), connectivity.clone(), false);

    Harness { engine, dispatcher, drainer, backend, sync, connectivity, monitor, _dir: dir }
}
