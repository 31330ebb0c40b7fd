use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use modelops::{DeviceCapabilityProfile, VariantCatalog, VariantId};
use taskstore::{ResultStore, TaskStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestrator::config::{AppConfig, BackendKind};
use orchestrator::connectivity::{run_probe, Connectivity};
use orchestrator::dispatcher::{drain_permits, Dispatcher};
use orchestrator::drainer::Drainer;
use orchestrator::engine::Engine;
use orchestrator::monitor::{HostMetrics, LoadMonitor};
use orchestrator::provider::InferenceBackend;
use orchestrator::provider_model_server::ModelServerBackend;
use orchestrator::provider_ollama::OllamaBackend;
use orchestrator::runtime::ModelRuntime;
use orchestrator::sync::{HttpSyncClient, SyncClient};
use orchestrator::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    // --- Inference backend ---
    let backend_url = match cfg.backend {
        BackendKind::Ollama => cfg.ollama_url.as_str(),
        BackendKind::ModelServer => cfg.model_server_url.as_str(),
    };
    let backend: Arc<dyn InferenceBackend> = match cfg.backend {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(backend_url.to_string())),
        BackendKind::ModelServer => Arc::new(ModelServerBackend::new(backend_url.to_string())),
    };
    let backend_name = backend.info().name;
    match backend.ping().await {
        Ok(()) => info!(backend = %backend_name, url = %backend_url, "inference backend: ok"),
        Err(e) => warn!(
            backend = %backend_name,
            url = %backend_url,
            error = %e,
            "inference backend not reachable yet, requests will queue"
        ),
    }

    // --- Models and device ---
    let catalog = VariantCatalog::with_tags(
        &cfg.small_model_tag,
        cfg.small_model_mb,
        &cfg.large_model_tag,
        cfg.large_model_mb,
    )
    .and_then(|c| c.limited_to(backend.modalities()))
    .context("Invalid model catalog")?;
    info!(backend = %backend_name, modalities = ?backend.modalities(), "serving modalities");
    let profile = DeviceCapabilityProfile::cached(&catalog).clone();
    info!(
        compute = ?profile.compute_class,
        supports_large = profile.supports(VariantId::Large),
        "device profile"
    );

    // --- Offline store ---
    let store = TaskStore::open(&cfg.storage_dir, cfg.retry.clone())
        .await
        .context("Failed to open task store")?;
    let recovered = store.recover_interrupted().await.context("Task recovery failed")?;
    if recovered > 0 {
        warn!(recovered, "requeued tasks interrupted by the previous run");
    }
    let results = ResultStore::open(&cfg.results_dir)
        .await
        .context("Failed to open result store")?;

    let runtime = ModelRuntime::new(backend, catalog, cfg.dispatch.load_timeout);

    let capacity = cfg
        .dispatch
        .max_concurrent
        .unwrap_or_else(|| profile.safe_concurrency())
        .max(1);
    let monitor = Arc::new(
        LoadMonitor::new(Arc::new(HostMetrics::new()), cfg.monitor.clone())
            .with_in_flight(runtime.in_flight_gauge(), capacity),
    );

    // Without a probe, assume online and let push failures back off.
    let connectivity = Connectivity::new(true);
    let sync_client: Option<Arc<dyn SyncClient>> = match &cfg.sync_url {
        Some(url) => Some(Arc::new(
            HttpSyncClient::new(url.clone(), cfg.sync_secret.clone(), cfg.drainer.sync_timeout)
                .context("Failed to build sync client")?,
        )),
        None => {
            info!("no SYNC_URL set, completed tasks stay local");
            None
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        runtime.clone(),
        monitor.clone(),
        profile,
        store,
        results,
        cfg.dispatch.clone(),
    ));
    let drainer = Arc::new(Drainer::new(
        dispatcher.clone(),
        connectivity.clone(),
        sync_client,
        cfg.drainer.clone(),
    ));
    let engine = Engine::new(dispatcher.clone(), drainer.clone(), connectivity.clone(), cfg.dedupe_payloads);

    // --- Background loops ---
    let cancel = CancellationToken::new();
    let mut loops = Vec::new();
    loops.push(tokio::spawn(monitor.clone().run(cancel.clone())));
    loops.push(tokio::spawn(drainer.run(cancel.clone())));
    if let Some(url) = cfg.probe_url.clone() {
        loops.push(tokio::spawn(run_probe(
            connectivity,
            url,
            cfg.probe_interval,
            cancel.clone(),
        )));
    }

    runtime.preload(VariantId::Small);

    let app = orchestrator::router(Arc::new(AppState::new(engine)));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind_addr))?;
    info!(addr = %cfg.bind_addr, "orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutting down");
    cancel.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }
    if !drain_permits(&dispatcher, Duration::from_secs(30)).await {
        warn!(in_flight = runtime.in_flight(), "inference still running at exit");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
