mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use modelops::{LoadLevel, Modality, Urgency, VariantId};
use orchestrator::config::{DispatchConfig, MonitorConfig};
use orchestrator::engine::{SubmitOutcome, SubmitRequest};
use orchestrator::error::EngineError;
use orchestrator::monitor::LoadMonitor;
use orchestrator::runtime::LoadState;
use taskstore::{RetryPolicy, TaskStatus};

use common::*;

fn text(prompt: &str) -> SubmitRequest {
    SubmitRequest {
        modality: Modality::Text,
        payload_ref: None,
        prompt: Some(prompt.to_string()),
        urgency: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_two_models_resident_under_load_and_swaps() {
    let h = harness(HarnessOpts {
        backend: FakeBackend::with_delay(Duration::from_millis(5)),
        ..HarnessOpts::default()
    })
    .await;

    let mut handles = Vec::new();
    for i in 0..40 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move { engine.submit(text(&format!("report {i}"))).await }));
        if i % 8 == 0 {
            let v = if i % 16 == 0 { VariantId::Large } else { VariantId::Small };
            h.engine.set_override(Some(v));
        }
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(SubmitOutcome::Completed { .. }) => completed += 1,
            Ok(SubmitOutcome::Queued { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(completed > 0);
    assert_eq!(h.backend.violations(), 0, "events: {:?}", h.backend.events());
    assert_eq!(h.dispatcher.runtime().in_flight(), 0);
    assert_eq!(h.dispatcher.available_permits(), h.dispatcher.capacity());
}

#[tokio::test]
async fn test_swap_waits_for_running_inference() {
    let h = harness(HarnessOpts {
        backend: FakeBackend::with_delay(Duration::from_millis(200)),
        ..HarnessOpts::default()
    })
    .await;

    h.engine.set_override(Some(VariantId::Small));
    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.submit(text("first")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.engine.set_override(Some(VariantId::Large));
    let second = h.engine.submit(text("second")).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(matches!(first, SubmitOutcome::Completed { variant: VariantId::Small, .. }));
    assert!(matches!(second, SubmitOutcome::Completed { variant: VariantId::Large, .. }));

    let events = h.backend.events();
    let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
    let small_done = pos(&format!("infer-end {SMALL_TAG}"));
    let small_out = pos(&format!("unload {SMALL_TAG}"));
    let large_in = pos(&format!("load {LARGE_TAG}"));
    assert!(small_done < small_out && small_out < large_in, "events: {events:?}");
    assert_eq!(h.backend.violations(), 0);
}

#[test]
fn test_level_changes_at_most_once_per_dwell_window() {
    let cfg = MonitorConfig { window: 1, dwell: Duration::from_secs(10), ..MonitorConfig::default() };
    let monitor = LoadMonitor::new(Arc::new(NoMetrics), cfg);
    let t0 = Instant::now();

    let mut changes = Vec::new();
    let mut level = monitor.current_level();
    let mut feed = |secs: u64, cpu: f64| {
        let now = monitor.record(cpu_sample(cpu), t0 + Duration::from_secs(secs));
        if now != level {
            changes.push((secs, now));
            level = now;
        }
    };

    // Oscillating around the thresholds: nothing sticks.
    for s in 0..20 {
        feed(s, if s % 2 == 0 { 95.0 } else { 10.0 });
    }
    // Sustained high, then sustained low.
    for s in 20..=32 {
        feed(s, 95.0);
    }
    for s in 33..=50 {
        feed(s, 5.0);
    }

    assert_eq!(changes, vec![(30, LoadLevel::High), (43, LoadLevel::Low)]);
    for pair in changes.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= 10);
    }
}

#[tokio::test]
async fn test_capacity_exceeded_request_is_queued() {
    let h = harness(HarnessOpts {
        backend: FakeBackend::with_delay(Duration::from_millis(300)),
        dispatch: DispatchConfig {
            max_concurrent: Some(1),
            permit_wait: Duration::from_millis(20),
            ..HarnessOpts::default().dispatch
        },
        ..HarnessOpts::default()
    })
    .await;

    let engine = h.engine.clone();
    let busy = tokio::spawn(async move { engine.submit(text("long one")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = h.engine.submit(text("no room for me")).await.unwrap();
    let SubmitOutcome::Queued { task_id, cause, .. } = outcome else {
        panic!("expected queued, got {outcome:?}");
    };
    assert_eq!(cause, "capacity_exceeded");

    let pending = h.engine.pending_tasks(Some(Modality::Text)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, task_id);
    assert_eq!(pending[0].urgency, Urgency::Quick);

    let claimed = h.dispatcher.store().next_pending().await.unwrap().unwrap();
    assert_eq!(claimed.id, task_id);

    assert!(matches!(busy.await.unwrap().unwrap(), SubmitOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_timeout_releases_permit_and_model_reference() {
    let h = harness(HarnessOpts {
        backend: FakeBackend::with_delay(Duration::from_millis(500)),
        dispatch: DispatchConfig {
            text_timeout: Duration::from_millis(50),
            ..HarnessOpts::default().dispatch
        },
        ..HarnessOpts::default()
    })
    .await;

    let outcome = h.engine.submit(text("slow")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued { cause: "inference_timeout", .. }));
    assert_eq!(h.dispatcher.runtime().in_flight(), 0);
    assert_eq!(h.dispatcher.available_permits(), h.dispatcher.capacity());
}

#[tokio::test]
async fn test_offline_task_round_trip_to_synced() {
    let h = harness(HarnessOpts::default()).await;
    h.connectivity.set(false);

    let id = h.engine.enqueue(text("captured offline")).await.unwrap();
    let mut seen = vec![h.engine.task_status(id).await.unwrap().status];

    let report = h.drainer.run_once().await;
    assert_eq!(report.completed, 1);
    assert_eq!(report.synced, 0);
    seen.push(h.engine.task_status(id).await.unwrap().status);

    h.connectivity.set(true);
    let report = h.drainer.run_once().await;
    assert_eq!(report.synced, 1);
    let view = h.engine.task_status(id).await.unwrap();
    seen.push(view.status);

    assert_eq!(seen, vec![TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Synced]);
    assert!(view.synced_at.is_some());
    assert_eq!(h.sync.pushed(), vec![id]);

    let result = h.engine.task_result(id).await.unwrap().unwrap();
    assert_eq!(result["task_id"], id.to_string());
    assert!(result["response"].as_str().unwrap().contains("captured offline"));

    // A second pass has nothing left to push.
    let report = h.drainer.run_once().await;
    assert_eq!(report.synced, 0);
    assert_eq!(h.sync.pushed().len(), 1);
}

#[tokio::test]
async fn test_drainer_holds_off_at_high_load() {
    let h = harness(HarnessOpts::default()).await;
    set_load(&h.monitor, 100.0);
    assert_eq!(h.monitor.current_level(), LoadLevel::High);

    let id = h.engine.enqueue(text("later")).await.unwrap();
    let report = h.drainer.run_once().await;
    assert_eq!(report.processed, 0);
    assert_eq!(h.engine.task_status(id).await.unwrap().status, TaskStatus::Pending);

    set_load(&h.monitor, 0.0);
    let report = h.drainer.run_once().await;
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn test_failed_push_keeps_result_and_backs_off() {
    let h = harness(HarnessOpts::default()).await;
    h.sync.fail.store(true, Ordering::SeqCst);

    let id = h.engine.enqueue(text("to push")).await.unwrap();
    let report = h.drainer.run_once().await;
    assert_eq!((report.completed, report.sync_failed), (1, 1));

    let view = h.engine.task_status(id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Completed);
    assert!(view.error.is_some());
    assert!(h.engine.task_result(id).await.unwrap().is_some());

    // Still inside the push backoff.
    let report = h.drainer.run_once().await;
    assert_eq!((report.synced, report.sync_failed), (0, 0));

    h.sync.fail.store(false, Ordering::SeqCst);
    let view = h.engine.push_now(id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Synced);
}

#[tokio::test]
async fn test_variant_choice_follows_load() {
    let h = harness(HarnessOpts::default()).await;
    let d = &h.dispatcher;

    set_load(&h.monitor, 0.0);
    assert_eq!(d.choose(Modality::Image, Urgency::Complex), VariantId::Large);

    set_load(&h.monitor, 100.0);
    assert_eq!(d.choose(Modality::Image, Urgency::Complex), VariantId::Small);

    set_load(&h.monitor, 60.0);
    assert_eq!(h.monitor.current_level(), LoadLevel::Moderate);
    assert_eq!(d.choose(Modality::Text, Urgency::Quick), VariantId::Small);
    assert_eq!(d.choose(Modality::Audio, Urgency::Complex), VariantId::Large);

    set_load(&h.monitor, 100.0);
    h.engine.set_override(Some(VariantId::Large));
    assert_eq!(d.choose(Modality::Text, Urgency::Quick), VariantId::Large);
}

#[tokio::test]
async fn test_large_load_failure_falls_back_to_small() {
    let h = harness(HarnessOpts::default()).await;
    h.backend.fail_load(LARGE_TAG);

    let outcome = h.engine.submit(text("anything")).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Completed { variant: VariantId::Small, .. }));
}

#[tokio::test]
async fn test_no_loadable_model_queues_and_reports_unavailable() {
    let h = harness(HarnessOpts::default()).await;
    h.backend.fail_load(LARGE_TAG);
    h.backend.fail_load(SMALL_TAG);

    let err = h.engine.submit(text("anything")).await.unwrap_err();
    let EngineError::Unavailable { task_id, .. } = err else {
        panic!("expected unavailable, got {err:?}");
    };
    assert_eq!(h.engine.task_status(task_id).await.unwrap().status, TaskStatus::Pending);

    let status = h.engine.system_status().await.unwrap();
    assert_eq!(status.load_state, LoadState::Failed);
    assert!(!status.inference_available);
    assert_eq!(status.pending_task_count, 1);
}

#[tokio::test]
async fn test_attempt_cap_parks_task_until_operator_retry() {
    let h = harness(HarnessOpts {
        retry: RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(1),
        },
        ..HarnessOpts::default()
    })
    .await;
    h.backend.fail_infer.store(true, Ordering::SeqCst);
    h.connectivity.set(false);

    let id = h.engine.enqueue(text("doomed")).await.unwrap();
    assert_eq!(h.drainer.run_once().await.failed, 1);
    assert_eq!(h.engine.task_status(id).await.unwrap().status, TaskStatus::Failed);

    let report = h.drainer.run_once().await;
    assert_eq!((report.released, report.failed), (1, 1));

    let err = h.engine.task_result(id).await.unwrap_err();
    assert!(matches!(err, EngineError::PermanentTaskFailure { attempts: 2, .. }));
    let failed = h.engine.failed_tasks(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, TaskStatus::PermanentlyFailed);

    // Parked tasks are not picked up again on their own.
    assert_eq!(h.drainer.run_once().await.processed, 0);

    h.backend.fail_infer.store(false, Ordering::SeqCst);
    let view = h.engine.retry(id).await.unwrap();
    assert_eq!((view.status, view.attempt_count), (TaskStatus::Pending, 0));
    assert_eq!(h.drainer.run_once().await.completed, 1);
}

#[tokio::test]
async fn test_media_request_without_payload_is_rejected() {
    let h = harness(HarnessOpts::default()).await;
    let err = h
        .engine
        .submit(SubmitRequest {
            modality: Modality::Audio,
            payload_ref: None,
            prompt: None,
            urgency: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));
    assert_eq!(h.engine.system_status().await.unwrap().storage.total, 0);
}

#[tokio::test]
async fn test_modality_the_backend_cannot_take_is_refused_not_queued() {
    let h = harness(HarnessOpts {
        backend: FakeBackend::serving(&[Modality::Text, Modality::Image]),
        ..HarnessOpts::default()
    })
    .await;

    let audio = SubmitRequest {
        modality: Modality::Audio,
        payload_ref: Some("/uploads/call.wav".into()),
        prompt: None,
        urgency: None,
    };
    let err = h.engine.submit(audio.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(Modality::Audio)));
    assert!(matches!(h.engine.enqueue(audio).await, Err(EngineError::Unsupported(_))));
    assert_eq!(h.engine.system_status().await.unwrap().storage.total, 0);
    assert!(h.backend.events().is_empty());

    let image = SubmitRequest {
        modality: Modality::Image,
        payload_ref: Some("/uploads/scene.jpg".into()),
        prompt: None,
        urgency: None,
    };
    assert!(matches!(h.engine.submit(image).await.unwrap(), SubmitOutcome::Completed { .. }));
}
