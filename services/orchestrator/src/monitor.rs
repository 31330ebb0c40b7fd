//! Load monitor.
//!
//! Samples host metrics on a fixed interval into a ring buffer, folds the
//! window into one score in `[0, 1]` and maps it onto a [`LoadLevel`] with
//! hysteresis: a level is only entered or left after the score has stayed
//! past the relevant threshold for the configured dwell time.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use modelops::LoadLevel;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LevelThresholds, MonitorConfig};

/// One reading. `None` means the metric could not be read on this host.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RawMetrics {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub gpu_pct: Option<f64>,
    pub temperature_c: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub gpu_pct: Option<f64>,
    pub temperature_c: Option<f64>,
    pub in_flight_count: usize,
}

/// Where metrics come from. `read` may block; the monitor runs it off the
/// async runtime under a timeout.
pub trait MetricsSource: Send + Sync + 'static {
    fn read(&self) -> RawMetrics;
}

const JETSON_GPU_LOAD: [&str; 2] = ["/sys/devices/gpu.0/load", "/sys/devices/platform/gpu.0/load"];
const THERMAL_ROOT: &str = "/sys/class/thermal";

/// Real host metrics: CPU and memory through `sysinfo`, Jetson GPU load and
/// thermal zones through sysfs.
pub struct HostMetrics {
    sys: Mutex<System>,
}

impl HostMetrics {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self { sys: Mutex::new(sys) }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for HostMetrics {
    fn read(&self) -> RawMetrics {
        let (cpu_pct, mem_pct) = match self.sys.lock() {
            Ok(mut sys) => {
                // Usage is a delta against the previous refresh, so the very
                // first reading is meaningless; later ones are spaced by the
                // sampling interval.
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let cpu = sys.global_cpu_info().cpu_usage() as f64;
                let total = sys.total_memory();
                let mem = (total > 0).then(|| sys.used_memory() as f64 * 100.0 / total as f64);
                (Some(cpu.clamp(0.0, 100.0)), mem)
            }
            Err(_) => (None, None),
        };

        RawMetrics {
            cpu_pct,
            mem_pct,
            gpu_pct: read_jetson_gpu_load(),
            temperature_c: read_max_thermal_zone(Path::new(THERMAL_ROOT)),
        }
    }
}

/// Jetson exposes GPU load in per mille.
fn read_jetson_gpu_load() -> Option<f64> {
    JETSON_GPU_LOAD.iter().find_map(|p| {
        let raw = std::fs::read_to_string(p).ok()?;
        let per_mille: f64 = raw.trim().parse().ok()?;
        Some((per_mille / 10.0).clamp(0.0, 100.0))
    })
}

/// Hottest thermal zone in degrees C. Zones report millidegrees.
fn read_max_thermal_zone(root: &Path) -> Option<f64> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
        .filter_map(|e| std::fs::read_to_string(e.path().join("temp")).ok())
        .filter_map(|raw| raw.trim().parse::<f64>().ok())
        .map(|milli| milli / 1000.0)
        // Some zones report nonsense (negative or absurd) when the sensor is absent.
        .filter(|c| (-40.0..150.0).contains(c))
        .reduce(f64::max)
}

/// Hysteresis state machine over the load score.
#[derive(Debug)]
pub struct LevelTracker {
    thresholds: LevelThresholds,
    dwell: Duration,
    level: LoadLevel,
    candidate: Option<(LoadLevel, Instant)>,
}

impl LevelTracker {
    pub fn new(thresholds: LevelThresholds, dwell: Duration) -> Self {
        Self { thresholds, dwell, level: LoadLevel::Low, candidate: None }
    }

    pub fn level(&self) -> LoadLevel {
        self.level
    }

    /// Level the score points at, given where we are now. Leaving a level
    /// needs the score to cross the exit threshold, not the enter one.
    fn target(&self, score: f64) -> LoadLevel {
        let t = &self.thresholds;
        match self.level {
            LoadLevel::Low => {
                if score >= t.high_enter {
                    LoadLevel::High
                } else if score >= t.moderate_enter {
                    LoadLevel::Moderate
                } else {
                    LoadLevel::Low
                }
            }
            LoadLevel::Moderate => {
                if score >= t.high_enter {
                    LoadLevel::High
                } else if score < t.moderate_exit {
                    LoadLevel::Low
                } else {
                    LoadLevel::Moderate
                }
            }
            LoadLevel::High => {
                if score >= t.high_exit {
                    LoadLevel::High
                } else if score < t.moderate_exit {
                    LoadLevel::Low
                } else {
                    LoadLevel::Moderate
                }
            }
        }
    }

    /// Feeds one score observed at `now`. Returns the new level when it flips.
    pub fn observe(&mut self, score: f64, now: Instant) -> Option<LoadLevel> {
        let target = self.target(score);
        if target == self.level {
            self.candidate = None;
            return None;
        }

        // A candidate moving further in the same direction keeps its start time.
        let since = match self.candidate {
            Some((c, since)) if (c > self.level) == (target > self.level) => since,
            _ => now,
        };
        self.candidate = Some((target, since));

        if now.saturating_duration_since(since) >= self.dwell {
            self.level = target;
            self.candidate = None;
            return Some(target);
        }
        None
    }
}

/// Folds a window of samples into a score in `[0, 1]`.
///
/// Each metric is averaged over the samples where it is known and normalized.
/// Weights are renormalized over the metrics that have any value at all, so a
/// host without a GPU or thermal sensor is not scored as idle on those.
pub fn score(samples: &VecDeque<LoadSample>, cfg: &MonitorConfig, capacity: usize) -> Option<f64> {
    fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
        let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    let w = &cfg.weights;
    let temp_span = (cfg.temp_ceiling_c - cfg.temp_floor_c).max(1.0);

    let parts = [
        (mean(samples.iter().filter_map(|s| s.cpu_pct)).map(|v| v / 100.0), w.cpu),
        (mean(samples.iter().filter_map(|s| s.mem_pct)).map(|v| v / 100.0), w.mem),
        (mean(samples.iter().filter_map(|s| s.gpu_pct)).map(|v| v / 100.0), w.gpu),
        (
            mean(samples.iter().filter_map(|s| s.temperature_c))
                .map(|c| (c - cfg.temp_floor_c) / temp_span),
            w.temperature,
        ),
        (
            (capacity > 0)
                .then(|| mean(samples.iter().map(|s| s.in_flight_count as f64)))
                .flatten()
                .map(|n| n / capacity as f64),
            w.in_flight,
        ),
    ];

    let (weighted, total_weight) = parts
        .iter()
        .filter_map(|(v, w)| v.map(|v| (v.clamp(0.0, 1.0) * w, *w)))
        .fold((0.0, 0.0), |(a, b), (v, w)| (a + v, b + w));

    (total_weight > 0.0).then(|| weighted / total_weight)
}

pub struct LoadMonitor {
    source: Arc<dyn MetricsSource>,
    cfg: MonitorConfig,
    samples: RwLock<VecDeque<LoadSample>>,
    tracker: Mutex<LevelTracker>,
    level_tx: watch::Sender<LoadLevel>,
    in_flight: Option<(Arc<AtomicUsize>, usize)>,
}

impl LoadMonitor {
    pub fn new(source: Arc<dyn MetricsSource>, cfg: MonitorConfig) -> Self {
        let tracker = LevelTracker::new(cfg.thresholds.clone(), cfg.dwell);
        let (level_tx, _) = watch::channel(LoadLevel::Low);
        Self {
            source,
            samples: RwLock::new(VecDeque::with_capacity(cfg.window)),
            tracker: Mutex::new(tracker),
            level_tx,
            in_flight: None,
            cfg,
        }
    }

    /// Counts in-flight inference calls into the score, relative to `capacity`.
    pub fn with_in_flight(mut self, gauge: Arc<AtomicUsize>, capacity: usize) -> Self {
        self.in_flight = Some((gauge, capacity));
        self
    }

    pub fn current_level(&self) -> LoadLevel {
        *self.level_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadLevel> {
        self.level_tx.subscribe()
    }

    pub fn latest(&self) -> Option<LoadSample> {
        self.samples.read().ok()?.back().cloned()
    }

    /// Takes one sample, bounded by the sampling timeout.
    pub async fn sample(&self) -> LoadSample {
        let source = self.source.clone();
        let read = tokio::task::spawn_blocking(move || source.read());
        let raw = match tokio::time::timeout(self.cfg.sample_timeout, read).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "load monitor: metrics read panicked");
                RawMetrics::default()
            }
            Err(_) => {
                warn!(timeout = ?self.cfg.sample_timeout, "load monitor: metrics read timed out");
                RawMetrics::default()
            }
        };

        let sample = LoadSample {
            timestamp: Utc::now(),
            cpu_pct: raw.cpu_pct,
            mem_pct: raw.mem_pct,
            gpu_pct: raw.gpu_pct,
            temperature_c: raw.temperature_c,
            in_flight_count: self
                .in_flight
                .as_ref()
                .map(|(g, _)| g.load(Ordering::SeqCst))
                .unwrap_or(0),
        };
        self.record(sample.clone(), Instant::now());
        sample
    }

    /// Appends a sample observed at `now` and re-evaluates the level.
    pub fn record(&self, sample: LoadSample, now: Instant) -> LoadLevel {
        let score = {
            let Ok(mut samples) = self.samples.write() else {
                return self.current_level();
            };
            if samples.len() == self.cfg.window {
                samples.pop_front();
            }
            samples.push_back(sample);
            let capacity = self.in_flight.as_ref().map(|(_, c)| *c).unwrap_or(0);
            score(&samples, &self.cfg, capacity)
        };

        let Some(score) = score else {
            debug!("load monitor: no readable metrics, level unchanged");
            return self.current_level();
        };

        let Ok(mut tracker) = self.tracker.lock() else {
            return self.current_level();
        };
        if let Some(level) = tracker.observe(score, now) {
            info!(level = %level, score = %format!("{score:.2}"), "load level changed");
            self.level_tx.send_replace(level);
        }
        tracker.level()
    }

    /// Samples on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval = ?self.cfg.sample_interval, "load monitor: started");
        let mut tick = tokio::time::interval(self.cfg.sample_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sample().await;
                }
            }
        }
        info!("load monitor: stopped");
    }
}
