use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use modelops::Modality;
use taskstore::RetryPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Root for the task database, payload copies and results.
    pub storage_dir: PathBuf,
    pub results_dir: PathBuf,

    pub backend: BackendKind,
    pub ollama_url: String,
    /// Local multimodal server; the only backend that takes audio and video.
    pub model_server_url: String,
    pub small_model_tag: String,
    pub small_model_mb: u64,
    pub large_model_tag: String,
    pub large_model_mb: u64,

    pub monitor: MonitorConfig,
    pub dispatch: DispatchConfig,
    pub drainer: DrainerConfig,
    pub retry: RetryPolicy,

    pub sync_url: Option<String>,
    pub sync_secret: Option<String>,
    pub probe_url: Option<String>,
    pub probe_interval: Duration,

    /// Collapse identical payloads of the same kind into one task.
    pub dedupe_payloads: bool,
}

/// Which inference server the runtime drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    ModelServer,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "model_server" | "model-server" => Ok(BackendKind::ModelServer),
            other => bail!("unknown inference backend: {other} (expected ollama or model_server)"),
        }
    }
}

/// Weights of each metric in the load score. Renormalized over the metrics
/// a sample actually has.
#[derive(Clone, Debug)]
pub struct LoadWeights {
    pub cpu: f64,
    pub mem: f64,
    pub gpu: f64,
    pub temperature: f64,
    pub in_flight: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self { cpu: 0.35, mem: 0.25, gpu: 0.2, temperature: 0.1, in_flight: 0.1 }
    }
}

/// Score thresholds in `[0, 1]`. `exit < enter` for each level gives the
/// hysteresis band.
#[derive(Clone, Debug)]
pub struct LevelThresholds {
    pub moderate_enter: f64,
    pub moderate_exit: f64,
    pub high_enter: f64,
    pub high_exit: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self { moderate_enter: 0.55, moderate_exit: 0.45, high_enter: 0.80, high_exit: 0.70 }
    }
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub sample_interval: Duration,
    /// Upper bound on one `sample()`; metrics not read in time count as unknown.
    pub sample_timeout: Duration,
    /// Ring buffer length.
    pub window: usize,
    pub weights: LoadWeights,
    pub thresholds: LevelThresholds,
    /// How long the score must stay past a threshold before the level flips.
    pub dwell: Duration,
    /// Temperatures are scaled linearly between these two.
    pub temp_floor_c: f64,
    pub temp_ceiling_c: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            sample_timeout: Duration::from_secs(1),
            window: 10,
            weights: LoadWeights::default(),
            thresholds: LevelThresholds::default(),
            dwell: Duration::from_secs(10),
            temp_floor_c: 40.0,
            temp_ceiling_c: 85.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Permits; `None` means use the device profile's safe concurrency.
    pub max_concurrent: Option<usize>,
    /// How long a live request waits for a permit before it is queued.
    pub permit_wait: Duration,
    /// How long a request waits for its variant to become ready.
    pub acquire_wait: Duration,
    /// Upper bound on one backend load; past it the variant counts as failed.
    pub load_timeout: Duration,
    pub text_timeout: Duration,
    pub image_timeout: Duration,
    pub audio_timeout: Duration,
    pub video_timeout: Duration,
}

impl DispatchConfig {
    pub fn timeout_for(&self, modality: Modality) -> Duration {
        match modality {
            Modality::Text => self.text_timeout,
            Modality::Image => self.image_timeout,
            Modality::Audio => self.audio_timeout,
            Modality::Video => self.video_timeout,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            permit_wait: Duration::from_millis(250),
            acquire_wait: Duration::from_secs(120),
            load_timeout: Duration::from_secs(300),
            text_timeout: Duration::from_secs(60),
            image_timeout: Duration::from_secs(300),
            audio_timeout: Duration::from_secs(600),
            video_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DrainerConfig {
    pub poll_interval: Duration,
    /// Queued tasks processed per pass before pushes get a turn.
    pub process_batch: u32,
    /// Completed tasks pushed per pass.
    pub sync_batch: u32,
    pub sync_timeout: Duration,
    pub sync_base_backoff: Duration,
    pub sync_max_backoff: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            process_batch: 8,
            sync_batch: 16,
            sync_timeout: Duration::from_secs(15),
            sync_base_backoff: Duration::from_secs(5),
            sync_max_backoff: Duration::from_secs(1800),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let storage_dir = PathBuf::from(get("TRIAGE_STORAGE_DIR")?);
        let results_dir = opt("TRIAGE_RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| storage_dir.join("results"));

        let bind_addr = opt("ORCH_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let backend = match opt("INFERENCE_BACKEND") {
            Some(v) => v.parse()?,
            None => BackendKind::Ollama,
        };
        let ollama_url = opt("OLLAMA_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let model_server_url =
            opt("MODEL_SERVER_URL").unwrap_or_else(|| "http://127.0.0.1:5001".to_string());

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            sample_interval: millis_or("LOAD_SAMPLE_INTERVAL_MS", monitor_defaults.sample_interval)?,
            sample_timeout: millis_or("LOAD_SAMPLE_TIMEOUT_MS", monitor_defaults.sample_timeout)?,
            window: parse_or("LOAD_WINDOW", monitor_defaults.window)?,
            weights: LoadWeights {
                cpu: parse_or("LOAD_WEIGHT_CPU", monitor_defaults.weights.cpu)?,
                mem: parse_or("LOAD_WEIGHT_MEM", monitor_defaults.weights.mem)?,
                gpu: parse_or("LOAD_WEIGHT_GPU", monitor_defaults.weights.gpu)?,
                temperature: parse_or("LOAD_WEIGHT_TEMP", monitor_defaults.weights.temperature)?,
                in_flight: parse_or("LOAD_WEIGHT_IN_FLIGHT", monitor_defaults.weights.in_flight)?,
            },
            thresholds: LevelThresholds {
                moderate_enter: parse_or("LOAD_MODERATE_ENTER", monitor_defaults.thresholds.moderate_enter)?,
                moderate_exit: parse_or("LOAD_MODERATE_EXIT", monitor_defaults.thresholds.moderate_exit)?,
                high_enter: parse_or("LOAD_HIGH_ENTER", monitor_defaults.thresholds.high_enter)?,
                high_exit: parse_or("LOAD_HIGH_EXIT", monitor_defaults.thresholds.high_exit)?,
            },
            dwell: millis_or("LOAD_DWELL_MS", monitor_defaults.dwell)?,
            temp_floor_c: parse_or("LOAD_TEMP_FLOOR_C", monitor_defaults.temp_floor_c)?,
            temp_ceiling_c: parse_or("LOAD_TEMP_CEILING_C", monitor_defaults.temp_ceiling_c)?,
        };

        let d = DispatchConfig::default();
        let dispatch = DispatchConfig {
            max_concurrent: opt("MAX_CONCURRENT_INFERENCE")
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("MAX_CONCURRENT_INFERENCE must be a positive integer")?,
            permit_wait: millis_or("PERMIT_WAIT_MS", d.permit_wait)?,
            acquire_wait: secs_or("MODEL_ACQUIRE_WAIT_SECS", d.acquire_wait)?,
            load_timeout: secs_or("MODEL_LOAD_TIMEOUT_SECS", d.load_timeout)?,
            text_timeout: secs_or("TEXT_TIMEOUT_SECS", d.text_timeout)?,
            image_timeout: secs_or("IMAGE_TIMEOUT_SECS", d.image_timeout)?,
            audio_timeout: secs_or("AUDIO_TIMEOUT_SECS", d.audio_timeout)?,
            video_timeout: secs_or("VIDEO_TIMEOUT_SECS", d.video_timeout)?,
        };

        let dr = DrainerConfig::default();
        let drainer = DrainerConfig {
            poll_interval: millis_or("DRAIN_POLL_MS", dr.poll_interval)?,
            process_batch: parse_or("DRAIN_BATCH", dr.process_batch)?,
            sync_batch: parse_or("SYNC_BATCH", dr.sync_batch)?,
            sync_timeout: secs_or("SYNC_TIMEOUT_SECS", dr.sync_timeout)?,
            sync_base_backoff: secs_or("SYNC_BACKOFF_BASE_SECS", dr.sync_base_backoff)?,
            sync_max_backoff: secs_or("SYNC_BACKOFF_MAX_SECS", dr.sync_max_backoff)?,
        };

        let r = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or("TASK_MAX_ATTEMPTS", r.max_attempts)?,
            base_backoff: secs_or("TASK_BACKOFF_BASE_SECS", r.base_backoff)?,
            max_backoff: secs_or("TASK_BACKOFF_MAX_SECS", r.max_backoff)?,
        };

        let cfg = Self {
            bind_addr,
            storage_dir,
            results_dir,
            backend,
            ollama_url,
            model_server_url,
            small_model_tag: opt("SMALL_MODEL_TAG").unwrap_or_else(|| "gemma3n:e2b".to_string()),
            small_model_mb: parse_or("SMALL_MODEL_MB", 5_600)?,
            large_model_tag: opt("LARGE_MODEL_TAG").unwrap_or_else(|| "gemma3n:e4b".to_string()),
            large_model_mb: parse_or("LARGE_MODEL_MB", 7_500)?,
            monitor,
            dispatch,
            drainer,
            retry,
            sync_url: opt("SYNC_URL"),
            sync_secret: opt("SYNC_SECRET"),
            probe_url: opt("CONNECTIVITY_PROBE_URL"),
            probe_interval: secs_or("CONNECTIVITY_PROBE_SECS", Duration::from_secs(30))?,
            dedupe_payloads: flag("DEDUPE_PAYLOADS", false),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for (key, url) in [
            ("OLLAMA_URL", Some(&self.ollama_url)),
            ("MODEL_SERVER_URL", Some(&self.model_server_url)),
            ("SYNC_URL", self.sync_url.as_ref()),
            ("CONNECTIVITY_PROBE_URL", self.probe_url.as_ref()),
        ] {
            if let Some(u) = url {
                if !u.starts_with("http://") && !u.starts_with("https://") {
                    bail!("{key} must start with http:// or https://");
                }
            }
        }

        let t = &self.monitor.thresholds;
        if !(t.moderate_exit < t.moderate_enter && t.high_exit < t.high_enter) {
            bail!("load exit thresholds must sit below their enter thresholds");
        }
        if t.moderate_enter >= t.high_enter {
            bail!("LOAD_MODERATE_ENTER must be below LOAD_HIGH_ENTER");
        }
        if self.monitor.window == 0 {
            bail!("LOAD_WINDOW must be at least 1");
        }
        if self.dispatch.max_concurrent == Some(0) {
            bail!("MAX_CONCURRENT_INFERENCE must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("TASK_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

fn get(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Missing required env var: {key}"))
}

fn opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match opt(key) {
        Some(v) => v.trim().parse().with_context(|| format!("Invalid value for {key}: {v}")),
        None => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    parse_or(key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    parse_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn flag(key: &str, default: bool) -> bool {
    opt(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_with_payload_weight() {
        let d = DispatchConfig::default();
        assert!(d.timeout_for(Modality::Text) < d.timeout_for(Modality::Image));
        assert!(d.timeout_for(Modality::Image) <= d.timeout_for(Modality::Audio));
        assert_eq!(d.timeout_for(Modality::Audio), d.timeout_for(Modality::Video));
    }

    #[test]
    fn test_backend_names_parse() {
        assert_eq!("ollama".parse::<BackendKind>().unwrap(), BackendKind::Ollama);
        assert_eq!(" Model_Server ".parse::<BackendKind>().unwrap(), BackendKind::ModelServer);
        assert!("lmstudio".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_default_thresholds_leave_a_band() {
        let t = LevelThresholds::default();
        assert!(t.moderate_exit < t.moderate_enter);
        assert!(t.high_exit < t.high_enter);
        assert!(t.moderate_enter < t.high_exit);
    }
}
