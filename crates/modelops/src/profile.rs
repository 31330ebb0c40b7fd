//! Device capability detection.
//!
//! The profile is derived from a [`HostProbe`] so the decision logic can be
//! exercised without the hardware. [`DeviceCapabilityProfile::cached`] probes
//! the real host once and keeps the result until the process exits.

use std::path::Path;
use std::sync::OnceLock;

use serde::Serialize;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::info;

use crate::{VariantCatalog, VariantId};

const JETSON_MARKERS: [&str; 3] = [
    "/etc/nv_tegra_release",
    "/proc/device-tree/model",
    "/sys/module/tegra_fuse/parameters/tegra_chip_id",
];

const CUDA_MARKERS: [&str; 3] = ["/proc/driver/nvidia/version", "/dev/nvidia0", "/dev/nvhost-gpu"];

/// Memory left for the OS and the rest of the app when the large variant is resident.
const MEMORY_HEADROOM_MB: u64 = 1024;

/// Offline processing on a non-Jetson CUDA box needs more than this much free memory.
const OFFLINE_MIN_AVAILABLE_MB: u64 = 4 * 1024;

static PROFILE: OnceLock<DeviceCapabilityProfile> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeClass {
    Jetson,
    CudaWorkstation,
    CpuOnly,
}

/// Raw facts read from the host.
#[derive(Clone, Debug, Default)]
pub struct HostProbe {
    pub jetson_marker: bool,
    pub has_cuda: bool,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
}

impl HostProbe {
    pub fn read() -> Self {
        let jetson_marker = JETSON_MARKERS.iter().any(|p| is_jetson_marker(Path::new(p)));
        let has_cuda = jetson_marker || CUDA_MARKERS.iter().any(|p| Path::new(p).exists());

        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        let (mut total, mut available) = (sys.total_memory(), sys.available_memory());
        // sysinfo reports 0 inside some restricted containers.
        if total == 0 {
            if let Some((t, a)) = read_proc_meminfo() {
                total = t;
                available = a;
            }
        }

        Self {
            jetson_marker,
            has_cuda,
            total_memory_mb: total / (1024 * 1024),
            available_memory_mb: available / (1024 * 1024),
        }
    }
}

/// What this host can run. Computed once per process.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceCapabilityProfile {
    pub compute_class: ComputeClass,
    pub has_accelerator: bool,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub large_variant_supported: bool,
    pub offline_processing_supported: bool,
}

impl DeviceCapabilityProfile {
    pub fn from_probe(probe: &HostProbe, catalog: &VariantCatalog) -> Self {
        let compute_class = if probe.jetson_marker {
            ComputeClass::Jetson
        } else if probe.has_cuda {
            ComputeClass::CudaWorkstation
        } else {
            ComputeClass::CpuOnly
        };

        let large_mb = catalog.get(VariantId::Large).cost.memory_mb;
        let large_variant_supported = probe.total_memory_mb >= large_mb + MEMORY_HEADROOM_MB;

        let offline_processing_supported = match compute_class {
            ComputeClass::Jetson => true,
            ComputeClass::CudaWorkstation => probe.available_memory_mb > OFFLINE_MIN_AVAILABLE_MB,
            ComputeClass::CpuOnly => false,
        };

        Self {
            compute_class,
            has_accelerator: probe.has_cuda,
            total_memory_mb: probe.total_memory_mb,
            available_memory_mb: probe.available_memory_mb,
            large_variant_supported,
            offline_processing_supported,
        }
    }

    pub fn detect(catalog: &VariantCatalog) -> Self {
        let profile = Self::from_probe(&HostProbe::read(), catalog);
        info!(
            class = ?profile.compute_class,
            total_mb = profile.total_memory_mb,
            large = profile.large_variant_supported,
            "device profile detected"
        );
        profile
    }

    /// Process-wide profile, probed on first use.
    pub fn cached(catalog: &VariantCatalog) -> &'static DeviceCapabilityProfile {
        PROFILE.get_or_init(|| Self::detect(catalog))
    }

    pub fn supports(&self, variant: VariantId) -> bool {
        match variant {
            VariantId::Small => true,
            VariantId::Large => self.large_variant_supported,
        }
    }

    /// Concurrent inference calls the device can sustain without thrashing.
    pub fn safe_concurrency(&self) -> usize {
        match self.compute_class {
            ComputeClass::CpuOnly => 1,
            ComputeClass::Jetson => 2,
            ComputeClass::CudaWorkstation => 4,
        }
    }
}

fn is_jetson_marker(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    // Any ARM board has a device-tree model; only trust it when it names the vendor.
    if path.starts_with("/proc/device-tree") {
        return std::fs::read_to_string(path)
            .map(|m| {
                let m = m.to_ascii_lowercase();
                m.contains("jetson") || m.contains("nvidia")
            })
            .unwrap_or(false);
    }
    true
}

fn read_proc_meminfo() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(rest);
        }
    }
    Some((total_kb? * 1024, available_kb.unwrap_or(0) * 1024))
}

fn parse_kb(s: &str) -> Option<u64> {
    s.trim().trim_end_matches("kB").trim().parse().ok()
}
