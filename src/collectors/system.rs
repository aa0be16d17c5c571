use crate::collectors::{HostSample, MetricsProvider, SampleError};
use crate::state::{CpuStat, MemoryStat, StorageStat, SystemInfoStat, Temperature, UptimeStat};
use std::path::Path;
use std::sync::Mutex;
use sysinfo::{ComponentExt, CpuExt, DiskExt, System, SystemExt};

/// [`MetricsProvider`] backed by sysinfo plus the Linux cpufreq sysfs for
/// frequency bounds.
pub struct SysinfoProvider {
    system: Mutex<System>,
    disk_mount: String,
    temperature_sensor: String,
}

impl SysinfoProvider {
    pub fn new(disk_mount: impl Into<String>, temperature_sensor: impl Into<String>) -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            disk_mount: disk_mount.into(),
            temperature_sensor: temperature_sensor.into(),
        }
    }
}

impl MetricsProvider for SysinfoProvider {
    fn sample(&self) -> Result<HostSample, SampleError> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sample_host(&mut system, &self.disk_mount, &self.temperature_sensor)
    }
}

pub fn sample_host(
    system: &mut System,
    disk_mount: &str,
    temperature_sensor: &str,
) -> Result<HostSample, SampleError> {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_components_list();
    system.refresh_components();

    let cpu = system.cpus().first().ok_or(SampleError::CpuUnavailable)?;
    let processor = cpu.brand().to_string();
    let current_ghz = mhz_to_ghz(cpu.frequency() as f64);
    let (min_ghz, max_ghz) = match cpufreq_bounds_mhz() {
        Some((min_mhz, max_mhz)) => (mhz_to_ghz(min_mhz), mhz_to_ghz(max_mhz)),
        None => (0.0, 0.0),
    };
    let temperature = read_temperature(system, temperature_sensor);

    // sysinfo reports memory in KiB; disks are already bytes.
    let memory_total = system.total_memory() * 1024;
    let memory_used = system.used_memory() * 1024;
    let memory = MemoryStat {
        percent: usage_percent(memory_used, memory_total),
        total_gib: bytes_to_gib(memory_total),
        used_gib: bytes_to_gib(memory_used),
    };

    let disk = system
        .disks()
        .iter()
        .find(|d| d.mount_point() == Path::new(disk_mount))
        .ok_or_else(|| SampleError::DiskUnavailable {
            mount: disk_mount.to_string(),
        })?;
    let storage_total = disk.total_space();
    let storage_used = storage_total.saturating_sub(disk.available_space());
    let storage = StorageStat {
        percent: usage_percent(storage_used, storage_total),
        total_gib: bytes_to_gib(storage_total),
        used_gib: bytes_to_gib(storage_used),
    };

    let system_info = SystemInfoStat {
        uptime: split_uptime(system.uptime()),
        os: system.name().unwrap_or_else(|| "unknown".to_string()),
        os_version: system.os_version().unwrap_or_else(|| "unknown".to_string()),
    };

    Ok(HostSample {
        cpu: CpuStat {
            processor,
            current_ghz,
            min_ghz,
            max_ghz,
            temperature,
            load_percent: load_percent(current_ghz),
        },
        memory,
        storage,
        system_info,
    })
}

/// Frequency gauge against an assumed 2.0 GHz baseline. Kept for parity
/// with the dashboards consuming it; this is not CPU-busy time.
pub fn load_percent(current_ghz: f64) -> f64 {
    (current_ghz / 2.0) * 100.0
}

pub fn mhz_to_ghz(mhz: f64) -> f64 {
    mhz / 1000.0
}

pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / (1_u64 << 30) as f64
}

/// used / total as a percentage rounded to one decimal. The rounding
/// happens here, at the provider boundary; snapshots carry it untouched.
pub fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 1000.0).round() / 10.0
}

pub fn split_uptime(seconds: u64) -> UptimeStat {
    UptimeStat {
        days: seconds / 86_400,
        hours: (seconds % 86_400) / 3_600,
        minutes: (seconds % 3_600) / 60,
    }
}

fn read_temperature(system: &System, sensor: &str) -> Temperature {
    let needle = sensor.to_lowercase();
    system
        .components()
        .iter()
        .find(|c| c.label().to_lowercase().contains(&needle))
        .map(|c| Temperature::Celsius(c.temperature() as f64))
        .unwrap_or(Temperature::SensorMissing)
}

#[cfg(target_os = "linux")]
fn cpufreq_bounds_mhz() -> Option<(f64, f64)> {
    let min = read_cpufreq_khz("cpuinfo_min_freq")?;
    let max = read_cpufreq_khz("cpuinfo_max_freq")?;
    Some((min / 1000.0, max / 1000.0))
}

#[cfg(target_os = "linux")]
fn read_cpufreq_khz(name: &str) -> Option<f64> {
    let path = format!("/sys/devices/system/cpu/cpu0/cpufreq/{name}");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn cpufreq_bounds_mhz() -> Option<(f64, f64)> {
    None
}
