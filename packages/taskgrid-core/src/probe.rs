/// GPU discovery and sampling (component A).
///
/// Bound behind a trait so a mock backend is interchangeable with the real
/// NVML binding in tests.
use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::DeviceId;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub username: String,
    pub used_mb: u64,
    pub command: String,
}

/// A single, internally-consistent read of one device. All fields come
/// from the same underlying query — never assembled from separate probe
/// calls, so a caller never observes `memory_free` from one instant and
/// `utilization_pct` from another.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub index: DeviceId,
    pub name: String,
    pub temperature_c: u32,
    pub utilization_pct: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub processes: Vec<ProcessInfo>,
}

impl DeviceSnapshot {
    pub fn memory_free_gb(&self) -> f64 {
        self.memory_free_mb as f64 / 1024.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("GPU vendor query unavailable: {0}")]
    Unavailable(String),
    #[error("no such device: {0}")]
    NoSuchDevice(DeviceId),
}

#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Enumerate the devices visible on this host. Returns an empty list,
    /// never an error, when no devices are present — `Unavailable` is
    /// reserved for "the vendor query itself failed."
    async fn list_devices(&self) -> Result<Vec<DeviceId>, ProbeError>;

    /// A single consistent read of one device's current state.
    async fn snapshot(&self, device: DeviceId) -> Result<DeviceSnapshot, ProbeError>;

    /// PIDs on `device` whose command line names a `python`-prefixed
    /// interpreter — owned by `my_username` or by anyone else. "Foreign"
    /// describes the scheduler's relationship to the process (it did not
    /// spawn it and cannot account for its memory use), not its owner: a
    /// stray `python train.py` left running by the current user counts
    /// too, per the glossary definition of a foreign process.
    async fn foreign_python_processes(
        &self,
        device: DeviceId,
        _my_username: &str,
    ) -> Result<Vec<u32>, ProbeError> {
        let snap = self.snapshot(device).await?;
        Ok(snap
            .processes
            .iter()
            .filter(|p| is_python_interpreter(&p.command))
            .map(|p| p.pid)
            .collect())
    }
}

fn is_python_interpreter(command: &str) -> bool {
    let prog = command
        .split_whitespace()
        .next()
        .and_then(|p| p.rsplit('/').next())
        .unwrap_or("");
    prog.starts_with("python")
}

/// Production backend: NVML via `nvml-wrapper`.
pub struct NvmlProbe {
    nvml: nvml_wrapper::Nvml,
}

impl NvmlProbe {
    pub fn init() -> Result<Self, ProbeError> {
        let nvml = nvml_wrapper::Nvml::init().map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        Ok(Self { nvml })
    }
}

#[async_trait]
impl GpuProbe for NvmlProbe {
    async fn list_devices(&self) -> Result<Vec<DeviceId>, ProbeError> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        Ok((0..count).collect())
    }

    async fn snapshot(&self, device: DeviceId) -> Result<DeviceSnapshot, ProbeError> {
        let dev = self
            .nvml
            .device_by_index(device)
            .map_err(|_| ProbeError::NoSuchDevice(device))?;

        let name = dev.name().unwrap_or_else(|_| format!("gpu{device}"));
        let temperature_c = dev
            .temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
            .unwrap_or(0);
        let utilization_pct = dev.utilization_rates().map(|u| u.gpu as f64).unwrap_or(0.0);
        let mem = dev
            .memory_info()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let power_draw_w = dev.power_usage().map(|mw| mw as f64 / 1000.0).unwrap_or(0.0);
        let power_limit_w = dev
            .enforced_power_limit()
            .map(|mw| mw as f64 / 1000.0)
            .unwrap_or(0.0);

        let processes = dev
            .running_compute_processes()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                let pid = p.pid;
                let used_mb = match p.used_gpu_memory {
                    nvml_wrapper::enums::device::UsedGpuMemory::Used(bytes) => bytes / (1024 * 1024),
                    nvml_wrapper::enums::device::UsedGpuMemory::Unavailable => 0,
                };
                let (username, command) = process_identity(pid);
                Some(ProcessInfo {
                    pid,
                    username,
                    used_mb,
                    command,
                })
            })
            .collect();

        Ok(DeviceSnapshot {
            index: device,
            name,
            temperature_c,
            utilization_pct,
            memory_total_mb: mem.total / (1024 * 1024),
            memory_used_mb: mem.used / (1024 * 1024),
            memory_free_mb: mem.free / (1024 * 1024),
            power_draw_w,
            power_limit_w,
            processes,
        })
    }
}

/// Best-effort `/proc/<pid>` lookup of owner and command line. Missing or
/// unreadable entries (process exited between NVML's read and ours, or
/// insufficient permission) degrade to empty strings rather than erroring
/// the whole snapshot.
#[cfg(target_os = "linux")]
fn process_identity(pid: u32) -> (String, String) {
    let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .map(|s| s.replace('\0', " ").trim().to_string())
        .unwrap_or_default();

    let username = std::fs::metadata(format!("/proc/{pid}"))
        .ok()
        .map(|meta| {
            use std::os::unix::fs::MetadataExt;
            uid_to_username(meta.uid())
        })
        .unwrap_or_default();

    (username, cmdline)
}

#[cfg(not(target_os = "linux"))]
fn process_identity(_pid: u32) -> (String, String) {
    (String::new(), String::new())
}

#[cfg(target_os = "linux")]
fn uid_to_username(uid: u32) -> String {
    // SAFETY: getpwuid returns a pointer into a thread-local static buffer
    // owned by libc; we copy the name out before any other libc call that
    // might reuse it.
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return uid.to_string();
        }
        std::ffi::CStr::from_ptr((*pw).pw_name)
            .to_string_lossy()
            .into_owned()
    }
}

/// Test/offline backend driven entirely from an in-memory table, so the
/// Selector, Ledger, and Worker can be exercised without a GPU present.
pub struct MockGpuProbe {
    devices: parking_lot::Mutex<HashMap<DeviceId, DeviceSnapshot>>,
}

impl MockGpuProbe {
    pub fn new(devices: Vec<DeviceSnapshot>) -> Self {
        Self {
            devices: parking_lot::Mutex::new(devices.into_iter().map(|d| (d.index, d)).collect()),
        }
    }

    /// Mutate a device's live reading in place, e.g. to simulate a
    /// transient utilization spike mid-sampling-window.
    pub fn set(&self, snapshot: DeviceSnapshot) {
        self.devices.lock().insert(snapshot.index, snapshot);
    }
}

#[async_trait]
impl GpuProbe for MockGpuProbe {
    async fn list_devices(&self) -> Result<Vec<DeviceId>, ProbeError> {
        let mut ids: Vec<_> = self.devices.lock().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn snapshot(&self, device: DeviceId) -> Result<DeviceSnapshot, ProbeError> {
        self.devices
            .lock()
            .get(&device)
            .cloned()
            .ok_or(ProbeError::NoSuchDevice(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(index: DeviceId, free_mb: u64, processes: Vec<ProcessInfo>) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            name: format!("mock{index}"),
            temperature_c: 40,
            utilization_pct: 10.0,
            memory_total_mb: 80 * 1024,
            memory_used_mb: 80 * 1024 - free_mb,
            memory_free_mb: free_mb,
            power_draw_w: 50.0,
            power_limit_w: 300.0,
            processes,
        }
    }

    #[tokio::test]
    async fn list_devices_sorted() {
        let probe = MockGpuProbe::new(vec![dev(2, 1000, vec![]), dev(0, 1000, vec![]), dev(1, 1000, vec![])]);
        assert_eq!(probe.list_devices().await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn foreign_python_processes_filters_by_interpreter() {
        let processes = vec![
            ProcessInfo {
                pid: 100,
                username: "alice".into(),
                used_mb: 500,
                command: "python3 train.py".into(),
            },
            ProcessInfo {
                pid: 101,
                username: "alice".into(),
                used_mb: 500,
                command: "/usr/bin/ffmpeg -i in.mp4".into(),
            },
        ];
        let probe = MockGpuProbe::new(vec![dev(0, 1000, processes)]);
        let foreign = probe.foreign_python_processes(0, "bob").await.unwrap();
        assert_eq!(foreign, vec![100]);
    }

    #[tokio::test]
    async fn snapshot_unknown_device_errors() {
        let probe = MockGpuProbe::new(vec![dev(0, 1000, vec![])]);
        assert!(matches!(
            probe.snapshot(7).await,
            Err(ProbeError::NoSuchDevice(7))
        ));
    }
}
