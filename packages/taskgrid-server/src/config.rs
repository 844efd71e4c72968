/// YAML-like configuration loading and validation (§6). Keys are parsed
/// into `RawSchedulerConfig`, then validated into the domain
/// `SchedulerConfig` — this is where the sizing-formula Open Question
/// surfaces as a rejected or flagged configuration rather than a silently
/// picked interpretation.
use std::path::{Path, PathBuf};

use serde::Deserialize;
use taskgrid_core::error::SchedulerError;
use taskgrid_core::model::{DeviceSelection, Mode, RetryPolicy, SchedulerConfig};

#[derive(Debug, Deserialize, Default)]
pub struct RawRetryConfig {
    #[serde(default = "default_max_retry")]
    pub max_retry_before_backoff: u32,
    #[serde(default = "default_backoff")]
    pub backoff_duration: u64,
}

fn default_check_time() -> u64 {
    5
}
fn default_min_gpu() -> u32 {
    1
}
fn default_max_gpu() -> u32 {
    1
}
fn default_max_retry() -> u32 {
    3
}
fn default_backoff() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct RawSchedulerConfig {
    #[serde(default = "default_check_time")]
    pub check_time: u64,
    #[serde(default)]
    pub maximize_resource_utilization: bool,
    #[serde(default)]
    pub memory_save_mode: bool,
    #[serde(default)]
    pub compete_gpus: Option<Vec<u32>>,
    #[serde(default)]
    pub use_all_gpus: bool,
    #[serde(default)]
    pub gpu_left: u32,
    #[serde(default = "default_min_gpu")]
    pub min_gpu: u32,
    #[serde(default = "default_max_gpu")]
    pub max_gpu: u32,
    #[serde(default)]
    pub retry_config: RawRetryConfig,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    pub gpu_command_file: Option<PathBuf>,
    pub gpus_command_file: Option<PathBuf>,
}

/// Validate a raw config into the domain type for the given mode.
///
/// **Decision** (sizing Open Question): rejects `min_gpu > max_gpu` as
/// `ConfigInvalid` rather than silently clamping; warns when `min_gpu ==
/// max_gpu`, since in that case `gpu_left` has no effect on the chosen
/// device count regardless of which sizing formula an implementer assumed.
pub fn validate(raw: RawSchedulerConfig, mode: Mode) -> Result<SchedulerConfig, SchedulerError> {
    if raw.min_gpu > raw.max_gpu {
        return Err(SchedulerError::ConfigInvalid(format!(
            "min_gpu ({}) must not exceed max_gpu ({})",
            raw.min_gpu, raw.max_gpu
        )));
    }
    if raw.min_gpu == raw.max_gpu {
        tracing::warn!(
            min_gpu = raw.min_gpu,
            max_gpu = raw.max_gpu,
            "min_gpu == max_gpu: gpu_left has no effect on the chosen device count"
        );
    }

    let command_file = match mode {
        Mode::Single => raw.gpu_command_file.clone(),
        Mode::Multi => raw.gpus_command_file.clone(),
    }
    .ok_or_else(|| SchedulerError::ConfigInvalid(format!("no command file configured for {mode:?} mode")))?;

    let device_selection = if raw.use_all_gpus {
        DeviceSelection::UseAll
    } else {
        match raw.compete_gpus {
            Some(ids) if !ids.is_empty() => DeviceSelection::Explicit(ids),
            _ => DeviceSelection::UseAll,
        }
    };

    let work_dir = raw
        .work_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    Ok(SchedulerConfig {
        check_time_secs: raw.check_time,
        maximize_utilization: raw.maximize_resource_utilization,
        memory_save_mode: raw.memory_save_mode,
        device_selection,
        gpu_left: raw.gpu_left,
        min_gpu: raw.min_gpu,
        max_gpu: raw.max_gpu,
        retry_policy: RetryPolicy {
            max_retry_before_backoff: raw.retry_config.max_retry_before_backoff,
            backoff_duration_secs: raw.retry_config.backoff_duration,
        },
        work_dir,
        command_file,
    })
}

pub fn load_from_yaml(path: &Path, mode: Mode) -> anyhow::Result<SchedulerConfig> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawSchedulerConfig = serde_yaml::from_str(&text)?;
    Ok(validate(raw, mode)?)
}
