use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type DeviceId = u32;
pub type QueueId = u32;
pub type TaskId = u32;

/// Execution mode: one task uses exactly one device, or N devices via
/// `CUDA_VISIBLE_DEVICES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Single,
    Multi,
}

/// Two integers that govern whether a failing task must pause before its
/// next retry (component D).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retry_before_backoff: u32,
    pub backoff_duration_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_before_backoff: 3,
            backoff_duration_secs: 30,
        }
    }
}

/// How many devices a Scheduler Instance may claim from the probed pool,
/// and the selection policy used while claiming them.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_time_secs: u64,
    pub maximize_utilization: bool,
    pub memory_save_mode: bool,
    pub device_selection: DeviceSelection,
    pub gpu_left: u32,
    pub min_gpu: u32,
    pub max_gpu: u32,
    pub retry_policy: RetryPolicy,
    pub work_dir: PathBuf,
    pub command_file: PathBuf,
}

/// Either an explicit whitelist of devices to compete over, or "probe
/// everything available at startup."
#[derive(Debug, Clone)]
pub enum DeviceSelection {
    Explicit(Vec<DeviceId>),
    UseAll,
}

/// Closed set of states a Task can occupy (§3 Lifecycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

/// One shell-command sequence, scheduled as an indivisible unit within its
/// queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub queue_id: QueueId,
    pub commands: Vec<String>,
    pub memory_gb: u64,
    pub gpu_count: u32,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub held_devices: Vec<DeviceId>,
}

impl Task {
    pub fn new(id: TaskId, queue_id: QueueId, commands: Vec<String>, memory_gb: u64, gpu_count: u32) -> Self {
        Self {
            id,
            queue_id,
            commands,
            memory_gb,
            gpu_count,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            held_devices: Vec::new(),
        }
    }
}

/// Closed set of states a Queue can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// An ordered list of Tasks that execute strictly serially.
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: QueueId,
    pub tasks: Vec<Task>,
    pub state: QueueState,
}

impl Queue {
    pub fn new(id: QueueId, tasks: Vec<Task>) -> Self {
        Self {
            id,
            tasks,
            state: QueueState::Idle,
        }
    }

    pub fn counters(&self) -> QueueCounters {
        let mut c = QueueCounters::default();
        for t in &self.tasks {
            c.total += 1;
            match t.state {
                TaskState::Pending | TaskState::Retrying => c.pending += 1,
                TaskState::Running => c.running += 1,
                TaskState::Completed => c.completed += 1,
                TaskState::Failed => c.failed += 1,
            }
        }
        c
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounters {
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub total: u32,
}

/// Closed set of states a Scheduler Instance can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}
