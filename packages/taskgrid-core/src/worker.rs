/// Per-Queue Worker (component F): drives one queue's tasks strictly in
/// order — acquire device(s), spawn child, wait, classify exit, retry.
///
/// The queue it drives is a `Arc<parking_lot::Mutex<Queue>>` shared with the
/// owning `SchedulerInstance`, not a private copy: the instance's snapshot
/// must be producible "at any time," so every state transition is written
/// through the same lock a snapshot read takes, held only for the duration
/// of that one field update.
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Identity;
use crate::events::{EventBus, SchedEvent};
use crate::ledger::{AcquireResult, OccupancyLedger};
use crate::model::{DeviceId, Mode, Queue, QueueId, QueueState, RetryPolicy, TaskId, TaskState};
use crate::probe::GpuProbe;
use crate::retry;
use crate::selector::GpuSelector;

const CHILD_TIMEOUT: Duration = Duration::from_secs(7200);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// External collaborator contract: a (mode, config_index, queue_id,
/// process_index) -> absolute log file path lookup. The core neither
/// stores nor manages these bindings; `taskgrid-server` owns a real
/// implementation.
#[async_trait]
pub trait LogBinding: Send + Sync {
    async fn resolve(&self, mode: Mode, config_index: u32, queue_id: QueueId, process_index: u32) -> Option<PathBuf>;
}

/// Default binding used when no external resolver is wired up: every
/// command inherits the scheduler process's own stdio.
pub struct NullLogBinding;

#[async_trait]
impl LogBinding for NullLogBinding {
    async fn resolve(&self, _mode: Mode, _config_index: u32, _queue_id: QueueId, _process_index: u32) -> Option<PathBuf> {
        None
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub identity: Identity,
    pub check_time: Duration,
    pub maximize_utilization: bool,
    pub memory_save_mode: bool,
    pub retry_policy: RetryPolicy,
    pub work_dir: PathBuf,
    pub my_username: String,
}

enum TaskOutcome {
    Completed,
    Stopped,
}

enum ExecResult {
    Success,
    Failed(String),
    Stopped,
}

enum WaitOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Stopped,
}

enum SleepOutcome {
    Completed,
    Stopped,
}

impl SleepOutcome {
    fn is_stopped(&self) -> bool {
        matches!(self, SleepOutcome::Stopped)
    }
}

pub struct Worker {
    queue: Arc<Mutex<Queue>>,
    queue_id: QueueId,
    chosen: Vec<DeviceId>,
    probe: Arc<dyn GpuProbe>,
    ledger: Arc<OccupancyLedger>,
    config: WorkerConfig,
    stop: watch::Receiver<bool>,
    events: EventBus,
    log_binding: Arc<dyn LogBinding>,
    mode: Mode,
}

impl Worker {
    pub fn new(
        queue: Arc<Mutex<Queue>>,
        queue_id: QueueId,
        chosen: Vec<DeviceId>,
        probe: Arc<dyn GpuProbe>,
        ledger: Arc<OccupancyLedger>,
        config: WorkerConfig,
        stop: watch::Receiver<bool>,
        events: EventBus,
        log_binding: Arc<dyn LogBinding>,
        mode: Mode,
    ) -> Self {
        Self {
            queue,
            queue_id,
            chosen,
            probe,
            ledger,
            config,
            stop,
            events,
            log_binding,
            mode,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub async fn run(mut self) {
        self.queue.lock().state = QueueState::Running;
        self.publish(SchedEvent::QueueStarted {
            at: Utc::now(),
            mode: self.mode,
            config_index: self.config.identity.config_index,
            queue_id: self.queue_id,
        });

        let len = self.queue.lock().tasks.len();
        let mut idx = 0;
        while idx < len {
            if self.is_stopped() {
                break;
            }
            match self.run_task(idx).await {
                TaskOutcome::Completed => idx += 1,
                TaskOutcome::Stopped => break,
            }
        }

        self.finalize_queue_state();
    }

    fn finalize_queue_state(&mut self) {
        let final_state = {
            let mut q = self.queue.lock();
            let any_failed = q.tasks.iter().any(|t| t.state == TaskState::Failed);
            let all_completed = q.tasks.iter().all(|t| t.state == TaskState::Completed);
            q.state = if any_failed {
                QueueState::Failed
            } else if all_completed {
                QueueState::Completed
            } else {
                q.state
            };
            q.state
        };

        match final_state {
            QueueState::Completed => self.publish(SchedEvent::QueueCompleted {
                at: Utc::now(),
                mode: self.mode,
                config_index: self.config.identity.config_index,
                queue_id: self.queue_id,
            }),
            QueueState::Failed => self.publish(SchedEvent::QueueFailed {
                at: Utc::now(),
                mode: self.mode,
                config_index: self.config.identity.config_index,
                queue_id: self.queue_id,
            }),
            _ => {}
        }
    }

    async fn run_task(&mut self, idx: usize) -> TaskOutcome {
        loop {
            if self.is_stopped() {
                return TaskOutcome::Stopped;
            }

            let (required_memory_gb, gpu_count, task_id) = {
                let q = self.queue.lock();
                (q.tasks[idx].memory_gb, q.tasks[idx].gpu_count, q.tasks[idx].id)
            };

            let devices = match self.admit(required_memory_gb, gpu_count).await {
                Some(d) => d,
                None => return TaskOutcome::Stopped,
            };

            {
                let mut q = self.queue.lock();
                q.tasks[idx].state = TaskState::Running;
                q.tasks[idx].held_devices = devices.clone();
            }
            self.publish(SchedEvent::TaskAdmitted {
                at: Utc::now(),
                mode: self.mode,
                config_index: self.config.identity.config_index,
                queue_id: self.queue_id,
                task_id,
                devices: devices.clone(),
            });

            let result = self.execute(idx, task_id, &devices).await;

            self.ledger.release_all(&devices, self.queue_id);
            for &d in &devices {
                self.publish(SchedEvent::DeviceReleased {
                    at: Utc::now(),
                    mode: self.mode,
                    config_index: self.config.identity.config_index,
                    queue_id: self.queue_id,
                    device: d,
                });
            }
            self.queue.lock().tasks[idx].held_devices.clear();

            match result {
                ExecResult::Success => {
                    self.queue.lock().tasks[idx].state = TaskState::Completed;
                    self.publish(SchedEvent::TaskCompleted {
                        at: Utc::now(),
                        mode: self.mode,
                        config_index: self.config.identity.config_index,
                        queue_id: self.queue_id,
                        task_id,
                    });
                    return TaskOutcome::Completed;
                }
                ExecResult::Stopped => {
                    // A stop is not a failure classification (§7, StopRequested):
                    // the task is left resumable rather than terminal, so a
                    // later restart of the same identity can pick it back up.
                    self.queue.lock().tasks[idx].state = TaskState::Pending;
                    return TaskOutcome::Stopped;
                }
                ExecResult::Failed(err) => {
                    let retry_count = {
                        let mut q = self.queue.lock();
                        let t = &mut q.tasks[idx];
                        t.retry_count += 1;
                        t.last_error = Some(err);
                        t.state = TaskState::Retrying;
                        t.retry_count
                    };

                    self.publish(SchedEvent::TaskRetrying {
                        at: Utc::now(),
                        mode: self.mode,
                        config_index: self.config.identity.config_index,
                        queue_id: self.queue_id,
                        task_id,
                        retry_count,
                    });

                    let (backoff, secs) = retry::should_backoff(retry_count, &self.config.retry_policy);
                    if backoff {
                        warn!(task_id, retry_count, secs, "backing off before next retry");
                        if self.sleep_or_stop(Duration::from_secs(secs)).await.is_stopped() {
                            self.queue.lock().tasks[idx].state = TaskState::Pending;
                            return TaskOutcome::Stopped;
                        }
                    }
                    self.queue.lock().tasks[idx].state = TaskState::Pending;
                }
            }
        }
    }

    async fn admit(&mut self, required_memory_gb: u64, gpu_count: u32) -> Option<Vec<DeviceId>> {
        let count = match self.mode {
            Mode::Single => 1,
            Mode::Multi => gpu_count,
        };

        loop {
            if self.is_stopped() {
                return None;
            }

            let held = self.ledger.held_set();
            let internally_available: Vec<DeviceId> = if self.config.maximize_utilization {
                self.chosen.clone()
            } else {
                self.chosen.iter().copied().filter(|d| !held.contains_key(d)).collect()
            };

            let mut candidates = Vec::new();
            for &d in &internally_available {
                let snap = match self.probe.snapshot(d).await {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if snap.memory_free_gb() < required_memory_gb as f64 {
                    continue;
                }
                if !self.config.maximize_utilization {
                    match self.probe.foreign_python_processes(d, &self.config.my_username).await {
                        Ok(foreign) if foreign.is_empty() => {}
                        _ => continue,
                    }
                }
                candidates.push(d);
            }

            let selector = GpuSelector::new(self.probe.as_ref(), self.config.memory_save_mode);
            let selected = if count == 1 {
                selector.select_one(&candidates, required_memory_gb).await.map(|d| vec![d])
            } else {
                selector.select_many(&candidates, required_memory_gb, count).await
            };

            if let Some(devices) = selected {
                if self.ledger.acquire_all(&devices, self.queue_id) == AcquireResult::Ok {
                    for &d in &devices {
                        self.publish(SchedEvent::DeviceAcquired {
                            at: Utc::now(),
                            mode: self.mode,
                            config_index: self.config.identity.config_index,
                            queue_id: self.queue_id,
                            device: d,
                        });
                    }
                    return Some(devices);
                }
                // a sibling worker raced us between select and acquire; retry.
            }

            if self.sleep_or_stop(self.config.check_time).await.is_stopped() {
                return None;
            }
        }
    }

    async fn sleep_or_stop(&mut self, dur: Duration) -> SleepOutcome {
        if *self.stop.borrow() {
            return SleepOutcome::Stopped;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => SleepOutcome::Completed,
            _ = self.stop.changed() => SleepOutcome::Stopped,
        }
    }

    async fn execute(&mut self, idx: usize, task_id: TaskId, devices: &[DeviceId]) -> ExecResult {
        let commands = self.queue.lock().tasks[idx].commands.clone();
        let cuda_visible = devices.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");

        for (process_index, command_tmpl) in commands.iter().enumerate() {
            if self.is_stopped() {
                return ExecResult::Stopped;
            }

            let command = command_tmpl.replace("{work_dir}", &self.config.work_dir.display().to_string());

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&command);
            cmd.env("CUDA_VISIBLE_DEVICES", &cuda_visible);
            cmd.stdin(Stdio::null());

            let log_path = self
                .log_binding
                .resolve(self.mode, self.config.identity.config_index, self.queue_id, process_index as u32)
                .await;

            let log_file = log_path
                .as_ref()
                .and_then(|p| std::fs::OpenOptions::new().create(true).append(true).open(p).ok());
            match log_file {
                Some(file) => match file.try_clone() {
                    Ok(stderr_file) => {
                        cmd.stdout(Stdio::from(file));
                        cmd.stderr(Stdio::from(stderr_file));
                    }
                    Err(e) => return ExecResult::Failed(format!("could not clone log file handle for stderr: {e}")),
                },
                None => {
                    cmd.stdout(Stdio::inherit());
                    cmd.stderr(Stdio::inherit());
                }
            }

            #[cfg(unix)]
            unsafe {
                use std::os::unix::process::CommandExt;
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }

            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => return ExecResult::Failed(format!("spawn failed: {e}")),
            };
            let pid = child.id().map(|p| p as i32).unwrap_or(0);

            info!(task_id, process_index, pid, "spawned command");

            let outcome = tokio::select! {
                status = child.wait() => WaitOutcome::Exited(status),
                _ = tokio::time::sleep(CHILD_TIMEOUT) => WaitOutcome::TimedOut,
                _ = self.stop.changed() => WaitOutcome::Stopped,
            };

            match outcome {
                WaitOutcome::Exited(Ok(status)) if status.success() => continue,
                WaitOutcome::Exited(Ok(status)) => {
                    return ExecResult::Failed(format!("process_index {process_index} exited with {status}"))
                }
                WaitOutcome::Exited(Err(e)) => return ExecResult::Failed(format!("wait failed: {e}")),
                WaitOutcome::TimedOut => {
                    kill_child(&mut child, pid).await;
                    return ExecResult::Failed(format!("process_index {process_index} exceeded {CHILD_TIMEOUT:?} timeout"));
                }
                WaitOutcome::Stopped => {
                    kill_child(&mut child, pid).await;
                    return ExecResult::Stopped;
                }
            }
        }

        ExecResult::Success
    }

    fn publish(&self, event: SchedEvent) {
        self.events.publish(event);
    }
}

#[cfg(unix)]
async fn kill_child(child: &mut Child, pid: i32) {
    if pid == 0 {
        let _ = child.kill().await;
        let _ = child.wait().await;
        return;
    }
    // SAFETY: pid came from a just-spawned child placed in its own
    // session/process group via setsid; signalling -pid targets the group.
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
    tokio::select! {
        _ = child.wait() => return,
        _ = tokio::time::sleep(KILL_GRACE) => {}
    }
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_child(child: &mut Child, _pid: i32) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
