/// Scheduler Instance (component G): owns one `SchedulerConfig`, fans out
/// one Per-Queue Worker per queue, and answers snapshot/stop requests.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::error::{Identity, Result, SchedulerError};
use crate::events::{EventBus, SchedEvent};
use crate::ledger::OccupancyLedger;
use crate::model::{
    DeviceId, DeviceSelection, Mode, Queue, QueueCounters, QueueId, QueueState, SchedulerConfig, Task, TaskId, TaskState,
};
use crate::probe::GpuProbe;
use crate::worker::{LogBinding, Worker, WorkerConfig};

pub use crate::model::InstanceState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub memory_gb: u64,
    pub gpu_count: u32,
    pub current_devices: Vec<DeviceId>,
    pub retry_count: u32,
    pub commands: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub id: QueueId,
    pub state: QueueState,
    pub counters: QueueCounters,
    pub processes: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub pid: u32,
    pub mode: Mode,
    pub config_index: u32,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub chosen_devices: Vec<DeviceId>,
    pub ledger_held: HashMap<DeviceId, QueueId>,
    pub pending_tasks: u32,
    pub running_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_tasks: u32,
    pub per_queue: Vec<QueueSnapshot>,
    pub last_error: Option<String>,
}

/// From the probed device list, apply the whitelist-or-all selection, then
/// compute `chosen = first K devices` (component E, construction step 1).
/// `K = clamp(min(max_gpu, max(min_gpu, probed - gpu_left)), 1, probed)`.
fn compute_chosen(probed: &[DeviceId], gpu_left: u32, min_gpu: u32, max_gpu: u32) -> Vec<DeviceId> {
    let probed_count = probed.len() as u32;
    if probed_count == 0 {
        return Vec::new();
    }
    let k = std::cmp::min(max_gpu, std::cmp::max(min_gpu, probed_count.saturating_sub(gpu_left))).clamp(1, probed_count);
    probed[..k as usize].to_vec()
}

async fn probed_pool(probe: &dyn GpuProbe, selection: &DeviceSelection) -> std::result::Result<Vec<DeviceId>, String> {
    let mut all = probe.list_devices().await.map_err(|e| e.to_string())?;
    all.sort_unstable();
    match selection {
        DeviceSelection::UseAll => Ok(all),
        DeviceSelection::Explicit(ids) => {
            let available: std::collections::HashSet<DeviceId> = all.into_iter().collect();
            let mut filtered: Vec<DeviceId> = ids.iter().copied().filter(|d| available.contains(d)).collect();
            filtered.sort_unstable();
            Ok(filtered)
        }
    }
}

pub struct SchedulerInstance {
    identity: Identity,
    pid: u32,
    probe: Arc<dyn GpuProbe>,
    events: EventBus,
    config: SchedulerConfig,
    started_at: DateTime<Utc>,
    chosen: Vec<DeviceId>,
    ledger: Arc<OccupancyLedger>,
    queues: HashMap<QueueId, Arc<Mutex<Queue>>>,
    order: Vec<QueueId>,
    state: Mutex<InstanceState>,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    last_error: Mutex<Option<String>>,
}

impl SchedulerInstance {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedEvent> {
        self.events.subscribe()
    }

    /// Start sequence (§4.G): probe, size the chosen set, parse the command
    /// file, build queues, launch one worker per queue.
    pub async fn start(
        identity: Identity,
        config: SchedulerConfig,
        probe: Arc<dyn GpuProbe>,
        log_binding: Arc<dyn LogBinding>,
        my_username: String,
    ) -> Result<Arc<Self>> {
        let events = EventBus::new();
        let started_at = Utc::now();
        events.publish(SchedEvent::InstanceStarting {
            at: started_at,
            mode: identity.mode,
            config_index: identity.config_index,
        });

        let probed = match probed_pool(probe.as_ref(), &config.device_selection).await {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => {
                let reason = "no GPU devices probed".to_string();
                events.publish(SchedEvent::InstanceFailed {
                    at: Utc::now(),
                    mode: identity.mode,
                    config_index: identity.config_index,
                    reason: reason.clone(),
                });
                return Err(SchedulerError::ProbeUnavailable(reason));
            }
            Err(e) => {
                events.publish(SchedEvent::InstanceFailed {
                    at: Utc::now(),
                    mode: identity.mode,
                    config_index: identity.config_index,
                    reason: e.clone(),
                });
                return Err(SchedulerError::ProbeUnavailable(e));
            }
        };

        let chosen = compute_chosen(&probed, config.gpu_left, config.min_gpu, config.max_gpu);

        let file_contents = std::fs::read_to_string(&config.command_file)?;
        let parsed = crate::parser::parse(&file_contents, identity.mode).map_err(|e| {
            events.publish(SchedEvent::InstanceFailed {
                at: Utc::now(),
                mode: identity.mode,
                config_index: identity.config_index,
                reason: e.to_string(),
            });
            SchedulerError::MalformedCommandFile(e)
        })?;

        let mut order: Vec<QueueId> = Vec::new();
        let mut grouped: HashMap<QueueId, Vec<Task>> = HashMap::new();
        let mut next_task_id: TaskId = 1;
        for p in parsed {
            grouped.entry(p.queue_id).or_insert_with(|| {
                order.push(p.queue_id);
                Vec::new()
            });
            let gpu_count = p.gpu_count.unwrap_or(1);
            let task = Task::new(next_task_id, p.queue_id, p.commands, p.memory_gb, gpu_count);
            next_task_id += 1;
            grouped.get_mut(&p.queue_id).unwrap().push(task);
        }

        let mut queues = HashMap::with_capacity(order.len());
        for &qid in &order {
            let tasks = grouped.remove(&qid).unwrap_or_default();
            queues.insert(qid, Arc::new(Mutex::new(Queue::new(qid, tasks))));
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        let instance = Arc::new(Self {
            identity,
            pid: std::process::id(),
            probe,
            events,
            config,
            started_at,
            chosen,
            ledger: Arc::new(OccupancyLedger::new()),
            queues,
            order,
            state: Mutex::new(InstanceState::Starting),
            stop_tx,
            handles: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        });

        *instance.state.lock() = InstanceState::Running;
        instance.events.publish(SchedEvent::InstanceRunning {
            at: Utc::now(),
            mode: identity.mode,
            config_index: identity.config_index,
        });

        let mut handles = Vec::with_capacity(instance.order.len());
        for &qid in &instance.order {
            let queue = instance.queues[&qid].clone();
            let worker_config = WorkerConfig {
                identity,
                check_time: Duration::from_secs(instance.config.check_time_secs),
                maximize_utilization: instance.config.maximize_utilization,
                memory_save_mode: instance.config.memory_save_mode,
                retry_policy: instance.config.retry_policy,
                work_dir: instance.config.work_dir.clone(),
                my_username: my_username.clone(),
            };
            let worker = Worker::new(
                queue,
                qid,
                instance.chosen.clone(),
                instance.probe.clone(),
                instance.ledger.clone(),
                worker_config,
                stop_rx.clone(),
                instance.events.clone(),
                log_binding.clone(),
                identity.mode,
            );
            let span = info_span!("queue_worker", mode = ?identity.mode, config_index = identity.config_index, queue_id = qid);
            let inst = instance.clone();
            handles.push(tokio::spawn(
                async move {
                    worker.run().await;
                    inst.on_worker_finished();
                }
                .instrument(span),
            ));
        }
        *instance.handles.lock() = handles;

        Ok(instance)
    }

    /// Called as each worker's `run()` returns. Finalizes the instance once
    /// every queue has reached a terminal state — the organic completion
    /// path. `stop()` finalizes unconditionally instead, since a
    /// stop-interrupted queue may never reach `Completed`/`Failed` on its
    /// own (it stays in its last state per §4.F queue-termination clause b).
    fn on_worker_finished(&self) {
        self.finalize(false);
    }

    fn finalize(&self, force: bool) {
        let all_terminal = self
            .order
            .iter()
            .all(|qid| matches!(self.queues[qid].lock().state, QueueState::Completed | QueueState::Failed));
        if !force && !all_terminal {
            return;
        }

        let mut state = self.state.lock();
        if matches!(*state, InstanceState::Completed | InstanceState::Failed) {
            return;
        }

        let any_failed = self
            .order
            .iter()
            .any(|qid| self.queues[qid].lock().state == QueueState::Failed);
        *state = if any_failed { InstanceState::Failed } else { InstanceState::Completed };
        let final_state = *state;
        drop(state);

        match final_state {
            InstanceState::Completed => {
                info!(mode = ?self.identity.mode, config_index = self.identity.config_index, "scheduler instance completed");
                self.events.publish(SchedEvent::InstanceCompleted {
                    at: Utc::now(),
                    mode: self.identity.mode,
                    config_index: self.identity.config_index,
                });
            }
            InstanceState::Failed => {
                let reason = "one or more queues failed".to_string();
                *self.last_error.lock() = Some(reason.clone());
                error!(mode = ?self.identity.mode, config_index = self.identity.config_index, "scheduler instance failed");
                self.events.publish(SchedEvent::InstanceFailed {
                    at: Utc::now(),
                    mode: self.identity.mode,
                    config_index: self.identity.config_index,
                    reason,
                });
            }
            _ => {}
        }
    }

    /// Asynchronous stop request (§4.G, §5 cancellation semantics): signals
    /// every worker and waits for them to unwind before returning.
    pub async fn stop(&self) {
        if matches!(*self.state.lock(), InstanceState::Completed | InstanceState::Failed) {
            return;
        }
        *self.state.lock() = InstanceState::Stopping;
        self.events.publish(SchedEvent::InstanceStopping {
            at: Utc::now(),
            mode: self.identity.mode,
            config_index: self.identity.config_index,
        });
        let _ = self.stop_tx.send(true);

        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.await;
        }

        // Every worker has unwound. A queue a stop interrupted mid-task may
        // not be terminal (it stays in its last state), so finalize
        // unconditionally rather than waiting for `on_worker_finished`'s
        // all-terminal check, which would otherwise leave the instance
        // stuck in `Stopping` forever.
        self.finalize(true);
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let mut per_queue = Vec::with_capacity(self.order.len());
        let mut pending = 0;
        let mut running = 0;
        let mut completed = 0;
        let mut failed = 0;
        let mut total = 0;

        for &qid in &self.order {
            let q = self.queues[&qid].lock();
            let counters = q.counters();
            pending += counters.pending;
            running += counters.running;
            completed += counters.completed;
            failed += counters.failed;
            total += counters.total;

            let processes = q
                .tasks
                .iter()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    state: t.state,
                    memory_gb: t.memory_gb,
                    gpu_count: t.gpu_count,
                    current_devices: t.held_devices.clone(),
                    retry_count: t.retry_count,
                    commands: t.commands.clone(),
                    last_error: t.last_error.clone(),
                })
                .collect();

            per_queue.push(QueueSnapshot {
                id: qid,
                state: q.state,
                counters,
                processes,
            });
        }

        InstanceSnapshot {
            pid: self.pid,
            mode: self.identity.mode,
            config_index: self.identity.config_index,
            state: *self.state.lock(),
            started_at: self.started_at,
            chosen_devices: self.chosen.clone(),
            ledger_held: self.ledger.held_set(),
            pending_tasks: pending,
            running_tasks: running,
            completed_tasks: completed,
            failed_tasks: failed,
            total_tasks: total,
            per_queue,
            last_error: self.last_error.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceSelection, RetryPolicy};
    use crate::probe::{DeviceSnapshot, MockGpuProbe};
    use crate::worker::NullLogBinding;
    use std::io::Write;

    fn dev(index: DeviceId) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            name: format!("mock{index}"),
            temperature_c: 40,
            utilization_pct: 5.0,
            memory_total_mb: 80 * 1024,
            memory_used_mb: 1024,
            memory_free_mb: 79 * 1024,
            power_draw_w: 50.0,
            power_limit_w: 300.0,
            processes: vec![],
        }
    }

    fn write_command_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    fn base_config(command_file: std::path::PathBuf) -> SchedulerConfig {
        SchedulerConfig {
            check_time_secs: 0,
            maximize_utilization: false,
            memory_save_mode: false,
            device_selection: DeviceSelection::UseAll,
            gpu_left: 0,
            min_gpu: 1,
            max_gpu: 4,
            retry_policy: RetryPolicy {
                max_retry_before_backoff: 3,
                backoff_duration_secs: 0,
            },
            work_dir: std::path::PathBuf::from("/tmp"),
            command_file,
        }
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_snapshot_reflects_it() {
        let file = write_command_file("1\ntrue\n1\n");
        let probe = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let identity = Identity {
            mode: Mode::Single,
            config_index: 0,
        };

        let instance = SchedulerInstance::start(
            identity,
            base_config(file.path().to_path_buf()),
            probe,
            Arc::new(NullLogBinding),
            "tester".to_string(),
        )
        .await
        .unwrap();

        for _ in 0..50 {
            if matches!(instance.snapshot().state, InstanceState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let snap = instance.snapshot();
        assert_eq!(snap.state, InstanceState::Completed);
        assert_eq!(snap.completed_tasks, 1);
        assert_eq!(snap.chosen_devices, vec![0]);
    }

    #[tokio::test]
    async fn start_fails_fast_when_no_devices_are_probed() {
        let file = write_command_file("1\ntrue\n1\n");
        let probe = Arc::new(MockGpuProbe::new(vec![]));
        let identity = Identity {
            mode: Mode::Single,
            config_index: 1,
        };

        let err = SchedulerInstance::start(
            identity,
            base_config(file.path().to_path_buf()),
            probe,
            Arc::new(NullLogBinding),
            "tester".to_string(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SchedulerError::ProbeUnavailable(_)));
    }

    #[tokio::test]
    async fn start_fails_fast_on_malformed_command_file() {
        let file = write_command_file("not-an-int\ntrue\n1\n");
        let probe = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let identity = Identity {
            mode: Mode::Single,
            config_index: 2,
        };

        let err = SchedulerInstance::start(
            identity,
            base_config(file.path().to_path_buf()),
            probe,
            Arc::new(NullLogBinding),
            "tester".to_string(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SchedulerError::MalformedCommandFile(_)));
    }

    #[tokio::test]
    async fn stop_mid_run_halts_promptly() {
        let file = write_command_file("1\nsleep 5\n1\n");
        let probe = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let identity = Identity {
            mode: Mode::Single,
            config_index: 3,
        };

        let instance = SchedulerInstance::start(
            identity,
            base_config(file.path().to_path_buf()),
            probe,
            Arc::new(NullLogBinding),
            "tester".to_string(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), instance.stop()).await;
        assert!(stopped.is_ok(), "stop must return promptly rather than waiting out the sleep");

        // S5: a task interrupted by stop is never classified as failed, so
        // the instance settles on `completed`, not `failed`.
        let snap = instance.snapshot();
        assert_eq!(snap.state, InstanceState::Completed);
        assert_eq!(snap.failed_tasks, 0);
    }

    #[test]
    fn compute_chosen_prefers_low_numbered_devices() {
        let probed = vec![0, 1, 2, 3, 4];
        assert_eq!(compute_chosen(&probed, 1, 1, 8), vec![0, 1, 2, 3]);
        assert_eq!(compute_chosen(&probed, 0, 1, 2), vec![0, 1]);
        assert_eq!(compute_chosen(&[], 0, 1, 2), Vec::<DeviceId>::new());
    }
}
