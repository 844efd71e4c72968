/// Structured observability events: one broadcast channel per
/// `SchedulerInstance`, kept in-process — there is no remote event-storage
/// server in scope here.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{DeviceId, Mode, QueueId, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedEvent {
    InstanceStarting {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
    },
    InstanceRunning {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
    },
    InstanceCompleted {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
    },
    InstanceFailed {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        reason: String,
    },
    InstanceStopping {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
    },
    QueueStarted {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
    },
    QueueCompleted {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
    },
    QueueFailed {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
    },
    TaskAdmitted {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        task_id: TaskId,
        devices: Vec<DeviceId>,
    },
    TaskCompleted {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        task_id: TaskId,
    },
    TaskRetrying {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        task_id: TaskId,
        retry_count: u32,
    },
    TaskFailed {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        task_id: TaskId,
        reason: String,
    },
    DeviceAcquired {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        device: DeviceId,
    },
    DeviceReleased {
        at: DateTime<Utc>,
        mode: Mode,
        config_index: u32,
        queue_id: QueueId,
        device: DeviceId,
    },
}

impl SchedEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SchedEvent::InstanceStarting { at, .. }
            | SchedEvent::InstanceRunning { at, .. }
            | SchedEvent::InstanceCompleted { at, .. }
            | SchedEvent::InstanceFailed { at, .. }
            | SchedEvent::InstanceStopping { at, .. }
            | SchedEvent::QueueStarted { at, .. }
            | SchedEvent::QueueCompleted { at, .. }
            | SchedEvent::QueueFailed { at, .. }
            | SchedEvent::TaskAdmitted { at, .. }
            | SchedEvent::TaskCompleted { at, .. }
            | SchedEvent::TaskRetrying { at, .. }
            | SchedEvent::TaskFailed { at, .. }
            | SchedEvent::DeviceAcquired { at, .. }
            | SchedEvent::DeviceReleased { at, .. } => *at,
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

/// Owned by a `SchedulerInstance`; cheap to clone, many subscribers can
/// independently drain it (a structured log sink, future metrics, the
/// server's log-tail/SSE endpoints).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedEvent> {
        self.tx.subscribe()
    }

    /// Dropped silently if nobody is listening — observability is best
    /// effort and must never block or fail scheduling.
    pub fn publish(&self, event: SchedEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SchedEvent::InstanceStarting {
            at: Utc::now(),
            mode: Mode::Single,
            config_index: 0,
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, SchedEvent::InstanceStarting { config_index: 0, .. }));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(SchedEvent::InstanceRunning {
            at: Utc::now(),
            mode: Mode::Multi,
            config_index: 3,
        });
    }
}
