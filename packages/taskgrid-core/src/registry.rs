/// Scheduler Registry (component H): a process-wide table of live
/// Scheduler Instances keyed by (mode, config_index). At most one live
/// instance per identity.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Identity, Result, SchedulerError};
use crate::instance::{InstanceSnapshot, SchedulerInstance};
use crate::model::SchedulerConfig;
use crate::probe::GpuProbe;
use crate::worker::LogBinding;

pub struct SchedulerRegistry {
    instances: Mutex<HashMap<Identity, Arc<SchedulerInstance>>>,
    probe: Arc<dyn GpuProbe>,
    log_binding: Arc<dyn LogBinding>,
    my_username: String,
}

impl SchedulerRegistry {
    pub fn new(probe: Arc<dyn GpuProbe>, log_binding: Arc<dyn LogBinding>, my_username: String) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            probe,
            log_binding,
            my_username,
        }
    }

    /// Refuses to start a second instance for an identity still live.
    pub async fn start(&self, identity: Identity, config: SchedulerConfig) -> Result<u32> {
        if self.instances.lock().contains_key(&identity) {
            return Err(SchedulerError::RegistryBusy(identity));
        }

        let instance =
            SchedulerInstance::start(identity, config, self.probe.clone(), self.log_binding.clone(), self.my_username.clone())
                .await?;
        let pid = instance.pid();

        // re-check under the lock: two concurrent starts for the same
        // identity could both pass the check above before either inserts.
        let mut instances = self.instances.lock();
        if instances.contains_key(&identity) {
            drop(instances);
            instance.stop().await;
            return Err(SchedulerError::RegistryBusy(identity));
        }
        instances.insert(identity, instance);
        Ok(pid)
    }

    pub async fn stop(&self, identity: Identity) -> Result<()> {
        let instance = self.instances.lock().get(&identity).cloned();
        match instance {
            Some(inst) => {
                inst.stop().await;
                self.instances.lock().remove(&identity);
                Ok(())
            }
            None => Err(SchedulerError::NotFound(identity)),
        }
    }

    pub async fn stop_by_pid(&self, pid: u32) -> Result<()> {
        let identity = self
            .instances
            .lock()
            .values()
            .find(|i| i.pid() == pid)
            .map(|i| i.identity());
        match identity {
            Some(id) => self.stop(id).await,
            None => Err(SchedulerError::NoSuchPid(pid)),
        }
    }

    pub fn list(&self) -> Vec<InstanceSnapshot> {
        self.instances.lock().values().map(|i| i.snapshot()).collect()
    }

    pub fn get(&self, identity: Identity) -> Option<InstanceSnapshot> {
        self.instances.lock().get(&identity).map(|i| i.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceSelection, Mode, RetryPolicy};
    use crate::probe::{DeviceSnapshot, MockGpuProbe};
    use crate::worker::NullLogBinding;
    use std::io::Write;
    use std::time::Duration;

    fn dev(index: crate::model::DeviceId) -> DeviceSnapshot {
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

    fn config(command_file: std::path::PathBuf) -> SchedulerConfig {
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
    async fn second_start_for_same_identity_is_rejected() {
        let file = write_command_file("1\nsleep 5\n1\n");
        let probe: Arc<dyn GpuProbe> = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let registry = SchedulerRegistry::new(probe, Arc::new(NullLogBinding), "tester".to_string());
        let identity = Identity {
            mode: Mode::Single,
            config_index: 0,
        };

        registry.start(identity, config(file.path().to_path_buf())).await.unwrap();
        let err = registry.start(identity, config(file.path().to_path_buf())).await.unwrap_err();
        assert!(matches!(err, SchedulerError::RegistryBusy(_)));

        registry.stop(identity).await.unwrap();
    }

    #[tokio::test]
    async fn stop_of_unknown_identity_errors() {
        let probe: Arc<dyn GpuProbe> = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let registry = SchedulerRegistry::new(probe, Arc::new(NullLogBinding), "tester".to_string());
        let err = registry
            .stop(Identity {
                mode: Mode::Multi,
                config_index: 9,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_and_get_reflect_started_instances() {
        let file = write_command_file("1\ntrue\n1\n");
        let probe: Arc<dyn GpuProbe> = Arc::new(MockGpuProbe::new(vec![dev(0)]));
        let registry = SchedulerRegistry::new(probe, Arc::new(NullLogBinding), "tester".to_string());
        let identity = Identity {
            mode: Mode::Single,
            config_index: 5,
        };

        registry.start(identity, config(file.path().to_path_buf())).await.unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get(identity).is_some());
        assert!(registry
            .get(Identity {
                mode: Mode::Single,
                config_index: 6
            })
            .is_none());

        // let the instance settle before the temp file is dropped
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = registry.stop(identity).await;
    }
}
