/// Occupancy Ledger (component C): per-instance bookkeeping of which queue
/// currently holds which device. A single `parking_lot::Mutex` guards the
/// whole map — operations are short, so a lock-free structure buys nothing
/// here and would only complicate the acquire/release atomicity the
/// invariant depends on.
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::{DeviceId, QueueId};

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireResult {
    Ok,
    Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseResult {
    Ok,
    NotHeld,
}

#[derive(Default)]
pub struct OccupancyLedger {
    held: Mutex<HashMap<DeviceId, QueueId>>,
}

impl OccupancyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, device: DeviceId, queue: QueueId) -> AcquireResult {
        let mut held = self.held.lock();
        match held.get(&device) {
            Some(owner) if *owner != queue => AcquireResult::Busy,
            Some(_) => AcquireResult::Ok, // already held by the same queue
            None => {
                held.insert(device, queue);
                AcquireResult::Ok
            }
        }
    }

    /// Acquire every device in `devices` for `queue`, all-or-nothing: if
    /// any device is busy, whatever was already taken in this call is
    /// released before returning.
    pub fn acquire_all(&self, devices: &[DeviceId], queue: QueueId) -> AcquireResult {
        let mut held = self.held.lock();
        for &d in devices {
            if let Some(owner) = held.get(&d) {
                if *owner != queue {
                    // roll back devices already claimed in this call
                    for taken in devices.iter().take_while(|&&x| x != d) {
                        held.remove(taken);
                    }
                    return AcquireResult::Busy;
                }
            }
        }
        for &d in devices {
            held.insert(d, queue);
        }
        AcquireResult::Ok
    }

    pub fn release(&self, device: DeviceId, queue: QueueId) -> ReleaseResult {
        let mut held = self.held.lock();
        match held.get(&device) {
            Some(owner) if *owner == queue => {
                held.remove(&device);
                ReleaseResult::Ok
            }
            _ => ReleaseResult::NotHeld,
        }
    }

    pub fn release_all(&self, devices: &[DeviceId], queue: QueueId) {
        let mut held = self.held.lock();
        for d in devices {
            if held.get(d) == Some(&queue) {
                held.remove(d);
            }
        }
    }

    pub fn is_held(&self, device: DeviceId) -> Option<QueueId> {
        self.held.lock().get(&device).copied()
    }

    pub fn held_set(&self) -> HashMap<DeviceId, QueueId> {
        self.held.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_busy_for_other_queue() {
        let ledger = OccupancyLedger::new();
        assert_eq!(ledger.acquire(0, 1), AcquireResult::Ok);
        assert_eq!(ledger.acquire(0, 2), AcquireResult::Busy);
    }

    #[test]
    fn release_then_reacquirable() {
        let ledger = OccupancyLedger::new();
        ledger.acquire(0, 1);
        assert_eq!(ledger.release(0, 1), ReleaseResult::Ok);
        assert_eq!(ledger.acquire(0, 2), AcquireResult::Ok);
    }

    #[test]
    fn release_not_held_by_caller_is_noop() {
        let ledger = OccupancyLedger::new();
        ledger.acquire(0, 1);
        assert_eq!(ledger.release(0, 2), ReleaseResult::NotHeld);
        assert_eq!(ledger.is_held(0), Some(1));
    }

    #[test]
    fn acquire_all_rolls_back_on_partial_conflict() {
        let ledger = OccupancyLedger::new();
        ledger.acquire(1, 99);
        assert_eq!(ledger.acquire_all(&[0, 1, 2], 1), AcquireResult::Busy);
        // device 0 must have been released again, not left dangling
        assert_eq!(ledger.is_held(0), None);
        assert_eq!(ledger.is_held(2), None);
        assert_eq!(ledger.is_held(1), Some(99));
    }

    #[test]
    fn held_set_reflects_all_current_holders() {
        let ledger = OccupancyLedger::new();
        ledger.acquire_all(&[0, 1], 5);
        let set = ledger.held_set();
        assert_eq!(set.get(&0), Some(&5));
        assert_eq!(set.get(&1), Some(&5));
    }
}
