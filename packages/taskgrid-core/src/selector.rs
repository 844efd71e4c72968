/// Device ranking (component B).
use std::time::Duration;

use tracing::debug;

use crate::model::DeviceId;
use crate::probe::GpuProbe;

const SAMPLE_COUNT: u32 = 30;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub struct GpuSelector<'a> {
    probe: &'a dyn GpuProbe,
    memory_save_mode: bool,
}

#[derive(Debug, Clone, Copy)]
struct ScoredDevice {
    device: DeviceId,
    score: f64,
    tie_breaker: f64,
}

impl<'a> GpuSelector<'a> {
    pub fn new(probe: &'a dyn GpuProbe, memory_save_mode: bool) -> Self {
        Self { probe, memory_save_mode }
    }

    /// Select a single device from `candidates` that currently has at
    /// least `required_memory_gb` free. Returns `None` if nothing
    /// qualifies.
    pub async fn select_one(&self, candidates: &[DeviceId], required_memory_gb: u64) -> Option<DeviceId> {
        let mut eligible = Vec::new();
        for &d in candidates {
            if let Ok(snap) = self.probe.snapshot(d).await {
                if snap.memory_free_gb() >= required_memory_gb as f64 {
                    eligible.push(d);
                }
            }
        }

        match eligible.len() {
            0 => None,
            1 => Some(eligible[0]),
            _ => self.select_by_sampling(&eligible).await,
        }
    }

    /// Run single-device selection `count` times, removing the winner each
    /// round. Returns `None` as soon as a round can no longer possibly
    /// satisfy the remaining device count.
    pub async fn select_many(
        &self,
        candidates: &[DeviceId],
        required_memory_gb: u64,
        count: u32,
    ) -> Option<Vec<DeviceId>> {
        let mut remaining: Vec<DeviceId> = candidates.to_vec();
        let mut chosen = Vec::with_capacity(count as usize);

        for _ in 0..count {
            if (remaining.len() as u32) < count - chosen.len() as u32 {
                return None;
            }
            let winner = self.select_one(&remaining, required_memory_gb).await?;
            remaining.retain(|&d| d != winner);
            chosen.push(winner);
        }

        Some(chosen)
    }

    async fn select_by_sampling(&self, candidates: &[DeviceId]) -> Option<DeviceId> {
        let mut sums: Vec<(DeviceId, f64, f64)> = candidates.iter().map(|&d| (d, 0.0, 0.0)).collect();
        let mut samples_taken = 0u32;

        for i in 0..SAMPLE_COUNT {
            for entry in sums.iter_mut() {
                if let Ok(snap) = self.probe.snapshot(entry.0).await {
                    let (score, tie) = self.score(&snap);
                    entry.1 += score;
                    entry.2 += tie;
                }
            }
            samples_taken += 1;
            if i + 1 < SAMPLE_COUNT {
                tokio::time::sleep(SAMPLE_INTERVAL).await;
            }
        }

        debug!(samples = samples_taken, "sampled candidate devices for selection");

        let averaged: Vec<ScoredDevice> = sums
            .into_iter()
            .map(|(device, score_sum, tie_sum)| ScoredDevice {
                device,
                score: score_sum / SAMPLE_COUNT as f64,
                tie_breaker: tie_sum / SAMPLE_COUNT as f64,
            })
            .collect();

        averaged
            .into_iter()
            .min_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then_with(|| a.tie_breaker.total_cmp(&b.tie_breaker))
                    .then_with(|| a.device.cmp(&b.device))
            })
            .map(|s| s.device)
    }

    fn score(&self, snap: &crate::probe::DeviceSnapshot) -> (f64, f64) {
        if self.memory_save_mode {
            (
                snap.utilization_pct * snap.memory_free_mb as f64,
                snap.memory_free_mb as f64,
            )
        } else {
            (
                snap.utilization_pct * snap.memory_used_mb as f64,
                snap.memory_used_mb as f64,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DeviceSnapshot, MockGpuProbe};
    use proptest::prelude::*;

    fn dev(index: DeviceId, free_mb: u64, util: f64) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            name: format!("mock{index}"),
            temperature_c: 40,
            utilization_pct: util,
            memory_total_mb: 80 * 1024,
            memory_used_mb: 80 * 1024 - free_mb,
            memory_free_mb: free_mb,
            power_draw_w: 50.0,
            power_limit_w: 300.0,
            processes: vec![],
        }
    }

    #[tokio::test]
    async fn single_candidate_returns_immediately_without_sampling() {
        let probe = MockGpuProbe::new(vec![dev(0, 40 * 1024, 90.0)]);
        let selector = GpuSelector::new(&probe, false);
        let chosen = selector.select_one(&[0], 20).await;
        assert_eq!(chosen, Some(0));
    }

    #[tokio::test]
    async fn filters_out_devices_below_required_memory() {
        let probe = MockGpuProbe::new(vec![dev(0, 5 * 1024, 10.0), dev(1, 40 * 1024, 10.0)]);
        let selector = GpuSelector::new(&probe, false);
        let chosen = selector.select_one(&[0, 1], 20).await;
        assert_eq!(chosen, Some(1));
    }

    #[tokio::test]
    async fn returns_none_when_nothing_qualifies() {
        let probe = MockGpuProbe::new(vec![dev(0, 1024, 10.0)]);
        let selector = GpuSelector::new(&probe, false);
        assert_eq!(selector.select_one(&[0], 20).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_save_mode_prefers_consolidating_onto_busy_device() {
        // Device 0: hot but nearly full (low free mem) -> low score in
        // memory_save_mode (util * free). Device 1: idle but spacious ->
        // higher score. memory_save_mode should pick the smaller score,
        // i.e. consolidate onto the device with less free memory.
        let probe = MockGpuProbe::new(vec![dev(0, 10 * 1024, 90.0), dev(1, 70 * 1024, 5.0)]);
        let selector = GpuSelector::new(&probe, true);
        let chosen = selector.select_one(&[0, 1], 5).await;
        assert_eq!(chosen, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn select_many_removes_winner_each_round() {
        let probe = MockGpuProbe::new(vec![dev(0, 40 * 1024, 10.0), dev(1, 40 * 1024, 50.0), dev(2, 40 * 1024, 90.0)]);
        let selector = GpuSelector::new(&probe, false);
        let chosen = selector.select_many(&[0, 1, 2], 10, 2).await.unwrap();
        assert_eq!(chosen.len(), 2);
        assert_ne!(chosen[0], chosen[1]);
    }

    #[tokio::test]
    async fn select_many_none_when_insufficient_candidates() {
        let probe = MockGpuProbe::new(vec![dev(0, 40 * 1024, 10.0)]);
        let selector = GpuSelector::new(&probe, false);
        assert_eq!(selector.select_many(&[0], 10, 2).await, None);
    }

    proptest! {
        /// The instantaneous memory filter (step 1) never returns a device
        /// below the requirement, regardless of how many candidates or
        /// what their free-memory readings are.
        #[test]
        fn select_one_never_returns_a_device_below_required_memory(
            free_mbs in proptest::collection::vec(0u64..100 * 1024, 1..8),
            required_gb in 0u64..100,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let devices: Vec<DeviceSnapshot> = free_mbs
                .iter()
                .enumerate()
                .map(|(i, &free_mb)| dev(i as DeviceId, free_mb, 10.0))
                .collect();
            let candidates: Vec<DeviceId> = (0..devices.len() as DeviceId).collect();
            let probe = MockGpuProbe::new(devices.clone());
            let selector = GpuSelector::new(&probe, false);

            let result = rt.block_on(selector.select_one(&candidates, required_gb));
            if let Some(chosen) = result {
                let snap = devices.iter().find(|d| d.index == chosen).unwrap();
                prop_assert!(snap.memory_free_gb() >= required_gb as f64);
            } else {
                prop_assert!(devices.iter().all(|d| d.memory_free_gb() < required_gb as f64));
            }
        }

        /// `score` is antitone in the opposing mode's numerator: raising a
        /// device's free memory while holding utilization and used memory
        /// fixed can only move `memory_save_mode`'s score up (never down),
        /// since score is a product of two non-negative factors.
        #[test]
        fn memory_save_mode_score_is_monotonic_in_free_memory(
            util in 0.0f64..100.0,
            free_mb_a in 0u64..80 * 1024,
            free_mb_b in 0u64..80 * 1024,
        ) {
            let low = free_mb_a.min(free_mb_b);
            let high = free_mb_a.max(free_mb_b);
            let score_low = util * low as f64;
            let score_high = util * high as f64;
            prop_assert!(score_low <= score_high);
        }
    }
}
