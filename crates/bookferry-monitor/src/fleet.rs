//! Fleet sizing from disk pressure.
//!
//! The scaling knob is the number of worker processes. Decisions follow a
//! fixed fallback rule whenever the oracle is disabled or noncommittal:
//! saturation plus a stuck worker scales down, an idle device scales up
//! toward the target, and every action respects its cooldown.

use std::time::{Duration, Instant};

use tracing::info;

use crate::diskio::DiskPressure;

/// Bounds and cooldowns for fleet scaling.
#[derive(Debug, Clone, Copy)]
pub struct FleetPolicy {
    pub min_workers: usize,
    pub target_workers: usize,
    pub max_workers: usize,
    pub scale_down_cooldown: Duration,
    pub scale_up_cooldown: Duration,
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            target_workers: 4,
            max_workers: 8,
            scale_down_cooldown: Duration::from_secs(5 * 60),
            scale_up_cooldown: Duration::from_secs(10 * 60),
        }
    }
}

/// A scaling decision for the supervisor to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Kill the worker owning this shard (always the highest shard id).
    Down { shard_id: u32 },
    /// Start a new worker at this shard id.
    Up { shard_id: u32 },
}

/// Cooldown bookkeeping between ticks.
#[derive(Debug, Default)]
pub struct FleetState {
    last_scale_down: Option<Instant>,
    last_scale_up: Option<Instant>,
}

impl FleetState {
    /// Decide one action for this tick, or none. `live_shards` are the shard
    /// ids with a running worker process; `any_stuck` reflects Step A.
    pub fn decide(
        &mut self,
        policy: &FleetPolicy,
        pressure: Option<&DiskPressure>,
        live_shards: &[u32],
        shard_count: u32,
        any_stuck: bool,
        now: Instant,
    ) -> Option<ScaleAction> {
        let Some(pressure) = pressure else {
            // Unknown utilization: neither direction is justified.
            return None;
        };
        let count = live_shards.len();

        if pressure.saturated() && any_stuck && count > policy.min_workers {
            let cooling = self
                .last_scale_down
                .is_some_and(|at| now.duration_since(at) < policy.scale_down_cooldown);
            if cooling {
                return None;
            }
            let victim = live_shards.iter().copied().max()?;
            self.last_scale_down = Some(now);
            info!(
                percent = pressure.percent,
                victim, "disk saturated with stuck worker; scaling down"
            );
            return Some(ScaleAction::Down { shard_id: victim });
        }

        if pressure.idle() && count < policy.target_workers && count < policy.max_workers {
            let cooling = self
                .last_scale_up
                .is_some_and(|at| now.duration_since(at) < policy.scale_up_cooldown);
            if cooling {
                return None;
            }
            let next = next_free_shard(live_shards, shard_count)?;
            self.last_scale_up = Some(now);
            info!(percent = pressure.percent, shard_id = next, "disk idle; scaling up");
            return Some(ScaleAction::Up { shard_id: next });
        }

        None
    }
}

fn next_free_shard(live_shards: &[u32], shard_count: u32) -> Option<u32> {
    (0..shard_count).find(|candidate| !live_shards.contains(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure(percent: f32) -> DiskPressure {
        DiskPressure {
            device: "sda".to_string(),
            percent,
        }
    }

    fn policy() -> FleetPolicy {
        FleetPolicy::default()
    }

    #[test]
    fn saturation_with_stuck_worker_kills_highest_shard() {
        let mut state = FleetState::default();
        let action = state.decide(
            &policy(),
            Some(&pressure(94.0)),
            &[0, 1, 2, 3],
            8,
            true,
            Instant::now(),
        );
        assert_eq!(action, Some(ScaleAction::Down { shard_id: 3 }));
    }

    #[test]
    fn saturation_without_stuck_worker_holds() {
        let mut state = FleetState::default();
        let action = state.decide(
            &policy(),
            Some(&pressure(94.0)),
            &[0, 1],
            8,
            false,
            Instant::now(),
        );
        assert_eq!(action, None);
    }

    #[test]
    fn scale_down_respects_min_and_cooldown() {
        let mut state = FleetState::default();
        let now = Instant::now();

        // At MIN, never scale down.
        assert_eq!(
            state.decide(&policy(), Some(&pressure(99.0)), &[0], 8, true, now),
            None
        );

        // First action lands, immediate second is cooled down.
        let first = state.decide(&policy(), Some(&pressure(99.0)), &[0, 1], 8, true, now);
        assert_eq!(first, Some(ScaleAction::Down { shard_id: 1 }));
        let second = state.decide(
            &policy(),
            Some(&pressure(99.0)),
            &[0, 1],
            8,
            true,
            now + Duration::from_secs(60),
        );
        assert_eq!(second, None);
        let later = state.decide(
            &policy(),
            Some(&pressure(99.0)),
            &[0, 1],
            8,
            true,
            now + Duration::from_secs(6 * 60),
        );
        assert_eq!(later, Some(ScaleAction::Down { shard_id: 1 }));
    }

    #[test]
    fn idle_disk_scales_up_to_target() {
        let mut state = FleetState::default();
        let action = state.decide(
            &policy(),
            Some(&pressure(42.0)),
            &[0, 2],
            8,
            false,
            Instant::now(),
        );
        assert_eq!(action, Some(ScaleAction::Up { shard_id: 1 }));
    }

    #[test]
    fn middling_utilization_changes_nothing() {
        let mut state = FleetState::default();
        let action = state.decide(
            &policy(),
            Some(&pressure(78.0)),
            &[0, 1],
            8,
            true,
            Instant::now(),
        );
        assert_eq!(action, None);
    }

    #[test]
    fn scale_up_respects_target_and_cooldown() {
        let mut state = FleetState::default();
        let now = Instant::now();

        // At target, no scale-up even when idle.
        assert_eq!(
            state.decide(&policy(), Some(&pressure(30.0)), &[0, 1, 2, 3], 8, false, now),
            None
        );

        let first = state.decide(&policy(), Some(&pressure(30.0)), &[0], 8, false, now);
        assert_eq!(first, Some(ScaleAction::Up { shard_id: 1 }));
        let cooled = state.decide(
            &policy(),
            Some(&pressure(30.0)),
            &[0],
            8,
            false,
            now + Duration::from_secs(5 * 60),
        );
        assert_eq!(cooled, None);
        let later = state.decide(
            &policy(),
            Some(&pressure(30.0)),
            &[0],
            8,
            false,
            now + Duration::from_secs(11 * 60),
        );
        assert_eq!(later, Some(ScaleAction::Up { shard_id: 1 }));
    }

    #[test]
    fn unknown_pressure_is_a_no_op() {
        let mut state = FleetState::default();
        assert_eq!(
            state.decide(&policy(), None, &[0, 1, 2, 3], 8, true, Instant::now()),
            None
        );
    }
}
