//! Controller Scorer: ranks discovered candidates for a bed and implements
//! sticky pinning (§4.3).
//!
//! Persistence is behind the [`ControllerStatsPort`] trait so this crate
//! never depends on a concrete storage backend; `bedlink-store` provides
//! the implementation backed by the on-disk controller-stats file.

use bedlink_types::{BleAdvertisement, ControllerStats};

use crate::error::Result;

/// Recency bonus bands (§4.3 scoring formula).
const RECENT_SUCCESS_WINDOW_MS: u64 = 6 * 60 * 60 * 1000;
const STALE_SUCCESS_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
const RECENT_SUCCESS_BONUS: i32 = 60;
const STALE_SUCCESS_BONUS: i32 = 25;

const FAILURE_PENALTY_PER_STRIKE: i32 = 30;
const FAILURE_PENALTY_CAP: i32 = 90;
const HOURLY_PENALTY_PER_FAILURE: i32 = 10;
const HOURLY_PENALTY_CAP: i32 = 40;
const IMBALANCE_PENALTY: i32 = 15;

/// Consecutive failures below this threshold still let a pinned controller
/// keep its seat even if it no longer scores highest.
pub const STICKY_FAILURE_THRESHOLD: u32 = 2;

/// Read/write access to persisted controller stats and bed pinning,
/// scoped by `(bed_key, controller_key)`.
pub trait ControllerStatsPort: Send + Sync {
    fn stats(&self, bed_key: &str, controller_key: &str) -> ControllerStats;
    fn pinned_controller(&self, bed_key: &str) -> Option<String>;
    fn set_pinned_controller(&self, bed_key: &str, controller_key: &str) -> Result<()>;
    fn record_success(&self, bed_key: &str, controller_key: &str, now_ms: u64) -> Result<()>;
    fn record_failure(
        &self,
        bed_key: &str,
        controller_key: &str,
        now_ms: u64,
        error: &str,
    ) -> Result<()>;
}

/// A discovered candidate awaiting scoring: the controller's stable key
/// (its MAC, matching `ControllerStats` storage) plus the advertisement
/// that surfaced it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub controller_key: String,
    pub advertisement: BleAdvertisement,
}

/// `rssi + success_recency_bonus - failure_penalty - recent_hourly_penalty
/// - imbalance_penalty` (§4.3).
pub fn score(stats: &ControllerStats, rssi: i16, now_ms: u64) -> i32 {
    let success_recency_bonus = match stats.last_success_at {
        Some(t) if now_ms.saturating_sub(t) <= RECENT_SUCCESS_WINDOW_MS => RECENT_SUCCESS_BONUS,
        Some(t) if now_ms.saturating_sub(t) <= STALE_SUCCESS_WINDOW_MS => STALE_SUCCESS_BONUS,
        _ => 0,
    };

    let failure_penalty =
        (FAILURE_PENALTY_PER_STRIKE * stats.consecutive_failures as i32).min(FAILURE_PENALTY_CAP);

    let recent_hourly_penalty = (HOURLY_PENALTY_PER_FAILURE * stats.failures_last_hour(now_ms) as i32)
        .min(HOURLY_PENALTY_CAP);

    let imbalance_penalty = if stats.failures > stats.successes + 2 {
        IMBALANCE_PENALTY
    } else {
        0
    };

    rssi as i32 + success_recency_bonus - failure_penalty - recent_hourly_penalty - imbalance_penalty
}

/// Candidates ranked highest score first, with the pinned controller
/// promoted to the front if its `consecutive_failures` are still below
/// [`STICKY_FAILURE_THRESHOLD`].
pub fn rank(
    bed_key: &str,
    candidates: Vec<Candidate>,
    stats_port: &dyn ControllerStatsPort,
    now_ms: u64,
) -> Vec<(Candidate, i32)> {
    let pinned = stats_port.pinned_controller(bed_key);

    let mut scored: Vec<(Candidate, i32)> = candidates
        .into_iter()
        .map(|candidate| {
            let stats = stats_port.stats(bed_key, &candidate.controller_key);
            let score = score(&stats, candidate.advertisement.rssi, now_ms);
            (candidate, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1));

    if let Some(pinned_key) = pinned {
        if let Some(pos) = scored.iter().position(|(c, _)| c.controller_key == pinned_key) {
            let pinned_stats = stats_port.stats(bed_key, &pinned_key);
            if pinned_stats.consecutive_failures < STICKY_FAILURE_THRESHOLD && pos != 0 {
                let item = scored.remove(pos);
                scored.insert(0, item);
            }
        }
    }

    scored
}

/// Walk `ranked` in order and return the first candidate `is_supported`
/// accepts — the controller-build probe lives outside this crate (it needs
/// a vendor registry), so it is injected as a predicate.
pub fn select_first_supported<'a>(
    ranked: &'a [(Candidate, i32)],
    is_supported: impl Fn(&Candidate) -> bool,
) -> Option<&'a Candidate> {
    ranked
        .iter()
        .find(|(c, _)| is_supported(c))
        .map(|(c, _)| c)
}

/// Record a successful connect and pin its controller, matching the "on
/// success the pinned controller flips" behaviour (§4.3).
pub fn note_success(
    stats_port: &dyn ControllerStatsPort,
    bed_key: &str,
    controller_key: &str,
    now_ms: u64,
) -> Result<()> {
    stats_port.record_success(bed_key, controller_key, now_ms)?;
    stats_port.set_pinned_controller(bed_key, controller_key)
}

pub fn note_failure(
    stats_port: &dyn ControllerStatsPort,
    bed_key: &str,
    controller_key: &str,
    now_ms: u64,
    error: &str,
) -> Result<()> {
    stats_port.record_failure(bed_key, controller_key, now_ms, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedlink_types::AddressType;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeStats {
        stats: RefCell<HashMap<(String, String), ControllerStats>>,
        pinned: RefCell<HashMap<String, String>>,
    }

    impl FakeStats {
        fn new() -> Self {
            Self {
                stats: RefCell::new(HashMap::new()),
                pinned: RefCell::new(HashMap::new()),
            }
        }
    }

    impl ControllerStatsPort for FakeStats {
        fn stats(&self, bed_key: &str, controller_key: &str) -> ControllerStats {
            self.stats
                .borrow()
                .get(&(bed_key.to_string(), controller_key.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        fn pinned_controller(&self, bed_key: &str) -> Option<String> {
            self.pinned.borrow().get(bed_key).cloned()
        }

        fn set_pinned_controller(&self, bed_key: &str, controller_key: &str) -> Result<()> {
            self.pinned
                .borrow_mut()
                .insert(bed_key.to_string(), controller_key.to_string());
            Ok(())
        }

        fn record_success(&self, bed_key: &str, controller_key: &str, now_ms: u64) -> Result<()> {
            self.stats
                .borrow_mut()
                .entry((bed_key.to_string(), controller_key.to_string()))
                .or_default()
                .record_success(now_ms);
            Ok(())
        }

        fn record_failure(
            &self,
            bed_key: &str,
            controller_key: &str,
            now_ms: u64,
            error: &str,
        ) -> Result<()> {
            self.stats
                .borrow_mut()
                .entry((bed_key.to_string(), controller_key.to_string()))
                .or_default()
                .record_failure(now_ms, error);
            Ok(())
        }
    }

    fn candidate(key: &str, rssi: i16) -> Candidate {
        Candidate {
            controller_key: key.to_string(),
            advertisement: BleAdvertisement::new(0, AddressType::Public, rssi),
        }
    }

    #[test]
    fn stronger_rssi_ranks_first_with_no_history() {
        let port = FakeStats::new();
        let ranked = rank(
            "bed1",
            vec![candidate("a", -80), candidate("b", -40)],
            &port,
            0,
        );
        assert_eq!(ranked[0].0.controller_key, "b");
    }

    #[test]
    fn pinned_controller_stays_first_under_sticky_threshold() {
        let port = FakeStats::new();
        port.set_pinned_controller("bed1", "a").unwrap();
        // a has one failure (below the sticky threshold of 2), b is stronger
        port.record_failure("bed1", "a", 0, "timeout").unwrap();

        let ranked = rank(
            "bed1",
            vec![candidate("a", -90), candidate("b", -30)],
            &port,
            1000,
        );
        assert_eq!(ranked[0].0.controller_key, "a");
    }

    #[test]
    fn pinned_controller_loses_seat_past_sticky_threshold() {
        let port = FakeStats::new();
        port.set_pinned_controller("bed1", "a").unwrap();
        port.record_failure("bed1", "a", 0, "timeout").unwrap();
        port.record_failure("bed1", "a", 1, "timeout").unwrap();

        let ranked = rank(
            "bed1",
            vec![candidate("a", -90), candidate("b", -30)],
            &port,
            1000,
        );
        assert_eq!(ranked[0].0.controller_key, "b");
    }

    #[test]
    fn recent_success_outweighs_rssi_gap() {
        let stats_a = ControllerStats {
            last_success_at: Some(0),
            ..Default::default()
        };
        let score_a = score(&stats_a, -80, 1000);
        let score_b = score(&ControllerStats::default(), -40, 1000);
        assert!(score_a > score_b);
    }

    #[test]
    fn select_first_supported_skips_unsupported() {
        let ranked = vec![
            (candidate("a", -50), 10),
            (candidate("b", -50), 5),
        ];
        let chosen = select_first_supported(&ranked, |c| c.controller_key == "b");
        assert_eq!(chosen.unwrap().controller_key, "b");
    }
}
