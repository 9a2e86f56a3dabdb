//! Recency decay and support scores.

use crate::db::{Entry, Tier};
use crate::thresholds::EXPIRE_BELOW;

const MS_PER_DAY: f64 = 86_400_000.0;

/// ln 20 — with `exp(-age/τ)` the score crosses the 0.05 expiry floor at
/// exactly `τ · ln 20` days, so each tier's τ is its boundary divided by this.
const LN_20: f64 = 2.995_732_273_553_991;

/// Decay time constant per tier, in days. Core never decays. Temporary hits
/// the expiry floor at 10 days, permanent would at 150 (but never expires —
/// its score only matters for ranking elsewhere).
pub fn tier_tau_days(tier: Tier) -> Option<f64> {
    match tier {
        Tier::Core => None,
        Tier::Permanent => Some(150.0 / LN_20),
        Tier::Temporary => Some(10.0 / LN_20),
    }
}

/// Recency score in (0, 1]: `exp(-age_days / τ)` for decaying tiers, 1.0 for
/// core. Negative ages (clock skew) clamp to 1.0.
pub fn recency_score(tier: Tier, age_ms: i64) -> f64 {
    let Some(tau) = tier_tau_days(tier) else {
        return 1.0;
    };
    let age_days = (age_ms.max(0) as f64) / MS_PER_DAY;
    (-age_days / tau).exp()
}

/// Whether the rules runner should expire this entry at `now`.
/// Only temporary-tier entries ever expire.
pub fn is_expired(entry: &Entry, now: i64) -> bool {
    entry.tier == Tier::Temporary && recency_score(entry.tier, now - entry.created_at) < EXPIRE_BELOW
}

/// Reinforcement support: how much evidence backs this entry. Used to pick
/// merge keepers and cluster-eviction victims.
pub fn support(entry: &Entry) -> i64 {
    entry.confirmations + entry.recall_count
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 86_400_000;

    #[test]
    fn core_never_decays() {
        assert_eq!(recency_score(Tier::Core, 10_000 * DAY_MS), 1.0);
    }

    #[test]
    fn temporary_crosses_floor_at_ten_days() {
        let nine = recency_score(Tier::Temporary, 9 * DAY_MS + DAY_MS / 2);
        let eleven = recency_score(Tier::Temporary, 10 * DAY_MS + DAY_MS / 2);
        assert!(nine >= EXPIRE_BELOW, "9.5d score {nine} fell below floor");
        assert!(eleven < EXPIRE_BELOW, "10.5d score {eleven} still above floor");
    }

    #[test]
    fn permanent_crosses_floor_at_150_days() {
        let before = recency_score(Tier::Permanent, 149 * DAY_MS);
        let after = recency_score(Tier::Permanent, 151 * DAY_MS);
        assert!(before >= EXPIRE_BELOW);
        assert!(after < EXPIRE_BELOW);
    }

    #[test]
    fn fresh_score_is_one() {
        assert!((recency_score(Tier::Temporary, 0) - 1.0).abs() < 1e-12);
        assert_eq!(recency_score(Tier::Temporary, -5_000), 1.0);
    }
}
