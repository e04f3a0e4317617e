use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::TenantId;

/// How an idle worker chooses the tenant to pull from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Weighted random choice, weight = queue depth. Long queues drain
    /// proportionally faster while every non-empty queue keeps a chance.
    #[default]
    DepthWeighted,
    /// Every non-empty tenant equally likely.
    Uniform,
}

/// Picks a tenant from a snapshot of queue depths.
#[derive(Debug, Clone, Copy)]
pub struct TenantPicker {
    policy: SchedulingPolicy,
}

impl TenantPicker {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    /// Choose among `candidates` (tenant, depth). Tenants with depth 0 are
    /// never chosen; returns `None` when none has work.
    pub fn pick<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [(TenantId, usize)],
        rng: &mut R,
    ) -> Option<&'a TenantId> {
        let eligible: Vec<&(TenantId, usize)> =
            candidates.iter().filter(|(_, depth)| *depth > 0).collect();
        if eligible.is_empty() {
            return None;
        }

        let weights = eligible.iter().map(|(_, depth)| match self.policy {
            SchedulingPolicy::DepthWeighted => *depth,
            SchedulingPolicy::Uniform => 1,
        });
        let dist = WeightedIndex::new(weights).ok()?;
        Some(&eligible[dist.sample(rng)].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn tally(picker: TenantPicker, candidates: &[(TenantId, usize)], rounds: usize) -> HashMap<String, usize> {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            if let Some(t) = picker.pick(candidates, &mut rng) {
                *counts.entry(t.to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    #[test]
    fn empty_or_drained_candidates_yield_none() {
        let picker = TenantPicker::new(SchedulingPolicy::DepthWeighted);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(picker.pick(&[], &mut rng).is_none());
        assert!(picker.pick(&[(tenant("a"), 0)], &mut rng).is_none());
    }

    #[test]
    fn depth_weighting_is_roughly_proportional() {
        let candidates = vec![(tenant("heavy"), 90), (tenant("light"), 10)];
        let counts = tally(
            TenantPicker::new(SchedulingPolicy::DepthWeighted),
            &candidates,
            10_000,
        );
        let heavy = counts["heavy"] as f64 / 10_000.0;
        assert!((0.86..0.94).contains(&heavy), "heavy share {heavy}");
        // The light tenant is never starved.
        assert!(counts["light"] > 500);
    }

    #[test]
    fn uniform_ignores_depth() {
        let candidates = vec![(tenant("heavy"), 90), (tenant("light"), 10), (tenant("idle"), 0)];
        let counts = tally(TenantPicker::new(SchedulingPolicy::Uniform), &candidates, 10_000);
        let heavy = counts["heavy"] as f64 / 10_000.0;
        assert!((0.45..0.55).contains(&heavy), "heavy share {heavy}");
        assert!(!counts.contains_key("idle"));
    }
}
