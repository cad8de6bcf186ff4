//! NUMA single-node topology hint merging.
//!
//! This is a small, pure, side-effect-free sibling of the admission filter: both are
//! "intersect a set of hints down to the admissible subset" problems, just over
//! different domains (migration jobs vs. NUMA affinity masks).

use serde::{Deserialize, Serialize};

/// A bitmask over NUMA node indices. Real NUMA topologies stay well under 64 nodes,
/// so a `u64` is sufficient and avoids a heap allocation per hint.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BitMask(u64);

impl BitMask {
    pub fn new(bits: u64) -> Self {
        BitMask(bits)
    }

    pub fn from_node(node: u32) -> Self {
        BitMask(1u64 << node)
    }

    pub fn count_ones(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_single_node(self) -> bool {
        self.count_ones() == 1
    }

    pub fn and(self, other: BitMask) -> BitMask {
        BitMask(self.0 & other.0)
    }
}

/// A single resource manager's contribution to a pod's topology placement: an
/// optional affinity mask (`None` means "no constraint contributed") and whether
/// that affinity is the resource's preferred outcome.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NumaHint {
    pub affinity: Option<BitMask>,
    pub preferred: bool,
}

impl NumaHint {
    pub fn new(affinity: Option<BitMask>, preferred: bool) -> Self {
        NumaHint { affinity, preferred }
    }

    pub fn unconstrained(preferred: bool) -> Self {
        NumaHint { affinity: None, preferred }
    }

    fn is_single_numa_or_unconstrained(&self) -> bool {
        match self.affinity {
            None => true,
            Some(mask) => mask.is_single_node(),
        }
    }
}

/// Filters each resource's hint list down to single-NUMA-node (or unconstrained)
/// hints, per the single-NUMA-node policy. A resource list that becomes empty is
/// replaced with the empty sentinel, which callers treat as "infeasible" for that
/// resource.
pub fn filter_single_numa_node_hints(resources: &[Vec<NumaHint>]) -> Vec<Vec<NumaHint>> {
    resources
        .iter()
        .map(|hints| {
            hints
                .iter()
                .copied()
                .filter(NumaHint::is_single_numa_or_unconstrained)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// A pod placement can be admitted under the single-NUMA-node policy iff at least
/// one resource contributed a preferred hint.
pub fn can_admit_pod_result(merged: &NumaHint) -> bool {
    merged.preferred
}

/// Merges hints across resources by intersecting affinities (skipping resources with
/// no constraint) and AND-ing the preferred flags. This is the test-invariant
/// definition of "merge" used across the topology-policy property tests; the
/// production path only needs `filter_single_numa_node_hints` plus
/// `can_admit_pod_result` over each resource's top candidate, but the merge itself
/// is exercised directly to pin down the semantics.
pub fn merge(hints: &[NumaHint]) -> NumaHint {
    hints.iter().fold(NumaHint::unconstrained(true), |acc, hint| {
        let affinity = match (acc.affinity, hint.affinity) {
            (None, other) => other,
            (mine, None) => mine,
            (Some(a), Some(b)) => Some(a.and(b)),
        };
        NumaHint::new(affinity, acc.preferred && hint.preferred)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_out_empty_inner_lists_to_the_empty_sentinel() {
        let resources = vec![vec![], vec![NumaHint::unconstrained(true)]];
        let filtered = filter_single_numa_node_hints(&resources);
        assert!(filtered[0].is_empty());
        assert_eq!(filtered[1], vec![NumaHint::unconstrained(true)]);
    }

    #[test]
    fn drops_hints_with_affinity_count_greater_than_one() {
        let multi_node = NumaHint::new(Some(BitMask::new(0b011)), true);
        let single_node = NumaHint::new(Some(BitMask::from_node(0)), true);
        let resources = vec![vec![multi_node, single_node]];
        let filtered = filter_single_numa_node_hints(&resources);
        assert_eq!(filtered[0], vec![single_node]);
    }

    #[test]
    fn retains_unconstrained_preferred_hints() {
        let hint = NumaHint::unconstrained(true);
        let filtered = filter_single_numa_node_hints(&[vec![hint]]);
        assert_eq!(filtered[0], vec![hint]);
    }

    #[test]
    fn can_admit_requires_preferred() {
        assert!(!can_admit_pod_result(&NumaHint::unconstrained(false)));
        assert!(can_admit_pod_result(&NumaHint::unconstrained(true)));
    }

    #[test]
    fn s6_two_resource_filter_scenario() {
        let resources = vec![
            vec![
                NumaHint::unconstrained(false),
                NumaHint::new(Some(BitMask::from_node(0)), true),
            ],
            vec![NumaHint::unconstrained(true)],
        ];

        let filtered = filter_single_numa_node_hints(&resources);

        assert_eq!(
            filtered,
            vec![
                vec![NumaHint::new(Some(BitMask::from_node(0)), true)],
                vec![NumaHint::unconstrained(true)],
            ]
        );
    }

    #[test]
    fn merge_intersects_affinities_and_ands_preferred() {
        let a = NumaHint::new(Some(BitMask::from_node(0).and(BitMask::from_node(1))), true);
        let b = NumaHint::new(Some(BitMask::from_node(0)), true);
        let merged = merge(&[a, b]);
        assert_eq!(merged.affinity, Some(BitMask::from_node(0).and(BitMask::from_node(0))));
        assert!(merged.preferred);

        let c = NumaHint::new(Some(BitMask::from_node(0)), false);
        let merged_with_rejecting = merge(&[a, b, c]);
        assert!(!merged_with_rejecting.preferred);
    }

    #[test]
    fn merge_skips_none_affinity_contributors() {
        let unconstrained = NumaHint::unconstrained(true);
        let constrained = NumaHint::new(Some(BitMask::from_node(2)), true);
        let merged = merge(&[unconstrained, constrained]);
        assert_eq!(merged.affinity, Some(BitMask::from_node(2)));
    }
}
