use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::comm::fabric::Rank;

/// A seeded pseudorandom permutation of the rank set.
///
/// Built once per `(n, seed)` pair; every worker constructing the same pair
/// observes the same ordering, which is what makes randomized request
/// bouncing deterministic across the cluster.
pub struct AdjustablePermutation {
    order: Vec<Rank>,
}

impl AdjustablePermutation {
    pub fn new(n: usize, seed: u64) -> Self {
        let mut order: Vec<Rank> = (0..n as Rank).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        Self { order }
    }

    pub fn get(&self, i: usize) -> Rank {
        self.order[i % self.order.len()]
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Computes this rank's outgoing edges of a degree-`r` expander graph over
/// `n` ranks, derived from `r` seeded permutations. The list has exactly `r`
/// entries, contains no duplicates, and never includes `my_rank` itself.
///
/// Requires `2r <= n`; under that bound a valid candidate always exists while
/// scanning a permutation, so construction terminates.
pub fn create_expander_graph(n: usize, degree: usize, my_rank: Rank, seed: u64) -> Vec<Rank> {
    assert!(degree >= 1 && 2 * degree <= n, "degree must satisfy 2r <= n");

    let mut edges: Vec<Rank> = Vec::with_capacity(degree);
    for k in 0..degree {
        let perm = AdjustablePermutation::new(
            n,
            seed.wrapping_add((k as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
        );
        let mut pos = my_rank as usize;
        let mut candidate = perm.get(pos);
        while candidate == my_rank || edges.contains(&candidate) {
            pos = (pos + 1) % n;
            candidate = perm.get(pos);
        }
        edges.push(candidate);
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_permutation_is_a_bijection() {
        for seed in [0u64, 1, 99] {
            let perm = AdjustablePermutation::new(16, seed);
            let seen: HashSet<Rank> = (0..16).map(|i| perm.get(i)).collect();
            assert_eq!(seen.len(), 16);
        }
    }

    #[test]
    fn test_permutation_is_deterministic_per_seed() {
        let a = AdjustablePermutation::new(32, 7);
        let b = AdjustablePermutation::new(32, 7);
        for i in 0..32 {
            assert_eq!(a.get(i), b.get(i));
        }
    }

    #[test]
    fn test_expander_graph_validity() {
        for &(n, r) in &[(2usize, 1usize), (8, 4), (10, 3), (33, 16), (64, 5)] {
            for seed in [0u64, 42, 1337] {
                for rank in 0..n as Rank {
                    let edges = create_expander_graph(n, r, rank, seed);
                    assert_eq!(edges.len(), r, "n={n} r={r} rank={rank}");
                    let unique: HashSet<Rank> = edges.iter().copied().collect();
                    assert_eq!(unique.len(), r, "duplicate edge for n={n} r={r}");
                    assert!(!edges.contains(&rank), "self-loop for rank {rank}");
                    assert!(edges.iter().all(|&e| e >= 0 && (e as usize) < n));
                }
            }
        }
    }
}
