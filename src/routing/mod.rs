//! Routing of unfulfilled job requests across the fabric.
//!
//! Requests that no worker has adopted yet bounce along a pre-computed
//! expander graph (or a per-request pseudorandom permutation) until someone
//! adopts them or, after enough hops, they are handed to the collective
//! assignment fallback.

pub mod collective;
pub mod permutation;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::comm::fabric::Rank;
use crate::config::Config;
use crate::data::JobRequest;
use permutation::{create_expander_graph, AdjustablePermutation};

pub use collective::CollectiveAssignment;

/// Where an unfulfilled request goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to this rank as a normal hop.
    Forward(Rank),
    /// Hand off to the collective assignment component.
    Collective,
}

/// Chooses the next destination for a bouncing request.
pub struct RequestRouter {
    my_rank: Rank,
    num_ranks: usize,
    derandomize: bool,
    hops_until_collective: i32,
    reactivation_scheduling: bool,
    bounce_alternatives: Vec<Rank>,
    rng: StdRng,
}

impl RequestRouter {
    pub fn new(config: &Config, my_rank: Rank, num_ranks: usize) -> Self {
        let bounce_alternatives = if config.derandomize() && num_ranks > 1 {
            let mut degree = config.num_bounce_alternatives.max(1);
            if 2 * degree > num_ranks {
                degree = (num_ranks / 2).max(1);
                tracing::warn!(
                    requested = config.num_bounce_alternatives,
                    fallback = degree,
                    "num bounce alternatives must be at most half the number of workers"
                );
            }
            let edges = create_expander_graph(num_ranks, degree, my_rank, config.seed);
            tracing::debug!(?edges, "bounce alternatives");
            edges
        } else {
            Vec::new()
        };

        Self {
            my_rank,
            num_ranks,
            derandomize: config.derandomize(),
            hops_until_collective: config.hops_until_collective_assignment,
            reactivation_scheduling: config.reactivation_scheduling,
            bounce_alternatives,
            rng: StdRng::seed_from_u64(config.seed ^ (my_rank as u64).wrapping_mul(0xd1b5_4a32_d192_ed03)),
        }
    }

    pub fn bounce_alternatives(&self) -> &[Rank] {
        &self.bounce_alternatives
    }

    /// Advances the request by one hop and decides where it travels next.
    /// Never forwards to the requesting node; avoids ping-pong with `sender`
    /// where the topology allows it.
    pub fn next_hop(&mut self, request: &mut JobRequest, sender: Rank) -> RouteDecision {
        request.num_hops += 1;
        let hops = request.num_hops;

        if hops >= 512 && (hops & (hops - 1)) == 0 {
            tracing::warn!(request = %request, "request is still hopping");
        }

        if self.hops_until_collective >= 0
            && hops >= self.hops_until_collective
            && (self.reactivation_scheduling || request.requested_node_index > 0)
        {
            return RouteDecision::Collective;
        }

        let next = if self.derandomize && !self.bounce_alternatives.is_empty() {
            self.random_neighbor(request.requesting_node_rank, sender)
        } else {
            self.permuted_neighbor(request, sender)
        };
        RouteDecision::Forward(next)
    }

    fn random_neighbor(&mut self, requester: Rank, sender: Rank) -> Rank {
        let len = self.bounce_alternatives.len();
        let mut next = self.bounce_alternatives[self.rng.gen_range(0..len)];
        let mut retries = 0;
        while (next == requester || next == sender) && retries < len {
            next = self.bounce_alternatives[self.rng.gen_range(0..len)];
            retries += 1;
        }
        next
    }

    fn permuted_neighbor(&self, request: &JobRequest, sender: Rank) -> Rank {
        let n = self.num_ranks;
        let seed = 3i64 * request.job_id as i64
            + 7 * request.requested_node_index as i64
            + 11 * request.requesting_node_rank as i64;
        let perm = AdjustablePermutation::new(n, seed as u64);
        let mut idx = request.num_hops as usize % n;
        let mut next = perm.get(idx);
        if n > 3 {
            while next == self.my_rank
                || next == request.requesting_node_rank
                || next == sender
            {
                idx = (idx + 1) % n;
                next = perm.get(idx);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Application;

    fn request(job_id: i32, index: i32, requester: Rank) -> JobRequest {
        JobRequest::new(job_id, Application::Dummy, 0, requester, index, 0.0, 1, 0)
    }

    fn config(derandomize: i32, hops_until_collective: i32) -> Config {
        let mut cfg = Config::default();
        cfg.derandomize = derandomize;
        cfg.hops_until_collective_assignment = hops_until_collective;
        cfg
    }

    #[test]
    fn test_forward_increments_hops_and_avoids_requester() {
        let cfg = config(1, -1);
        let mut router = RequestRouter::new(&cfg, 0, 8);
        let mut req = request(1, 2, 3);
        for _ in 0..32 {
            match router.next_hop(&mut req, 5) {
                RouteDecision::Forward(next) => {
                    assert_ne!(next, 3, "forwarded to the requesting node");
                    assert_ne!(next, 0, "expander edges exclude the node itself");
                }
                RouteDecision::Collective => panic!("collective assignment is disabled"),
            }
        }
        assert_eq!(req.num_hops, 32);
    }

    #[test]
    fn test_randomized_mode_skips_self_requester_sender() {
        let cfg = config(0, -1);
        let mut router = RequestRouter::new(&cfg, 2, 8);
        let mut req = request(9, 1, 4);
        for _ in 0..32 {
            match router.next_hop(&mut req, 6) {
                RouteDecision::Forward(next) => {
                    assert!(next != 2 && next != 4 && next != 6);
                }
                RouteDecision::Collective => panic!(),
            }
        }
    }

    #[test]
    fn test_collective_handoff_after_enough_hops() {
        let cfg = config(1, 4);
        let mut router = RequestRouter::new(&cfg, 0, 8);
        let mut req = request(1, 2, 3);
        let mut decisions = Vec::new();
        for _ in 0..5 {
            decisions.push(router.next_hop(&mut req, 1));
        }
        assert!(matches!(decisions[2], RouteDecision::Forward(_)));
        assert_eq!(decisions[3], RouteDecision::Collective);
        assert_eq!(decisions[4], RouteDecision::Collective);
    }

    #[test]
    fn test_root_requests_bypass_collective_without_reactivation() {
        let cfg = config(1, 2);
        let mut router = RequestRouter::new(&cfg, 0, 8);
        let mut req = request(1, 0, 3);
        for _ in 0..8 {
            assert!(matches!(
                router.next_hop(&mut req, 1),
                RouteDecision::Forward(_)
            ));
        }
    }
}
