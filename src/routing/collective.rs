use std::collections::HashMap;

use crate::comm::fabric::Rank;
use crate::data::serialize::{Reader, Serializable, Writer};
use crate::data::JobRequest;
use crate::error::Result;

/// Caps on what a single status message may carry.
const MAX_REQUESTS_PER_STATUS: usize = 16;
const MAX_IDLE_RANKS_PER_STATUS: usize = 64;

/// Aggregated view of a subtree of ranks: the unrouted requests queued there
/// and the ranks currently idle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStatus {
    pub requests: Vec<JobRequest>,
    pub idle_ranks: Vec<Rank>,
}

impl Serializable for NodeStatus {
    fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(
            8 + self.requests.len() * JobRequest::TRANSFER_SIZE + self.idle_ranks.len() * 4,
        );
        w.put_i32(self.requests.len() as i32);
        for req in &self.requests {
            w.put_bytes(&req.serialize());
        }
        w.put_i32(self.idle_ranks.len() as i32);
        for &rank in &self.idle_ranks {
            w.put_i32(rank);
        }
        w.into_bytes()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let num_requests = r.get_i32()? as usize;
        let needed = 4 + num_requests * JobRequest::TRANSFER_SIZE;
        if bytes.len() < needed {
            return Err(crate::error::SchedError::TruncatedMessage {
                needed,
                got: bytes.len(),
            });
        }
        let mut requests = Vec::with_capacity(num_requests);
        let mut offset = 4;
        for _ in 0..num_requests {
            requests.push(JobRequest::deserialize(
                &bytes[offset..offset + JobRequest::TRANSFER_SIZE],
            )?);
            offset += JobRequest::TRANSFER_SIZE;
        }
        let mut r = Reader::new(&bytes[offset..]);
        let num_idle = r.get_i32()? as usize;
        let mut idle_ranks = Vec::with_capacity(num_idle);
        for _ in 0..num_idle {
            idle_ranks.push(r.get_i32()?);
        }
        Ok(Self {
            requests,
            idle_ranks,
        })
    }
}

/// Result of one collective-assignment step.
#[derive(Debug, Default)]
pub struct CollectiveAdvance {
    /// Status to push to the parent rank, if any.
    pub upward: Option<(Rank, NodeStatus)>,
    /// Requests the root matched to idle ranks; each is sent directly to its
    /// rank and handled there like a normal node request.
    pub assignments: Vec<(Rank, JobRequest)>,
}

/// Batched matching of unrouted requests to idle ranks.
///
/// Ranks form a static binary aggregation tree (parent of `r` is
/// `(r - 1) / 2`). Each balancing tick a dirty node merges its own queue and
/// idle flag with its children's reported statuses and pushes the aggregate
/// up; the root greedily matches requests against idle ranks.
pub struct CollectiveAssignment {
    my_rank: Rank,
    queued: Vec<JobRequest>,
    child_statuses: HashMap<Rank, NodeStatus>,
    status_dirty: bool,
}

impl CollectiveAssignment {
    pub fn new(my_rank: Rank) -> Self {
        Self {
            my_rank,
            queued: Vec::new(),
            child_statuses: HashMap::new(),
            status_dirty: true,
        }
    }

    fn parent(&self) -> Option<Rank> {
        (self.my_rank > 0).then(|| (self.my_rank - 1) / 2)
    }

    /// Queues an unrouted request for batched matching.
    pub fn add_request(&mut self, request: JobRequest) {
        tracing::debug!(request = %request, "queueing for collective assignment");
        self.queued.push(request);
        self.status_dirty = true;
    }

    /// Marks the local status as changed (e.g. the worker's idle state
    /// flipped), forcing a fresh upward report on the next step.
    pub fn set_status_dirty(&mut self) {
        self.status_dirty = true;
    }

    /// Ingests a status reported by a child in the aggregation tree.
    pub fn handle_status(&mut self, source: Rank, status: NodeStatus) {
        self.child_statuses.insert(source, status);
        self.status_dirty = true;
    }

    /// One aggregation/matching step, called from the balancing tick.
    pub fn advance(&mut self, current_epoch: i32, locally_idle: bool) -> CollectiveAdvance {
        // Requests from long-gone epochs are dropped; the receiving end would
        // discard them as obsolete anyway.
        self.queued
            .retain(|r| r.balancing_epoch >= current_epoch - 1);

        if !self.status_dirty {
            return CollectiveAdvance::default();
        }
        self.status_dirty = false;

        let mut requests = std::mem::take(&mut self.queued);
        let mut idle_ranks: Vec<Rank> = if locally_idle { vec![self.my_rank] } else { vec![] };
        for status in self.child_statuses.values() {
            requests.extend(status.requests.iter().cloned());
            idle_ranks.extend(status.idle_ranks.iter().copied());
        }
        self.child_statuses.clear();

        // Dedup by (job, index), keeping the request that hopped least.
        requests.sort_by_key(|r| (r.job_id, r.requested_node_index, r.num_hops));
        requests.dedup_by_key(|r| (r.job_id, r.requested_node_index));
        requests.truncate(MAX_REQUESTS_PER_STATUS);
        idle_ranks.sort_unstable();
        idle_ranks.dedup();
        idle_ranks.truncate(MAX_IDLE_RANKS_PER_STATUS);

        if let Some(parent) = self.parent() {
            return CollectiveAdvance {
                upward: Some((
                    parent,
                    NodeStatus {
                        requests,
                        idle_ranks,
                    },
                )),
                assignments: Vec::new(),
            };
        }

        // Root: match requests to idle ranks.
        let mut assignments = Vec::new();
        for request in requests {
            let slot = idle_ranks
                .iter()
                .position(|&r| r != request.requesting_node_rank);
            match slot {
                Some(pos) => {
                    let rank = idle_ranks.remove(pos);
                    tracing::debug!(request = %request, rank, "collective assignment matched");
                    assignments.push((rank, request));
                }
                None => self.queued.push(request),
            }
        }
        CollectiveAdvance {
            upward: None,
            assignments,
        }
    }
}
