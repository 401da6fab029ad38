//! Jobs and their per-worker state.
//!
//! A [`Job`] is one worker's view of a distributed job: its lifecycle state,
//! the [`JobTree`] node it embodies, description revisions, result slot and
//! accounting. Workers exclusively own their jobs; each job exclusively owns
//! its tree and (with reactivation scheduling) its [`LocalScheduler`].

pub mod registry;
pub mod scheduler;
pub mod tree;

use std::collections::HashSet;
use std::sync::Arc;

use crate::comm::fabric::Rank;
use crate::data::{Application, DescriptionChunk, JobRequest, JobResult, Serializable};
use crate::error::{Result, SchedError};
use crate::job::scheduler::LocalScheduler;
use crate::job::tree::JobTree;

pub use registry::{AdoptionResult, JobRegistry, RequestMode};

/// Lifecycle of a job on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Known by id, not (or no longer) executing here.
    Inactive,
    /// Executing as a node of the job tree.
    Active,
    /// Shrunk below the volume; may be reactivated later.
    Suspended,
    /// Terminated for good.
    Past,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Inactive => write!(f, "inactive"),
            JobState::Active => write!(f, "active"),
            JobState::Suspended => write!(f, "suspended"),
            JobState::Past => write!(f, "past"),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    id: i32,
    application: Application,
    state: JobState,
    tree: JobTree,
    scheduler: Option<LocalScheduler>,
    threads: usize,

    /// Serialized description chunk per revision, kept for re-transfer.
    revisions: Vec<Arc<Vec<u8>>>,
    revision: i32,
    desired_revision: i32,

    volume: i32,
    balancing_epoch_of_last_commitment: i32,
    commitment: Option<JobRequest>,
    client_rank: Rank,

    time_of_activation: f32,
    time_of_last_accounting: f32,
    used_cpu_seconds: f32,
    time_of_first_volume_update: Option<f32>,
    last_interaction: f32,

    last_demand: i32,

    solved_revisions: HashSet<i32>,
    result: Option<JobResult>,
    result_unreported: bool,
    result_transfer_pending: bool,

    /// Children waiting for a revision not yet present here.
    waiting_rank_revision_pairs: Vec<(Rank, i32)>,
}

impl Job {
    pub fn new(
        id: i32,
        application: Application,
        dormant_cache_size: usize,
        reactivation_scheduling: bool,
        threads: usize,
    ) -> Self {
        Self {
            id,
            application,
            state: JobState::Inactive,
            tree: JobTree::new(dormant_cache_size),
            scheduler: reactivation_scheduling.then(|| LocalScheduler::new(id, application)),
            threads: threads.max(1),
            revisions: Vec::new(),
            revision: -1,
            desired_revision: 0,
            volume: 0,
            balancing_epoch_of_last_commitment: -1,
            commitment: None,
            client_rank: -1,
            time_of_activation: 0.0,
            time_of_last_accounting: 0.0,
            used_cpu_seconds: 0.0,
            time_of_first_volume_update: None,
            last_interaction: 0.0,
            last_demand: 0,
            solved_revisions: HashSet::new(),
            result: None,
            result_unreported: false,
            result_transfer_pending: false,
            waiting_rank_revision_pairs: Vec::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn application(&self) -> Application {
        self.application
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn index(&self) -> i32 {
        self.tree.index()
    }

    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut JobTree {
        &mut self.tree
    }

    /// Tree and scheduler borrowed together; the scheduler mutates dormant
    /// and desire state while deciding.
    pub fn tree_and_scheduler_mut(&mut self) -> (&mut JobTree, Option<&mut LocalScheduler>) {
        (&mut self.tree, self.scheduler.as_mut())
    }

    pub fn scheduler(&self) -> Option<&LocalScheduler> {
        self.scheduler.as_ref()
    }

    pub fn client_rank(&self) -> Rank {
        self.client_rank
    }

    pub fn touch(&mut self, now: f32) {
        self.last_interaction = now;
    }

    pub fn last_interaction(&self) -> f32 {
        self.last_interaction
    }

    // ---- commitment ----

    /// Records the intent to fulfill `request`: this worker becomes the tree
    /// node the request asks for.
    pub fn commit(&mut self, request: JobRequest, epoch: i32) {
        self.tree
            .update_role(request.requested_node_index, request.root_rank);
        if request.requested_node_index == 0 {
            // The root's parent is the submitting client.
            self.client_rank = request.requesting_node_rank;
            self.tree.set_parent(request.requesting_node_rank);
        }
        self.desired_revision = self.desired_revision.max(request.current_revision);
        self.balancing_epoch_of_last_commitment = epoch;
        self.commitment = Some(request);
    }

    pub fn uncommit(&mut self) -> Option<JobRequest> {
        self.commitment.take()
    }

    pub fn has_commitment(&self) -> bool {
        self.commitment.is_some()
    }

    pub fn balancing_epoch_of_last_commitment(&self) -> i32 {
        self.balancing_epoch_of_last_commitment
    }

    // ---- description revisions ----

    /// Appends the next description revision from its wire form. Returns the
    /// appended revision, or `None` if the chunk is stale. Flips the job to
    /// "described" by itself; callers never set that separately.
    pub fn append_revision(&mut self, bytes: Vec<u8>) -> Result<Option<i32>> {
        let chunk = DescriptionChunk::deserialize(&bytes)?;
        if chunk.job_id != self.id {
            return Err(SchedError::ProtocolViolation(format!(
                "description for job #{} delivered to job #{}",
                chunk.job_id, self.id
            )));
        }
        if chunk.revision <= self.revision {
            return Ok(None);
        }
        if chunk.revision != self.revision + 1 {
            return Ok(None);
        }
        if !chunk.checksum_valid() {
            return Err(SchedError::ChecksumMismatch {
                job_id: self.id,
                revision: chunk.revision,
            });
        }
        self.revision = chunk.revision;
        self.revisions.push(Arc::new(bytes));
        Ok(Some(self.revision))
    }

    pub fn has_description(&self) -> bool {
        self.revision >= 0
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn desired_revision(&self) -> i32 {
        self.desired_revision
    }

    pub fn set_desired_revision(&mut self, revision: i32) {
        self.desired_revision = self.desired_revision.max(revision);
    }

    pub fn serialized_revision(&self, revision: i32) -> Option<Arc<Vec<u8>>> {
        self.revisions.get(revision as usize).cloned()
    }

    // ---- lifecycle ----

    pub fn activate(&mut self, now: f32) {
        self.state = JobState::Active;
        self.time_of_activation = now;
        self.time_of_last_accounting = now;
        self.last_interaction = now;
    }

    pub fn resume(&mut self, now: f32) {
        self.state = JobState::Active;
        self.time_of_last_accounting = now;
        self.last_interaction = now;
    }

    pub fn suspend(&mut self, now: f32) {
        self.account_cpu(now);
        self.state = JobState::Suspended;
        self.last_interaction = now;
    }

    pub fn terminate(&mut self, now: f32) {
        if self.state == JobState::Active {
            self.account_cpu(now);
        }
        self.state = JobState::Past;
        self.commitment = None;
        self.last_interaction = now;
    }

    fn account_cpu(&mut self, now: f32) {
        if self.state == JobState::Active {
            let elapsed = (now - self.time_of_last_accounting).max(0.0);
            self.used_cpu_seconds += elapsed * self.volume.max(1) as f32 * self.threads as f32;
        }
        self.time_of_last_accounting = now;
    }

    pub fn age_since_activation(&self, now: f32) -> f32 {
        (now - self.time_of_activation).max(0.0)
    }

    pub fn used_cpu_seconds(&self) -> f32 {
        self.used_cpu_seconds
    }

    // ---- volume ----

    pub fn volume(&self) -> i32 {
        self.volume
    }

    pub fn update_volume_and_used_cpu(&mut self, volume: i32, now: f32) {
        self.account_cpu(now);
        self.volume = volume;
        if self.time_of_first_volume_update.is_none() && self.state == JobState::Active {
            self.time_of_first_volume_update = Some(now);
        }
    }

    pub fn latency_of_first_volume_update(&self) -> f32 {
        self.time_of_first_volume_update
            .map(|t| (t - self.time_of_activation).max(0.0))
            .unwrap_or(0.0)
    }

    // ---- demand ----

    /// Grows the root's demand by one full tree level, capped at the cluster
    /// size. Returns the new demand when it changed.
    pub fn grow_demand(&mut self, num_ranks: usize) -> Option<i32> {
        let next = if self.last_demand <= 0 {
            1
        } else {
            (2 * self.last_demand + 1).min(num_ranks as i32)
        };
        (next != self.last_demand).then(|| {
            self.last_demand = next;
            next
        })
    }

    // ---- results ----

    /// Called by the application layer once a revision is solved on this
    /// worker.
    pub fn post_result(&mut self, result: JobResult) {
        self.result = Some(result);
        self.result_unreported = true;
    }

    /// The pending "solved" notification for the root, at most once per
    /// posted result.
    pub fn take_result_notification(&mut self) -> Option<(i32, i32)> {
        if !self.result_unreported {
            return None;
        }
        self.result_unreported = false;
        self.result
            .as_ref()
            .map(|r| (r.revision, r.result_code))
    }

    pub fn result(&self) -> Option<&JobResult> {
        self.result.as_ref()
    }

    pub fn set_result_transfer_pending(&mut self, pending: bool) {
        self.result_transfer_pending = pending;
    }

    pub fn is_result_transfer_pending(&self) -> bool {
        self.result_transfer_pending
    }

    pub fn set_revision_solved(&mut self, revision: i32) {
        self.solved_revisions.insert(revision);
    }

    pub fn is_revision_solved(&self, revision: i32) -> bool {
        self.solved_revisions.contains(&revision)
    }

    // ---- deferred description queries ----

    pub fn add_child_waiting_for_revision(&mut self, rank: Rank, revision: i32) {
        self.waiting_rank_revision_pairs.push((rank, revision));
    }

    /// Drains parked queries that can be answered now; returns only those
    /// from current children (others became obsolete while waiting).
    pub fn take_serviceable_waiting_children(&mut self) -> Vec<(Rank, i32)> {
        let current = self.revision;
        let children: Vec<Rank> = tree::Side::BOTH
            .into_iter()
            .filter_map(|s| self.tree.child_rank(s))
            .collect();
        let mut serviceable = Vec::new();
        self.waiting_rank_revision_pairs.retain(|&(rank, rev)| {
            if rev > current {
                return true;
            }
            if children.contains(&rank) {
                serviceable.push((rank, rev));
            }
            false
        });
        serviceable
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.id, self.tree.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(1, Application::Dummy, 4, false, 1)
    }

    fn chunk(job_id: i32, revision: i32) -> Vec<u8> {
        DescriptionChunk::new(job_id, revision, vec![1, 2, 3]).serialize()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut j = job();
        assert_eq!(j.state(), JobState::Inactive);
        j.activate(1.0);
        assert_eq!(j.state(), JobState::Active);
        j.suspend(2.0);
        assert_eq!(j.state(), JobState::Suspended);
        j.resume(3.0);
        assert_eq!(j.state(), JobState::Active);
        j.terminate(4.0);
        assert_eq!(j.state(), JobState::Past);
    }

    #[test]
    fn test_commit_as_root_records_client() {
        let mut j = job();
        let req = JobRequest::new(1, Application::Dummy, 3, 7, 0, 0.0, 2, 0);
        j.commit(req, 2);
        assert!(j.has_commitment());
        assert_eq!(j.client_rank(), 7);
        assert!(j.tree().is_root());
        assert_eq!(j.balancing_epoch_of_last_commitment(), 2);
        j.uncommit();
        assert!(!j.has_commitment());
    }

    #[test]
    fn test_append_revision_in_order_only() {
        let mut j = job();
        assert!(!j.has_description());
        assert_eq!(j.append_revision(chunk(1, 0)).unwrap(), Some(0));
        assert!(j.has_description());
        // Stale and out-of-order chunks are ignored.
        assert_eq!(j.append_revision(chunk(1, 0)).unwrap(), None);
        assert_eq!(j.append_revision(chunk(1, 2)).unwrap(), None);
        assert_eq!(j.append_revision(chunk(1, 1)).unwrap(), Some(1));
        assert_eq!(j.revision(), 1);
        assert!(j.serialized_revision(0).is_some());
        assert!(j.serialized_revision(2).is_none());
    }

    #[test]
    fn test_append_revision_rejects_bad_checksum() {
        let mut j = job();
        let mut bytes = chunk(1, 0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            j.append_revision(bytes),
            Err(SchedError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_demand_grows_by_tree_levels() {
        let mut j = job();
        assert_eq!(j.grow_demand(16), Some(1));
        assert_eq!(j.grow_demand(16), Some(3));
        assert_eq!(j.grow_demand(16), Some(7));
        assert_eq!(j.grow_demand(16), Some(15));
        assert_eq!(j.grow_demand(16), Some(16));
        assert_eq!(j.grow_demand(16), None);
    }

    #[test]
    fn test_result_notification_fires_once() {
        let mut j = job();
        j.post_result(JobResult {
            job_id: 1,
            revision: 0,
            result_code: 10,
            solution: vec![],
        });
        assert_eq!(j.take_result_notification(), Some((0, 10)));
        assert_eq!(j.take_result_notification(), None);
    }

    #[test]
    fn test_waiting_children_serviced_when_revision_arrives() {
        let mut j = job();
        j.tree_mut().set_child(4, 1);
        j.add_child_waiting_for_revision(4, 0);
        j.add_child_waiting_for_revision(9, 0); // not a child: dropped
        j.add_child_waiting_for_revision(4, 1); // future revision: kept
        assert!(j.take_serviceable_waiting_children().is_empty());

        j.append_revision(chunk(1, 0)).unwrap();
        let serviceable = j.take_serviceable_waiting_children();
        assert_eq!(serviceable, vec![(4, 0)]);
    }
}
