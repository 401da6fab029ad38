use std::collections::{BTreeMap, HashMap};

use crate::balance::{Balancer, VolumeUpdate};
use crate::comm::fabric::Rank;
use crate::comm::queue::Message;
use crate::config::Config;
use crate::data::JobRequest;
use crate::job::{Job, JobState};

/// How a node request reached this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// New growth, bounced through the fabric.
    Normal,
    /// Reactivation of a dormant node, sent directly to its rank.
    TargetedRejoin,
}

/// Outcome of an adoption decision. Adoption decisions never fail; a
/// rejection is an in-band message or a re-route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptionResult {
    AdoptFromIdle,
    AdoptReplaceCurrent { replaced_job: i32 },
    Reject,
}

/// How long a deferred request rests before it is re-bounced.
const DEFERRAL_DELAY: f32 = 1.0;
/// Grace periods for [`JobRegistry::forget_old_jobs`].
const FORGET_PAST_AFTER: f32 = 5.0;
const FORGET_IDLE_AFTER: f32 = 300.0;

/// Per-worker map of known jobs plus the auxiliary indices the scheduling
/// protocol needs: commitments, the future-epoch request buffer, parked root
/// requests, deferred requests and the volume table.
pub struct JobRegistry {
    config: Config,
    num_ranks: usize,
    jobs: HashMap<i32, Job>,
    commitments: HashMap<i32, JobRequest>,
    active_job: Option<i32>,
    balancer: Box<dyn Balancer>,
    global_epoch: i32,
    /// Requests stamped with an epoch we have not reached yet.
    future_requests: BTreeMap<i32, Vec<(RequestMode, JobRequest, Rank)>>,
    /// Fresh root requests, parked until the balancer assigns a volume.
    root_requests: HashMap<i32, JobRequest>,
    pending_root_reactivation: Option<JobRequest>,
    deferred_requests: Vec<(f32, Rank, JobRequest)>,
    volumes: HashMap<i32, (i32, i32)>,
}

impl JobRegistry {
    pub fn new(config: Config, num_ranks: usize, balancer: Box<dyn Balancer>) -> Self {
        Self {
            config,
            num_ranks,
            jobs: HashMap::new(),
            commitments: HashMap::new(),
            active_job: None,
            balancer,
            global_epoch: 0,
            future_requests: BTreeMap::new(),
            root_requests: HashMap::new(),
            pending_root_reactivation: None,
            deferred_requests: Vec::new(),
            volumes: HashMap::new(),
        }
    }

    // ---- basic access ----

    pub fn has(&self, job_id: i32) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn get(&self, job_id: i32) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: i32) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn create_job(&mut self, job_id: i32, application: crate::data::Application) -> &mut Job {
        let job = Job::new(
            job_id,
            application,
            self.config.job_cache_size,
            self.config.reactivation_scheduling,
            self.config.threads,
        );
        self.jobs.entry(job_id).or_insert(job)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn active_job_id(&self) -> Option<i32> {
        self.active_job
    }

    pub fn has_active_job(&self) -> bool {
        self.active_job.is_some()
    }

    pub fn is_busy_or_committed(&self) -> bool {
        self.active_job.is_some() || !self.commitments.is_empty()
    }

    // ---- commitments ----

    pub fn has_commitment(&self, job_id: i32) -> bool {
        self.commitments.contains_key(&job_id)
    }

    pub fn commitment(&self, job_id: i32) -> Option<&JobRequest> {
        self.commitments.get(&job_id)
    }

    /// Records the intent to fulfill `request`. Entering a second commitment
    /// for the same job is a protocol violation guarded by [`try_adopt`].
    pub fn commit(&mut self, request: JobRequest) {
        let epoch = self.global_epoch;
        let job = self
            .jobs
            .get_mut(&request.job_id)
            .expect("commit on unknown job");
        job.commit(request.clone(), epoch);
        self.commitments.insert(request.job_id, request);
    }

    /// Releases a commitment. Callers that give up on the job entirely also
    /// call [`unregister_job_from_balancer`](Self::unregister_job_from_balancer).
    pub fn uncommit(&mut self, job_id: i32) -> Option<JobRequest> {
        let request = self.commitments.remove(&job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.uncommit();
        }
        request
    }

    /// Tells the balancer this worker will not run the job after all.
    pub fn unregister_job_from_balancer(&mut self, job_id: i32) {
        self.balancer.on_job_terminated(job_id);
    }

    // ---- adoption policy ----

    /// Decides whether this worker takes on the requested tree node.
    pub fn try_adopt(&self, request: &JobRequest, mode: RequestMode, _source: Rank) -> AdoptionResult {
        if !self.commitments.is_empty() {
            return AdoptionResult::Reject;
        }

        match mode {
            RequestMode::TargetedRejoin => {
                // Only the dormant holder of exactly this node may rejoin.
                let Some(job) = self.jobs.get(&request.job_id) else {
                    return AdoptionResult::Reject;
                };
                if self.active_job.is_none()
                    && job.state() == JobState::Suspended
                    && job.index() == request.requested_node_index
                {
                    AdoptionResult::AdoptFromIdle
                } else {
                    AdoptionResult::Reject
                }
            }
            RequestMode::Normal => {
                if let Some(job) = self.jobs.get(&request.job_id) {
                    if job.state() == JobState::Past {
                        return AdoptionResult::Reject;
                    }
                }
                if self.active_job.is_none() {
                    if request.requested_node_index > 0 && self.has_dormant_root() {
                        // Becoming an inner node would make the dormant root
                        // impossible to restart seamlessly.
                        return AdoptionResult::Reject;
                    }
                    return AdoptionResult::AdoptFromIdle;
                }
                // Busy: a root request may replace a node that is about to
                // shrink away anyway.
                let active_id = self.active_job.unwrap();
                let active = &self.jobs[&active_id];
                if request.requested_node_index == 0
                    && active_id != request.job_id
                    && active.index() > 0
                    && active.volume() > 0
                    && active.index() >= active.volume()
                {
                    return AdoptionResult::AdoptReplaceCurrent {
                        replaced_job: active_id,
                    };
                }
                AdoptionResult::Reject
            }
        }
    }

    /// A request is obsolete when the job is gone, a newer revision
    /// supersedes it, or its index fell out of the volume of a past epoch.
    pub fn is_request_obsolete(&self, request: &JobRequest) -> bool {
        if let Some(job) = self.jobs.get(&request.job_id) {
            if job.state() == JobState::Past {
                return true;
            }
            if request.current_revision < job.revision() {
                return true;
            }
        }
        if request.balancing_epoch >= self.global_epoch {
            return false;
        }
        match self.known_volume(request.job_id) {
            Some(volume) => request.requested_node_index >= volume,
            None => false,
        }
    }

    /// Symmetric check for offers this worker sent out earlier.
    pub fn is_adoption_offer_obsolete(&self, request: &JobRequest) -> bool {
        let Some(job) = self.jobs.get(&request.job_id) else {
            return true;
        };
        if job.state() == JobState::Past {
            return true;
        }
        if job.volume() > 0 && request.requested_node_index >= job.volume() {
            return true;
        }
        if let Some(side) = job.tree().side_of_index(request.requested_node_index) {
            if job.tree().has_child(side) {
                return true;
            }
        }
        false
    }

    // ---- lifecycle transitions ----

    /// Begins executing a committed job as a child of `parent_rank`.
    pub fn execute(&mut self, job_id: i32, parent_rank: Rank, now: f32) {
        let num_ranks = self.num_ranks;
        let (is_root, demand) = {
            let job = self.jobs.get_mut(&job_id).expect("execute on unknown job");
            job.tree_mut().set_parent(parent_rank);
            job.activate(now);
            tracing::info!(job = %job, parent_rank, "executing job");
            let is_root = job.tree().is_root();
            let demand = if is_root { job.grow_demand(num_ranks) } else { None };
            (is_root, demand)
        };
        self.active_job = Some(job_id);
        if is_root {
            self.balancer
                .on_job_activated(job_id, demand.unwrap_or(1));
        }
    }

    /// Resumes a suspended node at its previous index.
    pub fn reactivate(&mut self, job_id: i32, parent_rank: Rank, now: f32) {
        let job = self.jobs.get_mut(&job_id).expect("reactivate on unknown job");
        job.tree_mut().set_parent(parent_rank);
        job.resume(now);
        tracing::info!(job = %job, parent_rank, "reactivated job");
        self.active_job = Some(job_id);
    }

    pub fn suspend(&mut self, job_id: i32, now: f32) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.suspend(now);
            tracing::info!(job = %job, "suspended job");
        }
        if self.active_job == Some(job_id) {
            self.active_job = None;
        }
    }

    pub fn terminate(&mut self, job_id: i32, now: f32) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.terminate(now);
            tracing::info!(job = %job, "terminated job");
        }
        if self.active_job == Some(job_id) {
            self.active_job = None;
        }
        self.commitments.remove(&job_id);
        self.root_requests.remove(&job_id);
        self.volumes.remove(&job_id);
        self.balancer.on_job_terminated(job_id);
    }

    /// Whether the job at `job_id`'s root hit a per-job resource limit.
    /// Checked only by the root of the job.
    pub fn check_computation_limits(&mut self, job_id: i32, now: f32) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        job.update_volume_and_used_cpu(job.volume(), now);
        let wallclock = self.config.job_wallclock_limit;
        if wallclock > 0.0 && job.age_since_activation(now) > wallclock {
            tracing::warn!(job = %job, limit = wallclock, "job wall-clock limit hit");
            return true;
        }
        let cpu = self.config.job_cpu_limit;
        if cpu > 0.0 && job.used_cpu_seconds() > cpu {
            tracing::warn!(job = %job, limit = cpu, "job CPU limit hit");
            return true;
        }
        false
    }

    /// Evicts long-idle entries to bound memory. Active, committed and
    /// recently touched jobs are kept; suspended nodes are kept as rejoin
    /// targets until they idle out.
    pub fn forget_old_jobs(&mut self, now: f32) {
        let commitments = &self.commitments;
        let active = self.active_job;
        self.jobs.retain(|id, job| {
            if Some(*id) == active || commitments.contains_key(id) {
                return true;
            }
            match job.state() {
                JobState::Past => now - job.last_interaction() <= FORGET_PAST_AFTER,
                JobState::Inactive | JobState::Suspended => {
                    now - job.last_interaction() <= FORGET_IDLE_AFTER
                }
                JobState::Active => true,
            }
        });
    }

    // ---- dormant state queries ----

    pub fn has_dormant_job(&self, job_id: i32) -> bool {
        self.jobs
            .get(&job_id)
            .is_some_and(|j| j.state() == JobState::Suspended)
    }

    pub fn has_dormant_root(&self) -> bool {
        self.jobs
            .values()
            .any(|j| j.state() == JobState::Suspended && j.tree().is_root())
    }

    /// In reactivation scheduling, fresh normal adoptions are refused while
    /// any inactive node still waits for a reactivation response.
    pub fn has_inactive_jobs_waiting_for_reactivation(&self) -> bool {
        self.jobs
            .values()
            .any(|j| j.state() != JobState::Active && j.tree().is_waiting_for_reactivation())
    }

    // ---- request buffers ----

    /// Buffers a request stamped with an epoch ahead of ours; replayed once
    /// balancing catches up.
    pub fn add_future_request(&mut self, mode: RequestMode, request: JobRequest, source: Rank) {
        self.future_requests
            .entry(request.balancing_epoch)
            .or_default()
            .push((mode, request, source));
    }

    /// Requests whose epoch has become the present (or past), in epoch order.
    pub fn drain_arrived_future_requests(&mut self) -> Vec<(RequestMode, JobRequest, Rank)> {
        let epoch = self.global_epoch;
        let arrived: Vec<i32> = self
            .future_requests
            .range(..=epoch)
            .map(|(&e, _)| e)
            .collect();
        let mut out = Vec::new();
        for e in arrived {
            out.extend(self.future_requests.remove(&e).unwrap());
        }
        out
    }

    pub fn add_root_request(&mut self, request: JobRequest) {
        self.balancer.on_job_activated(request.job_id, 1);
        self.root_requests.insert(request.job_id, request);
    }

    pub fn take_root_request(&mut self, job_id: i32) -> Option<JobRequest> {
        self.root_requests.remove(&job_id)
    }

    pub fn set_pending_root_reactivation(&mut self, request: JobRequest) {
        self.pending_root_reactivation = Some(request);
    }

    pub fn take_pending_root_reactivation(&mut self) -> Option<JobRequest> {
        self.pending_root_reactivation.take()
    }

    pub fn defer_request(&mut self, now: f32, sender: Rank, request: JobRequest) {
        self.deferred_requests.push((now, sender, request));
    }

    /// Deferred requests whose rest period elapsed, ready to re-bounce.
    pub fn take_deferred_requests(&mut self, now: f32) -> Vec<(Rank, JobRequest)> {
        let mut ready = Vec::new();
        self.deferred_requests.retain(|&(deferred_at, sender, ref req)| {
            if now - deferred_at >= DEFERRAL_DELAY {
                ready.push((sender, req.clone()));
                false
            } else {
                true
            }
        });
        ready
    }

    // ---- balancing ----

    pub fn global_balancing_epoch(&self) -> i32 {
        self.global_epoch
    }

    pub fn known_volume(&self, job_id: i32) -> Option<i32> {
        self.volumes.get(&job_id).map(|&(v, _)| v)
    }

    pub fn balancer_mut(&mut self) -> &mut dyn Balancer {
        self.balancer.as_mut()
    }

    pub fn handle_balancing_message(&mut self, msg: &mut Message) {
        self.balancer.handle_message(msg);
    }

    /// Steps the balancer. Returns the concluded volume updates and whether
    /// the global epoch advanced (in which case buffered future requests are
    /// due for replay).
    pub fn advance_balancing(&mut self, now: f32) -> (Vec<VolumeUpdate>, bool) {
        let updates = self.balancer.advance(now);
        for update in &updates {
            self.volumes
                .insert(update.job_id, (update.volume, update.epoch));
        }
        let epoch = self.balancer.epoch();
        let advanced = epoch > self.global_epoch;
        if advanced {
            self.global_epoch = epoch;
        }
        (updates, advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::NullBalancer;
    use crate::data::Application;

    fn registry() -> JobRegistry {
        JobRegistry::new(Config::default(), 8, Box::<NullBalancer>::default())
    }

    fn request(job_id: i32, index: i32, epoch: i32) -> JobRequest {
        JobRequest::new(job_id, Application::Dummy, 0, 1, index, 0.0, epoch, 0)
    }

    #[test]
    fn test_idle_worker_adopts() {
        let mut reg = registry();
        let req = request(1, 2, 0);
        assert_eq!(
            reg.try_adopt(&req, RequestMode::Normal, 1),
            AdoptionResult::AdoptFromIdle
        );
        reg.create_job(1, Application::Dummy);
        reg.commit(req.clone());
        assert!(reg.is_busy_or_committed());
        // A second request is rejected while the commitment stands.
        assert_eq!(
            reg.try_adopt(&request(2, 0, 0), RequestMode::Normal, 1),
            AdoptionResult::Reject
        );
        reg.uncommit(1);
        assert!(!reg.is_busy_or_committed());
    }

    #[test]
    fn test_targeted_rejoin_requires_matching_dormant_node() {
        let mut reg = registry();
        reg.create_job(1, Application::Dummy);
        reg.commit(request(1, 2, 0));
        reg.uncommit(1);
        reg.execute(1, 0, 0.0);
        reg.suspend(1, 1.0);

        assert_eq!(
            reg.try_adopt(&request(1, 2, 1), RequestMode::TargetedRejoin, 0),
            AdoptionResult::AdoptFromIdle
        );
        // Wrong index: this worker never held node 5.
        assert_eq!(
            reg.try_adopt(&request(1, 5, 1), RequestMode::TargetedRejoin, 0),
            AdoptionResult::Reject
        );
        // Unknown job.
        assert_eq!(
            reg.try_adopt(&request(9, 2, 1), RequestMode::TargetedRejoin, 0),
            AdoptionResult::Reject
        );
    }

    #[test]
    fn test_root_request_replaces_node_about_to_shrink() {
        let mut reg = registry();
        reg.create_job(1, Application::Dummy);
        reg.commit(request(1, 3, 0));
        reg.uncommit(1);
        reg.execute(1, 0, 0.0);
        reg.get_mut(1).unwrap().update_volume_and_used_cpu(2, 0.1);

        // Index 3 >= volume 2: a root request may replace it.
        assert_eq!(
            reg.try_adopt(&request(7, 0, 1), RequestMode::Normal, 4),
            AdoptionResult::AdoptReplaceCurrent { replaced_job: 1 }
        );
        // A non-root request may not.
        assert_eq!(
            reg.try_adopt(&request(7, 2, 1), RequestMode::Normal, 4),
            AdoptionResult::Reject
        );
    }

    #[test]
    fn test_request_obsolescence() {
        let mut reg = registry();
        // Unknown epoch/volume: not obsolete.
        assert!(!reg.is_request_obsolete(&request(1, 5, 0)));

        reg.global_epoch = 3;
        reg.volumes.insert(1, (4, 3));
        // Past epoch and index outside the volume: obsolete.
        assert!(reg.is_request_obsolete(&request(1, 5, 2)));
        // Past epoch but index within the volume: still valid.
        assert!(!reg.is_request_obsolete(&request(1, 2, 2)));
        // Current epoch: never obsolete by volume.
        assert!(!reg.is_request_obsolete(&request(1, 5, 3)));

        // Terminated jobs make any request obsolete.
        reg.create_job(2, Application::Dummy);
        reg.terminate(2, 0.0);
        assert!(reg.is_request_obsolete(&request(2, 0, 3)));
    }

    #[test]
    fn test_future_requests_replay_in_epoch_order() {
        let mut reg = registry();
        reg.add_future_request(RequestMode::Normal, request(1, 1, 5), 2);
        reg.add_future_request(RequestMode::Normal, request(2, 1, 4), 3);
        assert!(reg.drain_arrived_future_requests().is_empty());

        reg.global_epoch = 4;
        let drained = reg.drain_arrived_future_requests();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.job_id, 2);

        reg.global_epoch = 5;
        let drained = reg.drain_arrived_future_requests();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.job_id, 1);
    }

    #[test]
    fn test_deferred_requests_rest_before_replay() {
        let mut reg = registry();
        reg.defer_request(10.0, 3, request(1, 1, 0));
        assert!(reg.take_deferred_requests(10.5).is_empty());
        let ready = reg.take_deferred_requests(11.1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 3);
        assert!(reg.take_deferred_requests(12.0).is_empty());
    }

    #[test]
    fn test_forget_old_jobs_keeps_live_entries() {
        let mut reg = registry();
        reg.create_job(1, Application::Dummy);
        reg.commit(request(1, 0, 0));
        reg.uncommit(1);
        reg.execute(1, 0, 0.0);

        reg.create_job(2, Application::Dummy);
        reg.terminate(2, 0.0);

        reg.forget_old_jobs(100.0);
        assert!(reg.has(1), "active job must survive");
        assert!(!reg.has(2), "long-terminated job must be evicted");
    }

    #[test]
    fn test_dormant_root_blocks_inner_node_adoption() {
        let mut reg = registry();
        reg.create_job(1, Application::Dummy);
        reg.commit(request(1, 0, 0));
        reg.uncommit(1);
        reg.execute(1, 0, 0.0);
        reg.suspend(1, 1.0);
        assert!(reg.has_dormant_root());

        assert_eq!(
            reg.try_adopt(&request(2, 3, 1), RequestMode::Normal, 4),
            AdoptionResult::Reject
        );
        // Root requests remain adoptable.
        assert_eq!(
            reg.try_adopt(&request(2, 0, 1), RequestMode::Normal, 4),
            AdoptionResult::AdoptFromIdle
        );
    }
}
