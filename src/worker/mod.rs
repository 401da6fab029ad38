//! The worker loop: one process-wide loop per rank that drives the message
//! queue, evaluates periodic task gates and reacts to every scheduling
//! message of the platform.

pub mod stats;
pub mod timers;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::balance::{Balancer, MonoBalancer, NullBalancer};
use crate::comm::fabric::{Fabric, Rank};
use crate::comm::queue::{Message, MessageQueue};
use crate::comm::tags::{self, Tag};
use crate::config::Config;
use crate::data::serialize::peek_i32;
use crate::data::{
    Application, DescriptionChunk, IntPair, IntVec, JobRequest, JobResult, JobStatistics,
    OneshotJobRequestRejection, Serializable,
};
use crate::error::fatal;
use crate::job::scheduler::SchedulerAction;
use crate::job::tree::Side;
use crate::job::{AdoptionResult, JobRegistry, JobState, RequestMode};
use crate::routing::collective::NodeStatus;
use crate::routing::{CollectiveAssignment, RequestRouter, RouteDecision};
use crate::shutdown::{Terminator, Watchdog};
use stats::SysState;
use timers::{Clock, PeriodicGate};

const MAIN_LOOP_SLEEP: Duration = Duration::from_millis(1);

/// Periodic task gates of the worker loop, in wall-clock seconds.
struct Gates {
    stats: PeriodicGate,
    big_stats: PeriodicGate,
    balance: PeriodicGate,
    maintenance: PeriodicGate,
    job: PeriodicGate,
}

impl Gates {
    fn new() -> Self {
        Self {
            stats: PeriodicGate::new(1.0),
            big_stats: PeriodicGate::new(10.0),
            balance: PeriodicGate::new(0.1),
            maintenance: PeriodicGate::new(1.0),
            job: PeriodicGate::new(0.01),
        }
    }
}

fn parse<T: Serializable>(msg: &Message) -> T {
    match T::deserialize(&msg.payload) {
        Ok(value) => value,
        Err(err) => fatal(err),
    }
}

/// One worker process: owns all job state of its rank and drives it forward.
pub struct Worker {
    rank: Rank,
    core: Rc<RefCell<WorkerCore>>,
    queue: MessageQueue,
    clock: Clock,
    watchdog: Watchdog,
    terminator: Terminator,
    time_limit: f32,
}

impl Worker {
    /// Builds a worker with the balancer implied by the configuration:
    /// mono mode pins the single job to the full cluster, otherwise volumes
    /// arrive via explicit messages only.
    pub fn new(fabric: Box<dyn Fabric>, config: Config, terminator: Terminator) -> Self {
        let num_ranks = fabric.num_ranks();
        let balancer: Box<dyn Balancer> = if config.mono.is_some() {
            Box::new(MonoBalancer::new(num_ranks))
        } else {
            Box::<NullBalancer>::default()
        };
        Self::with_balancer(fabric, config, terminator, balancer)
    }

    pub fn with_balancer(
        fabric: Box<dyn Fabric>,
        config: Config,
        terminator: Terminator,
        balancer: Box<dyn Balancer>,
    ) -> Self {
        let rank = fabric.rank();
        let num_ranks = fabric.num_ranks();
        let clock = Clock::new();
        let queue = MessageQueue::new(fabric, config.max_msg_size);
        let watchdog = Watchdog::start(config.watchdog_abort_millis);
        let registry = JobRegistry::new(config.clone(), num_ranks, balancer);
        let router = RequestRouter::new(&config, rank, num_ranks);
        let coll_assign = config
            .collective_assignment_enabled()
            .then(|| CollectiveAssignment::new(rank));
        let time_limit = config.time_limit;

        let core = Rc::new(RefCell::new(WorkerCore {
            config,
            rank,
            num_ranks,
            clock,
            registry,
            router,
            coll_assign,
            client_descriptions: HashMap::new(),
            client_results: HashMap::new(),
            sys_state: SysState::default(),
            gates: Gates::new(),
            terminator: terminator.clone(),
        }));

        let worker = Self {
            rank,
            core,
            queue,
            clock,
            watchdog,
            terminator,
            time_limit,
        };
        worker.init();
        worker
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Registers all tag callbacks and performs warm-up sends.
    fn init(&self) {
        let q = &self.queue;

        macro_rules! register {
            ($tag:expr, $handler:ident) => {{
                let core = Rc::clone(&self.core);
                let weak = q.downgrade();
                q.register_callback($tag, move |msg: &mut Message| {
                    let q = weak.upgrade().expect("queue gone during dispatch");
                    core.borrow_mut().$handler(&q, msg);
                });
            }};
        }

        register!(tags::WARMUP, handle_warmup);
        register!(tags::QUERY_VOLUME, handle_query_volume);
        register!(tags::REQUEST_NODE, handle_request_node_normal);
        register!(tags::REQUEST_NODE_ONESHOT, handle_request_node_oneshot);
        register!(tags::OFFER_ADOPTION, handle_offer_adoption);
        register!(tags::ANSWER_ADOPTION_OFFER, handle_answer_adoption_offer);
        register!(tags::REJECT_ONESHOT, handle_reject_oneshot);
        register!(tags::SEND_JOB_DESCRIPTION, handle_send_job_description);
        register!(tags::QUERY_JOB_DESCRIPTION, handle_query_job_description);
        register!(tags::NOTIFY_VOLUME_UPDATE, handle_notify_volume_update);
        register!(tags::NOTIFY_NODE_LEAVING_JOB, handle_notify_node_leaving_job);
        register!(tags::NOTIFY_RESULT_FOUND, handle_notify_result_found);
        register!(tags::NOTIFY_RESULT_OBSOLETE, handle_notify_result_obsolete);
        register!(tags::NOTIFY_JOB_ABORTING, handle_notify_job_aborting);
        register!(tags::NOTIFY_JOB_TERMINATING, handle_notify_job_terminating);
        register!(tags::INTERRUPT, handle_interrupt);
        register!(tags::INCREMENTAL_JOB_FINISHED, handle_incremental_job_finished);
        register!(tags::SEND_APPLICATION_MESSAGE, handle_send_application_message);
        register!(tags::QUERY_JOB_RESULT, handle_query_job_result);
        register!(tags::SEND_JOB_RESULT, handle_send_job_result);
        register!(tags::NOTIFY_JOB_DONE, handle_notify_job_done);
        register!(tags::NOTIFY_CLIENT_JOB_ABORTING, handle_notify_client_job_aborting);
        register!(tags::SCHED_RELEASE_FROM_WAITING, handle_sched_release_from_waiting);
        register!(tags::SCHED_NODE_STATUS, handle_sched_node_status);
        register!(tags::NOTIFY_ASSIGNMENT_UPDATE, handle_assignment_update);
        register!(tags::DO_EXIT, handle_do_exit);

        // Warm up the bounce edges so first requests do not pay connection
        // setup costs on the real transport.
        let core = self.core.borrow();
        if core.config.derandomize() && core.config.warmup {
            let payload = Arc::new(IntVec(vec![1, 2, 3, 4, 5, 6, 7, 8]).serialize());
            for &rank in core.router.bounce_alternatives() {
                tracing::debug!(rank, "sending warmup message");
                q.send(payload.clone(), rank, tags::WARMUP);
            }
        }
    }

    /// Runs the worker until termination or the global time limit.
    pub fn run(&mut self) {
        tracing::info!(rank = self.rank, "worker up");
        loop {
            let now = self.clock.now();
            if self.terminator.is_terminating() {
                break;
            }
            if self.time_limit > 0.0 && now > self.time_limit {
                tracing::info!(rank = self.rank, "time limit reached, terminating");
                self.terminator.terminate();
                break;
            }
            self.watchdog.reset();
            self.queue.advance();
            self.core.borrow_mut().advance(&self.queue, now);
            std::thread::sleep(MAIN_LOOP_SLEEP);
        }
        tracing::info!(rank = self.rank, "worker down");
    }

    /// One deterministic step, used by the test harness: drives the queue and
    /// the periodic gates at an externally supplied time.
    pub fn advance_once(&self, now: f32) {
        self.watchdog.reset();
        self.queue.advance();
        self.core.borrow_mut().advance(&self.queue, now);
    }

    /// Acts as the client for a new job: keeps the description for later
    /// queries and routes a root request into the system (starting at this
    /// worker itself).
    pub fn submit_root_job(&self, job_id: i32, application: Application, payload: Vec<u8>) {
        let mut core = self.core.borrow_mut();
        let chunk = DescriptionChunk::new(job_id, 0, payload);
        core.client_descriptions
            .entry(job_id)
            .or_default()
            .push(Arc::new(chunk.serialize()));
        let request = JobRequest::new(
            job_id,
            application,
            self.rank,
            self.rank,
            0,
            core.clock.now(),
            core.registry.global_balancing_epoch(),
            0,
        );
        tracing::info!(request = %request, "submitting job");
        self.queue
            .send(Arc::new(request.serialize()), self.rank, tags::REQUEST_NODE);
    }

    // ---- introspection for tests and the binary ----

    pub fn job_state(&self, job_id: i32) -> Option<JobState> {
        self.core.borrow().registry.get(job_id).map(|j| j.state())
    }

    pub fn job_index(&self, job_id: i32) -> Option<i32> {
        self.core.borrow().registry.get(job_id).map(|j| j.index())
    }

    pub fn job_volume(&self, job_id: i32) -> Option<i32> {
        self.core.borrow().registry.get(job_id).map(|j| j.volume())
    }

    pub fn job_parent_rank(&self, job_id: i32) -> Option<Rank> {
        self.core
            .borrow()
            .registry
            .get(job_id)
            .map(|j| j.tree().parent_rank())
    }

    pub fn job_children(&self, job_id: i32) -> Option<(Option<Rank>, Option<Rank>)> {
        self.core
            .borrow()
            .registry
            .get(job_id)
            .map(|j| (j.tree().child_rank(Side::Left), j.tree().child_rank(Side::Right)))
    }

    pub fn has_commitment(&self, job_id: i32) -> bool {
        self.core.borrow().registry.has_commitment(job_id)
    }

    pub fn is_busy_or_committed(&self) -> bool {
        self.core.borrow().registry.is_busy_or_committed()
    }

    pub fn job_dormant_children(&self, job_id: i32) -> Vec<Rank> {
        self.core
            .borrow()
            .registry
            .get(job_id)
            .map(|j| j.tree().dormant_children().collect())
            .unwrap_or_default()
    }

    pub fn job_waiting_for_reactivation(&self, job_id: i32) -> bool {
        self.core
            .borrow()
            .registry
            .get(job_id)
            .is_some_and(|j| j.tree().is_waiting_for_reactivation())
    }

    /// Client-side escape hatch: sends an arbitrary message from this rank.
    pub fn send_message(&self, dest: Rank, tag: Tag, payload: Vec<u8>) {
        self.queue.send(Arc::new(payload), dest, tag);
    }

    /// The result this worker received in its client role, if any.
    pub fn client_result(&self, job_id: i32) -> Option<JobResult> {
        self.core.borrow().client_results.get(&job_id).cloned()
    }

    /// Application-layer hook: marks the local node's revision as solved.
    pub fn post_result(&self, job_id: i32, result: JobResult) {
        if let Some(job) = self.core.borrow_mut().registry.get_mut(job_id) {
            job.post_result(result);
        }
    }
}

struct WorkerCore {
    config: Config,
    rank: Rank,
    num_ranks: usize,
    clock: Clock,
    registry: JobRegistry,
    router: RequestRouter,
    coll_assign: Option<CollectiveAssignment>,
    /// Client role: per submitted job, its serialized description revisions.
    client_descriptions: HashMap<i32, Vec<Arc<Vec<u8>>>>,
    /// Client role: results received for submitted jobs.
    client_results: HashMap<i32, JobResult>,
    sys_state: SysState,
    gates: Gates,
    terminator: Terminator,
}

impl WorkerCore {
    // ================= periodic tasks =================

    fn advance(&mut self, q: &MessageQueue, now: f32) {
        if self.gates.stats.ready(now) {
            self.refresh_load_stats();
            self.sys_state.emit(self.rank);
            if self.gates.big_stats.ready(now) {
                self.dump_job_layouts();
            }
        }

        if self.gates.balance.ready(now) {
            self.balancing_tick(q, now);
        }

        if self.gates.maintenance.ready(now) {
            self.registry.forget_old_jobs(now);
            for (sender, request) in self.registry.take_deferred_requests(now) {
                self.bounce_job_request(q, request, sender);
            }
        }

        if self.gates.job.ready(now) {
            self.job_tick(q, now);
        }
    }

    fn refresh_load_stats(&mut self) {
        if let Some(job_id) = self.registry.active_job_id() {
            self.sys_state.busy_ratio = 1.0;
            self.sys_state.committed_ratio = 0.0;
            let is_root = self
                .registry
                .get(job_id)
                .map(|j| j.tree().is_root())
                .unwrap_or(false);
            self.sys_state.num_jobs = if is_root { 1 } else { 0 };
        } else if self.registry.is_busy_or_committed() {
            self.sys_state.busy_ratio = 1.0;
            self.sys_state.committed_ratio = 1.0;
            self.sys_state.num_jobs = 0;
        } else {
            self.sys_state.busy_ratio = 0.0;
            self.sys_state.committed_ratio = 0.0;
            self.sys_state.num_jobs = 0;
        }
    }

    fn dump_job_layouts(&self) {
        for job in self.registry.jobs() {
            tracing::debug!(
                job = %job,
                state = %job.state(),
                volume = job.volume(),
                parent = job.tree().parent_rank(),
                left = ?job.tree().child_rank(Side::Left),
                right = ?job.tree().child_rank(Side::Right),
                "job layout"
            );
        }
    }

    fn balancing_tick(&mut self, q: &MessageQueue, now: f32) {
        let (updates, epoch_advanced) = self.registry.advance_balancing(now);
        for update in updates {
            self.update_volume(q, update.job_id, update.volume, update.epoch, update.event_latency);
        }
        if epoch_advanced {
            // Requests from a "future epoch" have become the present.
            for (mode, request, source) in self.registry.drain_arrived_future_requests() {
                let mut msg = Message {
                    source,
                    tag: tags::REQUEST_NODE,
                    payload: request.serialize(),
                };
                self.handle_request_node(q, &mut msg, mode);
            }
        }

        if let Some(ca) = self.coll_assign.as_mut() {
            let idle = !self.registry.is_busy_or_committed();
            let step = ca.advance(self.registry.global_balancing_epoch(), idle);
            if let Some((parent, status)) = step.upward {
                q.send(Arc::new(status.serialize()), parent, tags::SCHED_NODE_STATUS);
            }
            for (rank, request) in step.assignments {
                q.send(
                    Arc::new(request.serialize()),
                    rank,
                    tags::NOTIFY_ASSIGNMENT_UPDATE,
                );
            }
        }
    }

    fn job_tick(&mut self, q: &MessageQueue, now: f32) {
        // A deferred root reactivation may be adoptable by now.
        if let Some(request) = self.registry.take_pending_root_reactivation() {
            let mut msg = Message {
                source: self.rank,
                tag: tags::REQUEST_NODE,
                payload: request.serialize(),
            };
            self.handle_request_node(q, &mut msg, RequestMode::Normal);
        }

        let Some(job_id) = self.registry.active_job_id() else {
            return;
        };
        let is_root = self
            .registry
            .get(job_id)
            .map(|j| j.tree().is_root())
            .unwrap_or(false);

        if is_root && self.registry.check_computation_limits(job_id, now) {
            self.timeout_job(q, job_id);
            return;
        }

        let mut result_notification = None;
        let mut demand_update = None;
        let mut serviceable = Vec::new();
        let mut over_volume = None;
        {
            let num_ranks = self.num_ranks;
            let Some(job) = self.registry.get_mut(job_id) else {
                return;
            };
            if job.state() != JobState::Active {
                return;
            }
            if let Some((revision, result_code)) = job.take_result_notification() {
                result_notification = Some((job.tree().root_rank(), revision, result_code));
                job.set_result_transfer_pending(true);
            }
            if is_root {
                if let Some(demand) = job.grow_demand(num_ranks) {
                    demand_update = Some(demand);
                }
            }
            serviceable = job.take_serviceable_waiting_children();
            // Volume invariant: an active node beyond the volume suspends
            // within one job tick.
            if job.index() > 0 && job.volume() > 0 && job.index() >= job.volume() {
                over_volume = Some((job.tree().parent_rank(), job.index(), job.tree().root_rank()));
            }
        }

        if let Some((root_rank, revision, result_code)) = result_notification {
            tracing::info!(job_id, revision, result_code, root_rank, "sending finished info");
            q.send(
                Arc::new(IntVec(vec![job_id, revision, result_code]).serialize()),
                root_rank,
                tags::NOTIFY_RESULT_FOUND,
            );
        }
        if let Some(demand) = demand_update {
            self.registry.balancer_mut().on_demand_update(job_id, demand);
        }
        for (rank, revision) in serviceable {
            self.send_revision_description(q, job_id, revision, rank);
        }
        if let Some((parent, index, root_rank)) = over_volume {
            tracing::info!(job_id, index, "suspending over-volume node");
            self.registry.suspend(job_id, now);
            if !self.config.reactivation_scheduling {
                q.send(
                    Arc::new(IntVec(vec![job_id, index, root_rank]).serialize()),
                    parent,
                    tags::NOTIFY_NODE_LEAVING_JOB,
                );
            }
        }
    }

    // ================= request routing =================

    fn bounce_job_request(&mut self, q: &MessageQueue, mut request: JobRequest, sender: Rank) {
        self.sys_state.num_hops += 1;
        match self.router.next_hop(&mut request, sender) {
            RouteDecision::Forward(next) => {
                tracing::trace!(request = %request, next, "hop");
                q.send(Arc::new(request.serialize()), next, tags::REQUEST_NODE);
            }
            RouteDecision::Collective => {
                self.coll_assign
                    .as_mut()
                    .expect("collective assignment enabled")
                    .add_request(request);
            }
        }
    }

    fn spawn_job_request(&mut self, q: &MessageQueue, job_id: i32, side: Side, epoch: i32) {
        let now = self.clock.now();
        let my_rank = self.rank;
        let (request, oneshot_dest, index) = {
            let Some(job) = self.registry.get_mut(job_id) else {
                return;
            };
            let index = job.tree().child_index(side);
            let mut request = JobRequest::new(
                job_id,
                job.application(),
                job.tree().root_rank(),
                my_rank,
                index,
                now,
                epoch,
                0,
            );
            request.current_revision = job.desired_revision().max(0);
            let exclude: Vec<Rank> = Side::BOTH
                .into_iter()
                .filter_map(|s| job.tree().child_rank(s))
                .collect();
            let dormant = job.tree_mut().next_dormant_child(&exclude);
            job.tree_mut().set_desire(side, now);
            (request, dormant, index)
        };

        self.sys_state.spawned_requests += 1;
        self.sys_state.num_desires += 1;

        match oneshot_dest {
            Some(rank) => {
                tracing::debug!(request = %request, rank, "querying dormant child");
                q.send(Arc::new(request.serialize()), rank, tags::REQUEST_NODE_ONESHOT);
            }
            None if self.config.mono.is_some() && (index as usize) < self.num_ranks => {
                // Mono mode keeps the tree permutation at identity.
                q.send(Arc::new(request.serialize()), index, tags::REQUEST_NODE);
            }
            None => self.bounce_job_request(q, request, my_rank),
        }
    }

    fn perform_scheduler_action(&mut self, q: &MessageQueue, job_id: i32, action: SchedulerAction) {
        match action {
            SchedulerAction::TargetedRejoin { dest, request } => {
                self.sys_state.spawned_requests += 1;
                self.sys_state.num_desires += 1;
                tracing::debug!(request = %request, dest, "targeted rejoin");
                q.send(Arc::new(request.serialize()), dest, tags::REQUEST_NODE_ONESHOT);
            }
            SchedulerAction::NormalRequest { request } => {
                self.sys_state.spawned_requests += 1;
                self.sys_state.num_desires += 1;
                let my_rank = self.rank;
                self.bounce_job_request(q, request, my_rank);
            }
            SchedulerAction::ReleaseFromWaiting { dest, epoch } => {
                q.send(
                    Arc::new(IntPair(job_id, epoch).serialize()),
                    dest,
                    tags::SCHED_RELEASE_FROM_WAITING,
                );
            }
        }
    }

    // ================= message handlers =================

    fn handle_request_node_normal(&mut self, q: &MessageQueue, msg: &mut Message) {
        self.handle_request_node(q, msg, RequestMode::Normal);
    }

    fn handle_request_node_oneshot(&mut self, q: &MessageQueue, msg: &mut Message) {
        self.handle_request_node(q, msg, RequestMode::TargetedRejoin);
    }

    fn handle_assignment_update(&mut self, q: &MessageQueue, msg: &mut Message) {
        self.handle_request_node(q, msg, RequestMode::Normal);
    }

    fn handle_request_node(&mut self, q: &MessageQueue, msg: &mut Message, mode: RequestMode) {
        let request: JobRequest = parse(msg);
        let now = self.clock.now();

        if self.registry.is_request_obsolete(&request) {
            tracing::debug!(request = %request, source = msg.source, ?mode, "discarding obsolete request");
            self.mark_collective_dirty();
            return;
        }

        if request.requested_node_index == 0 && request.num_hops == 0 {
            // Fresh new job: parked until the balancer assigns it a volume.
            self.registry.add_root_request(request);
            return;
        }

        if request.balancing_epoch > self.registry.global_balancing_epoch() {
            self.registry.add_future_request(mode, request, msg.source);
            return;
        }

        let mut forced = None;
        if self.config.reactivation_scheduling {
            if mode == RequestMode::TargetedRejoin {
                // The scheduling for this epoch has reached us; we are no
                // longer left waiting.
                if let Some(job) = self.registry.get_mut(request.job_id) {
                    job.tree_mut()
                        .stop_waiting_for_reactivation(request.balancing_epoch);
                }
                self.mark_collective_dirty();
            } else if self.registry.has_inactive_jobs_waiting_for_reactivation() {
                // Ordering: no fresh adoptions while a reactivation response
                // is outstanding.
                forced = Some(AdoptionResult::Reject);
            }
        }
        let adoption = forced.unwrap_or_else(|| self.registry.try_adopt(&request, mode, msg.source));

        match adoption {
            AdoptionResult::AdoptFromIdle | AdoptionResult::AdoptReplaceCurrent { .. } => {
                if let AdoptionResult::AdoptReplaceCurrent { replaced_job } = adoption {
                    let leaving = self.registry.get(replaced_job).map(|job| {
                        (
                            job.tree().parent_rank(),
                            IntVec(vec![replaced_job, job.index(), job.tree().root_rank()])
                                .serialize(),
                        )
                    });
                    if let Some((parent, payload)) = leaving {
                        q.send(Arc::new(payload), parent, tags::NOTIFY_NODE_LEAVING_JOB);
                    }
                    self.registry.suspend(replaced_job, now);
                }

                tracing::info!(request = %request, source = msg.source, ?mode, "adopting");
                if !self.registry.has(request.job_id) {
                    self.registry.create_job(request.job_id, request.application);
                }
                let requesting_rank = request.requesting_node_rank;
                self.registry.commit(request.clone());
                q.send(
                    Arc::new(request.serialize()),
                    requesting_rank,
                    tags::OFFER_ADOPTION,
                );
            }
            AdoptionResult::Reject => {
                let holds_dormant_root = self
                    .registry
                    .get(request.job_id)
                    .is_some_and(|j| j.tree().is_root() && j.state() == JobState::Suspended);
                if request.requested_node_index == 0 && holds_dormant_root {
                    // We hold this job's dormant root but cannot adopt right
                    // now; retry from the job tick.
                    tracing::debug!(request = %request, "deferring pending root reactivation");
                    self.registry.set_pending_root_reactivation(request);
                } else if mode == RequestMode::TargetedRejoin {
                    let rejection = OneshotJobRequestRejection {
                        is_child_still_dormant: self.registry.has_dormant_job(request.job_id),
                        request,
                    };
                    tracing::debug!(
                        request = %rejection.request,
                        dest = msg.source,
                        "rejecting oneshot request"
                    );
                    q.send(
                        Arc::new(rejection.serialize()),
                        msg.source,
                        tags::REJECT_ONESHOT,
                    );
                } else if self.registry.has_commitment(request.job_id) {
                    // Racing request for a job we are committed to: whether it
                    // stays valid depends on how the commitment resolves.
                    // Rest it and re-bounce from the maintenance tick.
                    self.registry.defer_request(now, msg.source, request);
                } else {
                    self.bounce_job_request(q, request, msg.source);
                }
            }
        }
    }

    fn handle_offer_adoption(&mut self, q: &MessageQueue, msg: &mut Message) {
        let request: JobRequest = parse(msg);
        let now = self.clock.now();
        tracing::debug!(request = %request, source = msg.source, "adoption offer");

        let mut accept = false;
        if request.requested_node_index == 0 {
            // Offers for the root go to the submitting client.
            accept = self.client_descriptions.contains_key(&request.job_id);
        } else if self.registry.has(request.job_id)
            && !self.registry.is_adoption_offer_obsolete(&request)
        {
            let (accepted, desire) = {
                let job = self.registry.get_mut(request.job_id).unwrap();
                let volume = job.volume();
                let side = job.tree().side_of_index(request.requested_node_index);
                let acceptable = match job.scheduler() {
                    Some(s) => s.accepts_child(job.tree(), volume, request.requested_node_index),
                    None => side.is_some_and(|s| !job.tree().has_child(s)),
                };
                if acceptable {
                    let desire = side.and_then(|s| job.tree().desire(s));
                    job.tree_mut()
                        .set_child(msg.source, request.requested_node_index);
                    job.touch(now);
                    (true, desire)
                } else {
                    (false, None)
                }
            };
            accept = accepted;
            if let Some(desired_at) = desire {
                self.sys_state.num_fulfilled_desires += 1;
                self.sys_state.sum_desire_latencies += (now - desired_at).max(0.0);
            }
        }

        if !accept {
            tracing::debug!(request = %request, source = msg.source, "rejecting adoption offer");
        }
        q.send(
            Arc::new(IntPair(request.job_id, accept as i32).serialize()),
            msg.source,
            tags::ANSWER_ADOPTION_OFFER,
        );

        if self.config.reactivation_scheduling && request.requested_node_index > 0 {
            let mut action = None;
            if let Some(job) = self.registry.get_mut(request.job_id) {
                let volume = job.volume();
                let desired_revision = job.desired_revision();
                let my_rank = self.rank;
                let (tree, sched) = job.tree_and_scheduler_mut();
                if let Some(scheduler) = sched {
                    if accept {
                        scheduler.handle_child_joining(
                            tree,
                            msg.source,
                            request.balancing_epoch,
                            request.requested_node_index,
                        );
                    } else {
                        action = scheduler.handle_reject_reactivation(
                            tree,
                            msg.source,
                            request.balancing_epoch,
                            request.requested_node_index,
                            true,
                            volume,
                            my_rank,
                            now,
                            desired_revision,
                        );
                    }
                }
            }
            if let Some(action) = action {
                self.perform_scheduler_action(q, request.job_id, action);
            }
        }
    }

    fn handle_answer_adoption_offer(&mut self, q: &MessageQueue, msg: &mut Message) {
        let pair: IntPair = parse(msg);
        let job_id = pair.0;
        let accepted = pair.1 == 1;
        let now = self.clock.now();

        if !self.registry.has_commitment(job_id) {
            tracing::warn!(job_id, "adoption answer without a commitment");
            return;
        }
        let request = self.registry.commitment(job_id).unwrap().clone();

        if !accepted {
            tracing::debug!(job_id, source = msg.source, "adoption offer rejected, uncommitting");
            self.registry.uncommit(job_id);
            self.registry.unregister_job_from_balancer(job_id);
            return;
        }

        // Check and apply the job's current volume; the commitment may have
        // become obsolete while the offer was in flight.
        self.initiate_volume_update(q, job_id);
        if !self.registry.has_commitment(job_id) {
            tracing::debug!(job_id, "job shrunk during adoption, aborting");
            return;
        }

        let (needs_description, next_revision, has_description, state) = {
            let job = self.registry.get_mut(job_id).unwrap();
            job.set_desired_revision(request.current_revision);
            let has = job.has_description();
            let needs = !has || job.revision() < request.current_revision;
            let next = if has { job.revision() + 1 } else { 0 };
            (needs, next, has, job.state())
        };

        if needs_description {
            q.send(
                Arc::new(IntPair(job_id, next_revision).serialize()),
                msg.source,
                tags::QUERY_JOB_DESCRIPTION,
            );
        }
        if has_description {
            self.registry.uncommit(job_id);
            if state == JobState::Suspended {
                self.registry.reactivate(job_id, msg.source, now);
            } else {
                self.registry.execute(job_id, msg.source, now);
            }
        }
    }

    fn handle_reject_oneshot(&mut self, q: &MessageQueue, msg: &mut Message) {
        let rejection: OneshotJobRequestRejection = parse(msg);
        let mut request = rejection.request;
        tracing::debug!(request = %request, source = msg.source, "rejected by dormant child");

        if !self.registry.has(request.job_id) {
            return;
        }
        let now = self.clock.now();

        if self.config.reactivation_scheduling {
            let mut action = None;
            {
                let job = self.registry.get_mut(request.job_id).unwrap();
                let volume = job.volume();
                let desired_revision = job.desired_revision();
                let my_rank = self.rank;
                let (tree, sched) = job.tree_and_scheduler_mut();
                if let Some(scheduler) = sched {
                    action = scheduler.handle_reject_reactivation(
                        tree,
                        msg.source,
                        request.balancing_epoch,
                        request.requested_node_index,
                        rejection.is_child_still_dormant,
                        volume,
                        my_rank,
                        now,
                        desired_revision,
                    );
                }
            }
            if let Some(action) = action {
                self.perform_scheduler_action(q, request.job_id, action);
            }
            return;
        }

        if self.registry.is_adoption_offer_obsolete(&request) {
            return;
        }
        if !rejection.is_child_still_dormant {
            self.registry
                .get_mut(request.job_id)
                .unwrap()
                .tree_mut()
                .remove_dormant_child(msg.source);
        }

        let mut oneshot_dest = None;
        let cache_limit = (self.config.job_cache_size as i32).max(2);
        if request.num_hops <= cache_limit {
            let job = self.registry.get_mut(request.job_id).unwrap();
            let mut exclude: Vec<Rank> = Side::BOTH
                .into_iter()
                .filter_map(|s| job.tree().child_rank(s))
                .collect();
            exclude.push(msg.source);
            oneshot_dest = job.tree_mut().next_dormant_child(&exclude);
        }

        match oneshot_dest {
            Some(rank) => {
                request.num_hops += 1;
                self.sys_state.num_hops += 1;
                self.sys_state.spawned_requests += 1;
                tracing::debug!(request = %request, rank, "querying next dormant child");
                q.send(Arc::new(request.serialize()), rank, tags::REQUEST_NODE_ONESHOT);
            }
            None => {
                // Oneshot node finding exhausted: switch to normal hops.
                tracing::debug!(request = %request, "switching to normal hops");
                request.num_hops = -1;
                self.bounce_job_request(q, request, msg.source);
            }
        }
    }

    fn handle_send_job_description(&mut self, q: &MessageQueue, msg: &mut Message) {
        let job_id = peek_i32(&msg.payload).unwrap_or(-1);
        let now = self.clock.now();
        tracing::debug!(job_id, n = msg.payload.len(), source = msg.source, "received job description");

        if job_id < 0 || !self.registry.has(job_id) {
            if self.registry.has_commitment(job_id) {
                self.registry.uncommit(job_id);
                self.registry.unregister_job_from_balancer(job_id);
            }
            return;
        }

        let bytes = std::mem::take(&mut msg.payload);
        let appended = self.registry.get_mut(job_id).unwrap().append_revision(bytes);
        match appended {
            Err(err) => {
                tracing::error!(job_id, error = %err, "invalid job description");
                if self.config.mono.is_some() {
                    // The one and only job is broken: nothing left to solve.
                    fatal(err);
                }
                self.abort_job(q, job_id);
                return;
            }
            Ok(None) => return,
            Ok(Some(revision)) => {
                tracing::debug!(job_id, revision, "appended description revision");
            }
        }

        if self.registry.has_commitment(job_id) {
            let request = self.registry.commitment(job_id).unwrap().clone();
            let state = {
                let job = self.registry.get_mut(job_id).unwrap();
                job.set_desired_revision(request.current_revision);
                job.state()
            };
            self.registry.uncommit(job_id);
            if state == JobState::Suspended {
                self.registry.reactivate(job_id, msg.source, now);
            } else {
                self.registry.execute(job_id, msg.source, now);
            }
            self.initiate_volume_update(q, job_id);
        }

        let job = self.registry.get(job_id).unwrap();
        if job.state() != JobState::Active {
            return;
        }
        if job.revision() < job.desired_revision() {
            // Chain the transfer of the next revision.
            let next = job.revision() + 1;
            q.send(
                Arc::new(IntPair(job_id, next).serialize()),
                msg.source,
                tags::QUERY_JOB_DESCRIPTION,
            );
        }
    }

    fn handle_query_job_description(&mut self, q: &MessageQueue, msg: &mut Message) {
        let pair: IntPair = parse(msg);
        let job_id = pair.0;
        let revision = pair.1;

        // Client role: serve descriptions of jobs submitted here.
        if let Some(revisions) = self.client_descriptions.get(&job_id) {
            if let Some(blob) = revisions.get(revision as usize) {
                q.send(blob.clone(), msg.source, tags::SEND_JOB_DESCRIPTION);
                return;
            }
        }

        let Some(job) = self.registry.get_mut(job_id) else {
            return;
        };
        if job.revision() >= revision {
            self.send_revision_description(q, job_id, revision, msg.source);
        } else {
            // Not present yet: answer once the revision arrives.
            job.add_child_waiting_for_revision(msg.source, revision);
        }
    }

    fn send_revision_description(&self, q: &MessageQueue, job_id: i32, revision: i32, dest: Rank) {
        let Some(blob) = self
            .registry
            .get(job_id)
            .and_then(|j| j.serialized_revision(revision))
        else {
            return;
        };
        tracing::debug!(job_id, revision, dest, n = blob.len(), "sending job description");
        q.send(blob, dest, tags::SEND_JOB_DESCRIPTION);
    }

    fn handle_query_volume(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        let Some(job) = self.registry.get(job_id) else {
            return;
        };

        let volume = job.volume();
        if job.state() == JobState::Active && volume == 0 && !job.tree().is_root() {
            // Unknown here: ask the parent; the answer floods back down.
            q.send(
                Arc::new(msg.payload.clone()),
                job.tree().parent_rank(),
                tags::QUERY_VOLUME,
            );
            return;
        }

        tracing::debug!(job_id, volume, dest = msg.source, "answering volume query");
        let response = IntVec(vec![job_id, volume, self.registry.global_balancing_epoch()]);
        q.send(
            Arc::new(response.serialize()),
            msg.source,
            tags::NOTIFY_VOLUME_UPDATE,
        );
    }

    fn handle_notify_volume_update(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        let volume = payload.get(1);
        let epoch = payload.get(2);
        if !self.registry.has(job_id) {
            tracing::warn!(job_id, "volume update for unknown job");
            return;
        }
        self.update_volume(q, job_id, volume, epoch, 0.0);
    }

    fn handle_notify_node_leaving_job(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        let index = payload.get(1);
        let root_rank = payload.get(2);

        if !self.registry.has(job_id) {
            // Not ours (anymore): let the root deal with it.
            q.send(
                Arc::new(msg.payload.clone()),
                root_rank,
                tags::NOTIFY_NODE_LEAVING_JOB,
            );
            return;
        }

        let (pruned, volume) = {
            let job = self.registry.get_mut(job_id).unwrap();
            (job.tree_mut().prune(msg.source, index), job.volume())
        };
        if let Some(side) = pruned {
            if index < volume {
                tracing::debug!(job_id, index, "looking for replacement of departed child");
                let epoch = self.registry.global_balancing_epoch();
                self.spawn_job_request(q, job_id, side, epoch);
            }
        }
    }

    fn handle_notify_result_found(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        let revision = payload.get(1);
        let result_code = payload.get(2);

        let obsolete = match self.registry.get(job_id) {
            None => {
                tracing::warn!(job_id, "result notification for unknown job");
                true
            }
            Some(job) if !job.tree().is_root() => {
                tracing::warn!(job_id, "result notification at a non-root node");
                true
            }
            Some(job) => job.revision() > revision || job.is_revision_solved(revision),
        };
        if obsolete {
            q.send(
                Arc::new(msg.payload.clone()),
                msg.source,
                tags::NOTIFY_RESULT_OBSOLETE,
            );
            return;
        }

        tracing::info!(job_id, revision, result_code, source = msg.source, "job revision solved");
        self.registry
            .get_mut(job_id)
            .unwrap()
            .set_revision_solved(revision);

        // Terminate the tree and notify the client.
        self.interrupt_job(q, job_id, true, false);
        self.send_job_done_to_client(q, job_id, msg.source);
    }

    fn handle_notify_result_obsolete(&mut self, _q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        if let Some(job) = self.registry.get_mut(job_id) {
            tracing::debug!(job_id, source = msg.source, "result unwanted");
            job.set_result_transfer_pending(false);
        }
    }

    fn handle_query_job_result(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        let Some(job) = self.registry.get_mut(job_id) else {
            return;
        };
        let Some(result) = job.result().cloned() else {
            tracing::warn!(job_id, "result queried but not present");
            return;
        };
        tracing::info!(job_id, revision = result.revision, dest = msg.source, "sending job result");
        q.send(Arc::new(result.serialize()), msg.source, tags::SEND_JOB_RESULT);
        job.set_result_transfer_pending(false);
    }

    fn handle_send_job_result(&mut self, q: &MessageQueue, msg: &mut Message) {
        let result: JobResult = parse(msg);
        tracing::info!(
            job_id = result.job_id,
            revision = result.revision,
            result_code = result.result_code,
            "job result received"
        );
        self.client_results.insert(result.job_id, result);
        if self.config.mono.is_some() {
            self.broadcast_exit(q);
        }
    }

    fn handle_notify_job_done(&mut self, q: &MessageQueue, msg: &mut Message) {
        let statistics: JobStatistics = parse(msg);
        tracing::info!(
            job_id = statistics.job_id,
            successful_rank = statistics.successful_rank,
            wallclock_secs = statistics.used_wallclock_seconds,
            cpu_secs = statistics.used_cpu_seconds,
            "job done"
        );
        // Fetch the full result from the successful worker.
        q.send(
            Arc::new(IntVec(vec![statistics.job_id]).serialize()),
            statistics.successful_rank,
            tags::QUERY_JOB_RESULT,
        );
    }

    fn handle_notify_client_job_aborting(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        tracing::warn!(job_id, "job aborted");
        self.client_results.insert(
            job_id,
            JobResult {
                job_id,
                revision: 0,
                result_code: 0,
                solution: Vec::new(),
            },
        );
        if self.config.mono.is_some() {
            self.broadcast_exit(q);
        }
    }

    fn handle_notify_job_aborting(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        if !self.registry.has(job_id) {
            return;
        }
        let client = self
            .registry
            .get(job_id)
            .filter(|j| j.tree().is_root())
            .map(|j| j.client_rank());

        self.interrupt_job(q, job_id, true, true);

        if let Some(client_rank) = client {
            q.send(
                Arc::new(msg.payload.clone()),
                client_rank,
                tags::NOTIFY_CLIENT_JOB_ABORTING,
            );
        }
    }

    fn handle_notify_job_terminating(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        self.interrupt_job(q, payload.get(0), true, false);
    }

    fn handle_interrupt(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        self.interrupt_job(q, payload.get(0), false, false);
    }

    fn handle_incremental_job_finished(&mut self, q: &MessageQueue, msg: &mut Message) {
        let payload: IntVec = parse(msg);
        let job_id = payload.get(0);
        if self.registry.has(job_id) {
            tracing::info!(job_id, "incremental job finished");
            self.interrupt_job(q, job_id, true, false);
        }
    }

    fn handle_send_application_message(&mut self, _q: &MessageQueue, msg: &mut Message) {
        let app_msg: crate::data::JobMessage = parse(msg);
        let now = self.clock.now();
        let Some(job) = self.registry.get_mut(app_msg.job_id) else {
            tracing::warn!(job_id = app_msg.job_id, "application message for unknown job");
            return;
        };
        if job.state() == JobState::Active {
            tracing::debug!(
                job = %job,
                tag = app_msg.tag,
                epoch = app_msg.epoch,
                n = app_msg.payload.len(),
                source = msg.source,
                "delivering application message"
            );
            job.touch(now);
        }
    }

    fn handle_sched_release_from_waiting(&mut self, _q: &MessageQueue, msg: &mut Message) {
        let pair: IntPair = parse(msg);
        let job_id = pair.0;
        let epoch = pair.1;
        if let Some(job) = self.registry.get_mut(job_id) {
            job.tree_mut().stop_waiting_for_reactivation(epoch);
        }
        self.mark_collective_dirty();
    }

    fn handle_sched_node_status(&mut self, _q: &MessageQueue, msg: &mut Message) {
        let status: NodeStatus = parse(msg);
        if let Some(ca) = self.coll_assign.as_mut() {
            ca.handle_status(msg.source, status);
        }
    }

    fn handle_warmup(&mut self, _q: &MessageQueue, msg: &mut Message) {
        tracing::debug!(source = msg.source, "received warmup message");
    }

    fn handle_do_exit(&mut self, _q: &MessageQueue, msg: &mut Message) {
        tracing::info!(source = msg.source, "exit requested");
        self.terminator.terminate();
    }

    // ================= volume updates and job control =================

    fn initiate_volume_update(&mut self, q: &MessageQueue, job_id: i32) {
        if self.config.explicit_volume_updates {
            let Some(job) = self.registry.get(job_id) else {
                return;
            };
            if job.tree().is_root() {
                let volume = job.volume();
                if volume > 1 {
                    let epoch = self.registry.global_balancing_epoch();
                    self.update_volume(q, job_id, volume, epoch, 0.0);
                }
            } else {
                q.send(
                    Arc::new(IntVec(vec![job_id]).serialize()),
                    job.tree().parent_rank(),
                    tags::QUERY_VOLUME,
                );
            }
        } else {
            let Some(job) = self.registry.get(job_id) else {
                return;
            };
            if self.registry.global_balancing_epoch() < job.balancing_epoch_of_last_commitment() {
                // The epoch that caused this node is not here yet.
                return;
            }
            if let Some(volume) = self.registry.known_volume(job_id) {
                let epoch = self.registry.global_balancing_epoch();
                self.update_volume(q, job_id, volume, epoch, 0.0);
            }
        }
    }

    fn update_volume(
        &mut self,
        q: &MessageQueue,
        job_id: i32,
        volume: i32,
        epoch: i32,
        event_latency: f32,
    ) {
        let now = self.clock.now();

        if !self.registry.has(job_id) {
            // A parked root request becomes live once its volume exists.
            if let Some(request) = self.registry.take_root_request(job_id) {
                tracing::info!(request = %request, "activating root request");
                let sender = request.requesting_node_rank;
                self.bounce_job_request(q, request, sender);
            }
            return;
        }

        let reactivation = self.config.reactivation_scheduling;
        let explicit = self.config.explicit_volume_updates;
        let my_rank = self.rank;
        let has_dormant_root = self.registry.has_dormant_root();

        let mut outbox: Vec<(Rank, Tag, Vec<u8>)> = Vec::new();
        let mut actions: Vec<SchedulerAction> = Vec::new();
        let mut pending_spawns: Vec<Side> = Vec::new();
        let mut suspend_self = false;
        let mut uncommit_self = false;

        {
            let job = self.registry.get_mut(job_id).unwrap();
            let this_index = job.index();
            let prev_volume = job.volume();
            let state = job.state();
            let was_waiting = job.tree().is_waiting_for_reactivation();
            let has_commitment = job.has_commitment();
            let desired_revision = job.desired_revision();

            tracing::debug!(
                job = %job,
                volume,
                epoch,
                event_latency,
                last_requests_epoch = job.tree().balancing_epoch_of_last_requests(),
                "volume update"
            );
            job.update_volume_and_used_cpu(volume, now);
            job.touch(now);
            job.tree_mut().stop_waiting_for_reactivation(epoch - 1);

            if state != JobState::Active {
                if has_commitment && reactivation {
                    let (tree, sched) = job.tree_and_scheduler_mut();
                    if let Some(scheduler) = sched {
                        actions.extend(scheduler.update_balancing(
                            tree,
                            epoch,
                            volume,
                            my_rank,
                            now,
                            desired_revision,
                        ));
                    }
                }
                if has_commitment && this_index > 0 && this_index >= volume {
                    tracing::debug!(job = %job, "shrunk while committed, uncommitting");
                    uncommit_self = true;
                    if !reactivation {
                        outbox.push((
                            job.tree().parent_rank(),
                            tags::NOTIFY_NODE_LEAVING_JOB,
                            IntVec(vec![job_id, this_index, job.tree().root_rank()]).serialize(),
                        ));
                    }
                }
                if state == JobState::Suspended && this_index < volume {
                    // Keep waiting across epochs, or start waiting once the
                    // volume regrows over this node's index.
                    if (was_waiting && this_index < prev_volume) || this_index >= prev_volume {
                        job.tree_mut().set_waiting_for_reactivation(epoch);
                    }
                }
            } else {
                if reactivation {
                    let (tree, sched) = job.tree_and_scheduler_mut();
                    if let Some(scheduler) = sched {
                        actions.extend(scheduler.update_balancing(
                            tree,
                            epoch,
                            volume,
                            my_rank,
                            now,
                            desired_revision,
                        ));
                    }
                }

                let volume_payload = IntVec(vec![job_id, volume, epoch]).serialize();
                let root_rank = job.tree().root_rank();
                let parent_rank = job.tree().parent_rank();
                let mut growth_blocked = false;

                for side in Side::BOTH {
                    let next_index = job.tree().child_index(side);
                    if let Some(child_rank) = job.tree().child_rank(side) {
                        if explicit {
                            outbox.push((
                                child_rank,
                                tags::NOTIFY_VOLUME_UPDATE,
                                volume_payload.clone(),
                            ));
                        }
                        if reactivation && next_index >= volume {
                            // Child leaves; it stays cached for rejoin.
                            job.tree_mut().prune(child_rank, next_index);
                        }
                    } else if next_index < volume
                        && job.tree().balancing_epoch_of_last_requests() < epoch
                    {
                        if has_dormant_root {
                            // Growing would make this an inner node, and the
                            // dormant root could no longer restart here.
                            tracing::debug!(job = %job, "cannot grow due to dormant root");
                            suspend_self = true;
                            outbox.push((
                                parent_rank,
                                tags::NOTIFY_NODE_LEAVING_JOB,
                                IntVec(vec![job_id, this_index, root_rank]).serialize(),
                            ));
                            growth_blocked = true;
                            break;
                        }
                        if !reactivation {
                            pending_spawns.push(side);
                        }
                    } else {
                        job.tree_mut().unset_desire(side);
                    }
                }
                job.tree_mut().set_balancing_epoch_of_last_requests(epoch);

                if !growth_blocked && this_index > 0 && this_index >= volume {
                    tracing::info!(job = %job, volume, "shrinking");
                    suspend_self = true;
                    if !reactivation {
                        outbox.push((
                            parent_rank,
                            tags::NOTIFY_NODE_LEAVING_JOB,
                            IntVec(vec![job_id, this_index, root_rank]).serialize(),
                        ));
                    }
                }
            }
        }

        self.mark_collective_dirty();

        if uncommit_self {
            self.registry.uncommit(job_id);
            self.registry.unregister_job_from_balancer(job_id);
        }
        if suspend_self {
            self.registry.suspend(job_id, now);
        }
        for side in pending_spawns {
            self.spawn_job_request(q, job_id, side, epoch);
        }
        for action in actions {
            self.perform_scheduler_action(q, job_id, action);
        }
        for (dest, tag, payload) in outbox {
            q.send(Arc::new(payload), dest, tag);
        }
    }

    /// Propagates an interruption down the tree (children, dormant and past
    /// children) and suspends or terminates the local node.
    fn interrupt_job(&mut self, q: &MessageQueue, job_id: i32, terminate: bool, reckless: bool) {
        if !self.registry.has(job_id) {
            return;
        }
        let now = self.clock.now();

        let (state, targets) = {
            let job = self.registry.get_mut(job_id).unwrap();
            let state = job.state();
            if !terminate && state == JobState::Suspended {
                // Already in the goal state (and already forwarded).
                return;
            }
            let mut targets: Vec<Rank> = Side::BOTH
                .into_iter()
                .filter_map(|s| job.tree().child_rank(s))
                .collect();
            targets.extend(job.tree().dormant_children());
            targets.extend(job.tree().past_children());
            targets.sort_unstable();
            targets.dedup();
            if terminate {
                job.tree_mut().clear_past_children();
            }
            (state, targets)
        };

        let tag = if terminate && reckless {
            tags::NOTIFY_JOB_ABORTING
        } else if terminate {
            tags::NOTIFY_JOB_TERMINATING
        } else {
            tags::INTERRUPT
        };
        let payload = Arc::new(IntVec(vec![job_id]).serialize());
        for target in targets {
            tracing::debug!(job_id, target, tag, "propagating interruption");
            q.send(payload.clone(), target, tag);
        }

        if terminate {
            self.registry.terminate(job_id, now);
        } else if state == JobState::Active {
            self.registry.suspend(job_id, now);
        }
    }

    fn abort_job(&mut self, q: &MessageQueue, job_id: i32) {
        let mut msg = Message {
            source: self.rank,
            tag: tags::NOTIFY_JOB_ABORTING,
            payload: IntVec(vec![job_id]).serialize(),
        };
        self.handle_notify_job_aborting(q, &mut msg);
    }

    /// A per-job resource limit was hit at the root: abort the whole tree.
    fn timeout_job(&mut self, q: &MessageQueue, job_id: i32) {
        tracing::warn!(job_id, "job hit its resource limit, aborting");
        self.abort_job(q, job_id);
    }

    fn send_job_done_to_client(&mut self, q: &MessageQueue, job_id: i32, successful_rank: Rank) {
        let now = self.clock.now();
        let Some(job) = self.registry.get_mut(job_id) else {
            return;
        };
        job.update_volume_and_used_cpu(job.volume(), now);
        let statistics = JobStatistics {
            job_id,
            successful_rank,
            used_wallclock_seconds: job.age_since_activation(now),
            used_cpu_seconds: job.used_cpu_seconds(),
            latency_of_first_volume_update: job.latency_of_first_volume_update(),
        };
        let client_rank = job.client_rank();
        tracing::info!(job_id, client_rank, "informing client that job is done");
        q.send(
            Arc::new(statistics.serialize()),
            client_rank,
            tags::NOTIFY_JOB_DONE,
        );
    }

    fn broadcast_exit(&mut self, q: &MessageQueue) {
        let payload = Arc::new(IntVec(vec![0]).serialize());
        for rank in 0..self.num_ranks as Rank {
            q.send(payload.clone(), rank, tags::DO_EXIT);
        }
        self.terminator.terminate();
    }

    fn mark_collective_dirty(&mut self) {
        if let Some(ca) = self.coll_assign.as_mut() {
            ca.set_status_dirty();
        }
    }
}
