//! Test harness for deterministic multi-worker cluster tests.
//!
//! Drives N workers over the in-process fabric from a single thread, one
//! `advance` at a time, with a scripted balancer feeding volume updates.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use mallow::balance::{Balancer, VolumeUpdate};
use mallow::comm::fabric::{InProcessFabric, Rank};
use mallow::comm::queue::Message;
use mallow::config::Config;
use mallow::data::{Application, JobResult};
use mallow::job::JobState;
use mallow::shutdown::Terminator;
use mallow::worker::Worker;

/// Simulated wall-clock seconds per cluster step. Large enough that the job
/// gate fires every step and the balancing gate every other step.
#[allow(dead_code)]
pub const STEP_SECONDS: f32 = 0.05;

type Script = Rc<RefCell<VecDeque<VolumeUpdate>>>;

/// Balancer replaying updates pushed by the test.
struct ScriptedBalancer {
    script: Script,
    epoch: i32,
}

impl Balancer for ScriptedBalancer {
    fn on_job_activated(&mut self, _job_id: i32, _demand: i32) {}
    fn on_demand_update(&mut self, _job_id: i32, _demand: i32) {}
    fn on_job_terminated(&mut self, _job_id: i32) {}
    fn handle_message(&mut self, _msg: &mut Message) {}

    fn advance(&mut self, _now: f32) -> Vec<VolumeUpdate> {
        let mut out = Vec::new();
        while let Some(update) = self.script.borrow_mut().pop_front() {
            self.epoch = self.epoch.max(update.epoch);
            out.push(update);
        }
        out
    }

    fn epoch(&self) -> i32 {
        self.epoch
    }
}

pub struct TestCluster {
    pub workers: Vec<Worker>,
    scripts: Vec<Script>,
    now: f32,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new(num_workers: usize) -> Self {
        Self::with_config(num_workers, |_| {})
    }

    /// Builds a cluster after applying `tweak` to the default test config.
    pub fn with_config(num_workers: usize, tweak: impl Fn(&mut Config)) -> Self {
        let mut config = Config::default();
        config.workers = num_workers;
        // No watchdog thread per worker; the harness drives time manually.
        config.watchdog_abort_millis = 0;
        config.seed = 7;
        tweak(&mut config);

        let terminator = Terminator::new();
        let mut workers = Vec::new();
        let mut scripts = Vec::new();
        for fabric in InProcessFabric::mesh(num_workers) {
            let script: Script = Rc::new(RefCell::new(VecDeque::new()));
            let balancer = Box::new(ScriptedBalancer {
                script: script.clone(),
                epoch: 0,
            });
            workers.push(Worker::with_balancer(
                Box::new(fabric),
                config.clone(),
                terminator.clone(),
                balancer,
            ));
            scripts.push(script);
        }
        Self {
            workers,
            scripts,
            now: 0.0,
        }
    }

    pub fn worker(&self, rank: Rank) -> &Worker {
        &self.workers[rank as usize]
    }

    /// Emits a volume update on every rank, the way a concluded distributed
    /// balancing becomes visible everywhere.
    pub fn broadcast_volume(&self, job_id: i32, volume: i32, epoch: i32) {
        for script in &self.scripts {
            script.borrow_mut().push_back(VolumeUpdate {
                job_id,
                volume,
                epoch,
                event_latency: 0.0,
            });
        }
    }

    /// Emits a volume update on a single rank.
    pub fn push_volume(&self, rank: Rank, job_id: i32, volume: i32, epoch: i32) {
        self.scripts[rank as usize].borrow_mut().push_back(VolumeUpdate {
            job_id,
            volume,
            epoch,
            event_latency: 0.0,
        });
    }

    /// Advances every worker once, in rank order.
    pub fn step(&mut self) {
        self.now += STEP_SECONDS;
        for worker in &self.workers {
            worker.advance_once(self.now);
        }
    }

    /// Advances a single worker, leaving the others untouched.
    pub fn step_worker(&mut self, rank: Rank) {
        self.now += STEP_SECONDS;
        self.workers[rank as usize].advance_once(self.now);
    }

    pub fn drive(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Steps until `done` holds, at most `max_steps` times. Checks the
    /// node-uniqueness invariant for `watched_job` on every step.
    pub fn drive_until(
        &mut self,
        watched_job: i32,
        max_steps: usize,
        done: impl Fn(&TestCluster) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            self.step();
            self.assert_unique_tree_nodes(watched_job);
            if done(self) {
                return true;
            }
        }
        false
    }

    /// Ranks holding the job in a given state, with their tree indices.
    pub fn ranks_in_state(&self, job_id: i32, state: JobState) -> Vec<(Rank, i32)> {
        self.workers
            .iter()
            .enumerate()
            .filter_map(|(rank, w)| {
                (w.job_state(job_id) == Some(state))
                    .then(|| (rank as Rank, w.job_index(job_id).unwrap()))
            })
            .collect()
    }

    pub fn active_indices(&self, job_id: i32) -> Vec<i32> {
        let mut indices: Vec<i32> = self
            .ranks_in_state(job_id, JobState::Active)
            .into_iter()
            .map(|(_, idx)| idx)
            .collect();
        indices.sort_unstable();
        indices
    }

    pub fn rank_of_index(&self, job_id: i32, index: i32) -> Option<Rank> {
        self.ranks_in_state(job_id, JobState::Active)
            .into_iter()
            .find(|&(_, idx)| idx == index)
            .map(|(rank, _)| rank)
    }

    /// No tree position is held live by two workers at once.
    pub fn assert_unique_tree_nodes(&self, job_id: i32) {
        let mut seen = HashSet::new();
        for (rank, index) in self.ranks_in_state(job_id, JobState::Active) {
            assert!(
                seen.insert(index),
                "index {index} of job {job_id} held by two workers (one is rank {rank})"
            );
        }
    }

    /// Grows a freshly submitted job to `volume` and waits until the tree is
    /// complete. Returns the rank holding each index.
    pub fn grow_job(
        &mut self,
        client: Rank,
        job_id: i32,
        application: Application,
        volume: i32,
        epoch: i32,
    ) -> Vec<(Rank, i32)> {
        self.worker(client)
            .submit_root_job(job_id, application, vec![1, 2, 3, 4]);
        self.drive(2);
        self.broadcast_volume(job_id, volume, epoch);
        let expected: Vec<i32> = (0..volume).collect();
        let grown = self.drive_until(job_id, 400, |c| c.active_indices(job_id) == expected);
        assert!(
            grown,
            "job {job_id} did not grow to volume {volume}: active {:?}",
            self.active_indices(job_id)
        );
        self.ranks_in_state(job_id, JobState::Active)
    }
}

#[allow(dead_code)]
pub fn result(job_id: i32, revision: i32, result_code: i32) -> JobResult {
    JobResult {
        job_id,
        revision,
        result_code,
        solution: vec![1, -2, 3],
    }
}

#[test]
fn test_harness_smoke() {
    let mut cluster = TestCluster::new(2);
    cluster.drive(5);
    assert!(!cluster.worker(0).is_busy_or_committed());
    assert!(!cluster.worker(1).is_busy_or_committed());
}
