use crate::comm::fabric::Rank;

/// Per-worker counters, emitted on the stats tick. Incremental fields reset
/// on every emission.
#[derive(Debug, Default)]
pub struct SysState {
    pub busy_ratio: f32,
    pub committed_ratio: f32,
    pub num_jobs: i32,
    pub spawned_requests: i64,
    pub num_hops: i64,
    pub num_desires: i64,
    pub num_fulfilled_desires: i64,
    pub sum_desire_latencies: f32,
}

impl SysState {
    pub fn emit(&mut self, rank: Rank) {
        let fulfilled_ratio = if self.num_desires > 0 {
            self.num_fulfilled_desires as f32 / self.num_desires as f32
        } else {
            0.0
        };
        tracing::info!(
            rank,
            busy_ratio = self.busy_ratio,
            committed_ratio = self.committed_ratio,
            jobs = self.num_jobs,
            new_requests = self.spawned_requests,
            hops = self.num_hops,
            fulfilled_ratio,
            "sysstate"
        );
        self.spawned_requests = 0;
        self.num_hops = 0;
        self.num_desires = 0;
        self.num_fulfilled_desires = 0;
        self.sum_desire_latencies = 0.0;
    }
}
