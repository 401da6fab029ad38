use std::path::PathBuf;

use clap::Parser;

/// Runtime configuration of a worker process.
///
/// Parsed straight from the command line; `Config::default()` yields the same
/// values a bare invocation would. Flags marked "application passthrough" are
/// recognized and carried for the solver subprocess contract but not consumed
/// by the scheduling core itself.
#[derive(Parser, Debug, Clone)]
#[command(name = "mallow")]
#[command(about = "Distributed malleable job scheduling worker")]
pub struct Config {
    /// Single-job mode: solve exactly this instance file and exit
    #[arg(long)]
    pub mono: Option<PathBuf>,

    /// Template for introduced jobs (application passthrough)
    #[arg(long)]
    pub job_template: Option<PathBuf>,

    /// Template for job descriptions (application passthrough)
    #[arg(long)]
    pub job_desc_template: Option<PathBuf>,

    /// Number of client processes submitting jobs
    #[arg(short = 'c', long, default_value_t = 1)]
    pub clients: usize,

    /// Total number of jobs to process (0 = unlimited)
    #[arg(short = 'J', long, default_value_t = 0)]
    pub jobs: usize,

    /// Max. active jobs per client (0 = unlimited)
    #[arg(long = "ajpc", default_value_t = 0)]
    pub active_jobs_per_client: usize,

    /// Process-level solution logging, 0|1 (application passthrough)
    #[arg(long, default_value_t = 0)]
    pub pls: i32,

    /// Verbosity, 0 (critical) .. 5 (debug)
    #[arg(short = 'v', long, default_value_t = 2)]
    pub verbosity: u8,

    /// Directory to write log files into (stderr if unset)
    #[arg(long)]
    pub log_directory: Option<PathBuf>,

    /// Solver threads per job node (application passthrough)
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,

    /// Panic instead of thrashing when memory runs out, 0|1
    #[arg(long, default_value_t = 1)]
    pub mempanic: i32,

    /// Max. literals per solver thread (application passthrough)
    #[arg(long, default_value_t = 50_000_000)]
    pub max_lits_per_thread: usize,

    /// Hard clause length limit for sharing (application passthrough)
    #[arg(long, default_value_t = 60)]
    pub strict_clause_length_limit: usize,

    /// Discount factor on clause buffers per tree level (application passthrough)
    #[arg(long, default_value_t = 0.9)]
    pub clause_buffer_discount: f32,

    /// Number of export chunks per solver (application passthrough)
    #[arg(long, default_value_t = 20)]
    pub export_chunks: usize,

    /// Use a fixed expander-graph topology for request bouncing, 0|1
    #[arg(long, default_value_t = 1)]
    pub derandomize: i32,

    /// Send warm-up messages along all bounce edges at startup
    #[arg(long)]
    pub warmup: bool,

    /// Re-use the same ranks across balancing epochs via explicit reservation
    #[arg(long)]
    pub reactivation_scheduling: bool,

    /// Push volume updates down the job tree instead of having children pull
    #[arg(long)]
    pub explicit_volume_updates: bool,

    /// Hand unrouted requests to collective assignment after this many hops
    /// (negative = disabled)
    #[arg(long, default_value_t = -1)]
    pub hops_until_collective_assignment: i32,

    /// Max. dormant children cached per job node
    #[arg(long, default_value_t = 4)]
    pub job_cache_size: usize,

    /// Outgoing degree of the expander graph used for bouncing
    #[arg(long, default_value_t = 4)]
    pub num_bounce_alternatives: usize,

    /// Abort the process after this long without a main-thread tick
    /// (milliseconds, 0 = disabled)
    #[arg(long, default_value_t = 60_000)]
    pub watchdog_abort_millis: u64,

    /// Overall run time limit in seconds (0 = none)
    #[arg(long, default_value_t = 0.0)]
    pub time_limit: f32,

    /// Per-job wall-clock limit in seconds, checked by the job's root (0 = none)
    #[arg(long, default_value_t = 0.0)]
    pub job_wallclock_limit: f32,

    /// Per-job CPU-seconds limit, checked by the job's root (0 = none)
    #[arg(long, default_value_t = 0.0)]
    pub job_cpu_limit: f32,

    /// Number of worker ranks spawned by the in-process fabric
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Max. transport message size in bytes; larger payloads are fragmented
    #[arg(long, default_value_t = 65_536)]
    pub max_msg_size: usize,

    /// Seed for all pseudo-random decisions (expander graph, hop selection)
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["mallow"])
    }
}

impl Config {
    pub fn derandomize(&self) -> bool {
        self.derandomize != 0
    }

    pub fn collective_assignment_enabled(&self) -> bool {
        self.hops_until_collective_assignment >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_bare_invocation() {
        let cfg = Config::default();
        assert_eq!(cfg.clients, 1);
        assert_eq!(cfg.verbosity, 2);
        assert!(cfg.derandomize());
        assert!(!cfg.reactivation_scheduling);
        assert!(!cfg.collective_assignment_enabled());
        assert_eq!(cfg.max_msg_size, 65_536);
    }

    #[test]
    fn test_flag_parsing() {
        let cfg = Config::parse_from([
            "mallow",
            "--workers",
            "8",
            "--reactivation-scheduling",
            "--hops-until-collective-assignment",
            "16",
            "-v",
            "4",
        ]);
        assert_eq!(cfg.workers, 8);
        assert!(cfg.reactivation_scheduling);
        assert_eq!(cfg.hops_until_collective_assignment, 16);
        assert!(cfg.collective_assignment_enabled());
        assert_eq!(cfg.verbosity, 4);
    }
}
