use clap::Parser;
use tracing_subscriber::EnvFilter;

use mallow::comm::fabric::InProcessFabric;
use mallow::comm::Fabric;
use mallow::config::Config;
use mallow::data::Application;
use mallow::shutdown::Terminator;
use mallow::worker::Worker;

fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 | 4 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbosity))),
        )
        .init();

    let num_workers = config.workers.max(1);
    tracing::info!(
        workers = num_workers,
        mono = ?config.mono,
        reactivation_scheduling = config.reactivation_scheduling,
        derandomize = config.derandomize(),
        "starting mallow"
    );

    let mono_payload = match &config.mono {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    let terminator = Terminator::new();
    let endpoints = InProcessFabric::mesh(num_workers);

    let mut handles = Vec::new();
    for fabric in endpoints {
        let rank = fabric.rank();
        let config = config.clone();
        let terminator = terminator.clone();
        let payload = (rank == 0).then(|| mono_payload.clone()).flatten();
        handles.push(std::thread::spawn(move || {
            let mut worker = Worker::new(Box::new(fabric), config, terminator);
            if let Some(payload) = payload {
                // Rank 0 doubles as the client in single-job mode.
                worker.submit_root_job(1, Application::Sat, payload);
            }
            worker.run();
        }));
    }

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
            terminator.terminate();
        }
    }
    Ok(())
}
