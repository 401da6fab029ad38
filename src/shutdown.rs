use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Process-wide cancellation token.
///
/// All long-running loops (the worker main loop, the message queue's helper
/// threads) monitor this token and drain gracefully once it fires.
#[derive(Clone, Debug, Default)]
pub struct Terminator {
    flag: Arc<AtomicBool>,
}

impl Terminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_terminating(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Watchdog over the worker's main thread.
///
/// The main loop calls [`Watchdog::reset`] once per tick. A background thread
/// checks the time since the last reset and tears the process down if it
/// exceeds the configured abort interval. An interval of 0 disables the
/// watchdog entirely.
pub struct Watchdog {
    last_reset_millis: Arc<AtomicU64>,
    epoch: Instant,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    const CHECK_INTERVAL: Duration = Duration::from_millis(200);

    pub fn start(abort_millis: u64) -> Self {
        let epoch = Instant::now();
        let last_reset_millis = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = if abort_millis > 0 {
            let last = last_reset_millis.clone();
            let stop_flag = stop.clone();
            Some(std::thread::spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(Self::CHECK_INTERVAL);
                    let now = epoch.elapsed().as_millis() as u64;
                    let elapsed = now.saturating_sub(last.load(Ordering::Acquire));
                    if elapsed > abort_millis {
                        tracing::error!(
                            elapsed_millis = elapsed,
                            abort_millis,
                            "watchdog: main thread unresponsive, aborting"
                        );
                        std::process::abort();
                    }
                }
            }))
        } else {
            None
        };

        Self {
            last_reset_millis,
            epoch,
            stop,
            handle,
        }
    }

    pub fn reset(&self) {
        self.last_reset_millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_fires_once_set() {
        let t = Terminator::new();
        assert!(!t.is_terminating());
        let clone = t.clone();
        clone.terminate();
        assert!(t.is_terminating());
    }

    #[test]
    fn test_disabled_watchdog_spawns_no_thread() {
        let w = Watchdog::start(0);
        assert!(w.handle.is_none());
        w.reset();
    }
}
