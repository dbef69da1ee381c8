//! Signal handling: SIGTERM/SIGINT stop the engine, SIGHUP restarts it with
//! a freshly loaded configuration.
//!
//! `signal-hook` only flips atomics; the engine loop and the reaper poll them.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── signal handler ────────────────────

/// Shutdown and restart flags shared between signal hooks and the engine.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    restart_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Flags wired to the process signals. Registration failures are
    /// reported but not fatal.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Flags with no signal hooks behind them, for tests and embedding.
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            restart_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    pub fn should_restart(&self) -> bool {
        self.restart_flag.load(Ordering::Relaxed)
    }

    /// Either flag set means the current engine run must end.
    pub fn should_stop(&self) -> bool {
        self.should_shutdown() || self.should_restart()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_restart(&self) {
        self.restart_flag.store(true, Ordering::Relaxed);
    }

    /// Clear the restart flag once the restart has been carried out.
    pub fn clear_restart(&self) {
        self.restart_flag.store(false, Ordering::Relaxed);
    }

    /// Shared flag raised by either signal; bounds the reaper.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[VGL-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[VGL-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.restart_flag)) {
                eprintln!("[VGL-SIGNAL] failed to register SIGHUP: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── shutdown coordinator ────────────────────

/// Runs named shutdown steps in order within an overall time budget.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }

    /// Returns `true` when every step ran and succeeded in time.
    pub fn execute(&self, steps: &mut [(&str, &mut dyn FnMut() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, step) in steps.iter_mut() {
            if start.elapsed() > self.timeout {
                eprintln!("[VGL-SHUTDOWN] timeout reached, abandoning remaining steps");
                return false;
            }
            if step() {
                eprintln!("[VGL-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[VGL-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handler_starts_clear() {
        let handler = SignalHandler::detached();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_restart());
        assert!(!handler.should_stop());
    }

    #[test]
    fn restart_stops_the_run_until_cleared() {
        let handler = SignalHandler::detached();
        handler.request_restart();
        assert!(handler.should_stop());
        assert!(!handler.should_shutdown());
        handler.clear_restart();
        assert!(!handler.should_stop());
    }

    #[test]
    fn stop_flag_is_shared_with_clones() {
        let handler = SignalHandler::detached();
        let flag = handler.stop_flag();
        handler.clone().request_shutdown();
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn coordinator_reports_failed_steps() {
        let coord = ShutdownCoordinator::new();
        let mut ran = Vec::new();
        let mut first = || {
            ran.push("reap");
            true
        };
        let mut second = || false;
        let mut steps: [(&str, &mut dyn FnMut() -> bool); 2] =
            [("final reap", &mut first), ("flush", &mut second)];
        let ok = coord.execute(&mut steps);
        assert!(!ok);
        assert_eq!(ran, vec!["reap"]);
    }
}
