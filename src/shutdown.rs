//! Shutdown Coordinator (§4.7): signal handling, the first-vs-second-signal
//! contract, priority-ordered cleanup closures, and the process-wide lock
//! file that keeps two mutating runs from racing each other.
//!
//! Grounded on this codebase's signal-driven window-close handling for the
//! "listen, flip a flag, let in-flight work drain" shape, generalized to
//! POSIX `SIGINT`/`SIGTERM`/`SIGHUP` (§9 redesign note: the source's global
//! state read by a signal handler becomes fields the coordinator owns, and
//! its decorator-registered `on_kill` priorities become an explicit sorted
//! list rather than registration order).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::downloader::StopFlag;
use crate::error::{EngineError, Result};

/// Which termination signal was observed; carries the conventional POSIX
/// signal number used to build the forced-exit code (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
  Hangup,
  Interrupt,
  Terminate,
}

impl ShutdownSignal {
  fn signum(self) -> i32 {
    match self {
      ShutdownSignal::Hangup => 1,
      ShutdownSignal::Interrupt => 2,
      ShutdownSignal::Terminate => 15,
    }
  }

  /// The conventional `128 + signum` forced-exit status (§6).
  pub fn exit_code(self) -> i32 {
    128 + self.signum()
  }
}

#[cfg(unix)]
async fn recv_signal() -> ShutdownSignal {
  use tokio::signal::unix::{signal, SignalKind};
  let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
  let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
  let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
  tokio::select! {
    _ = sigint.recv() => ShutdownSignal::Interrupt,
    _ = sigterm.recv() => ShutdownSignal::Terminate,
    _ = sighup.recv() => ShutdownSignal::Hangup,
  }
}

#[cfg(not(unix))]
async fn recv_signal() -> ShutdownSignal {
  let _ = tokio::signal::ctrl_c().await;
  ShutdownSignal::Interrupt
}

/// Outcome of racing a drain future against a possible second signal.
pub enum DrainOutcome<T> {
  /// The drain future finished before any second signal arrived.
  Drained(T),
  /// A second signal preempted the drain (hard cancellation, §5).
  ForcedExit(ShutdownSignal),
}

/// Owns the process-wide stop flag, the priority-ordered cleanup list, and
/// any child processes (e.g. an external recompression step) that must be
/// killed outright on a second signal.
pub struct ShutdownCoordinator {
  stop: StopFlag,
  cleanups: Mutex<Vec<(i32, Box<dyn FnOnce() + Send>)>>,
  children: Mutex<Vec<Child>>,
  signals_seen: AtomicU32,
}

impl ShutdownCoordinator {
  pub fn new() -> Arc<Self> {
    Arc::new(ShutdownCoordinator {
      stop: StopFlag::new(),
      cleanups: Mutex::new(Vec::new()),
      children: Mutex::new(Vec::new()),
      signals_seen: AtomicU32::new(0),
    })
  }

  pub fn stop_flag(&self) -> StopFlag {
    self.stop.clone()
  }

  /// Registers a closure to run during graceful shutdown. Lower-numbered
  /// priorities run first, regardless of registration order (§4.7).
  pub fn register_cleanup(&self, priority: i32, cleanup: impl FnOnce() + Send + 'static) {
    self.cleanups.lock().push((priority, Box::new(cleanup)));
  }

  /// Tracks a spawned child process so a second signal can terminate it
  /// outright instead of leaving it orphaned.
  pub fn track_child(&self, child: Child) {
    self.children.lock().push(child);
  }

  fn terminate_tracked_children(&self) {
    let mut children = self.children.lock();
    for child in children.iter_mut() {
      if let Err(e) = child.kill() {
        tracing::warn!(target: "shutdown", error = %e, "failed to kill tracked child process");
      }
    }
    children.clear();
  }

  /// Runs every registered cleanup closure in priority order. Idempotent:
  /// a second call runs whatever closures were registered since the first.
  pub fn run_cleanups(&self) {
    let mut cleanups = self.cleanups.lock();
    cleanups.sort_by_key(|(priority, _)| *priority);
    for (_, cleanup) in cleanups.drain(..) {
      cleanup();
    }
  }

  /// Blocks until the first termination signal arrives, setting the stop
  /// flag so every `rate_limiter.get` / downloader loop observes it at
  /// their next suspension point (§5).
  pub async fn wait_for_first_signal(&self) -> ShutdownSignal {
    let signal = recv_signal().await;
    self.stop.set();
    self.signals_seen.fetch_add(1, Ordering::SeqCst);
    tracing::warn!(target: "shutdown", signal = ?signal, "shutdown signal received, draining in-flight work");
    signal
  }

  /// Races a drain future (awaiting in-flight downloads, persisting the
  /// Catalog) against a second signal. A second signal skips drainage,
  /// kills tracked children, and reports the signal for a forced exit;
  /// the drain future completing first reports its own output (§4.7).
  pub async fn race_second_signal<F>(&self, drain: F) -> DrainOutcome<F::Output>
  where
    F: std::future::Future,
  {
    tokio::select! {
      biased;
      signal = recv_signal() => {
        self.signals_seen.fetch_add(1, Ordering::SeqCst);
        tracing::error!(target: "shutdown", signal = ?signal, "second shutdown signal received, forcing exit");
        self.terminate_tracked_children();
        DrainOutcome::ForcedExit(signal)
      }
      out = drain => DrainOutcome::Drained(out),
    }
  }
}

/// The process-wide mutual-exclusion lock file of §4.7: held for the
/// lifetime of one mutating run, released (deleted) on drop so a crash
/// doesn't strand a stale lock past the next successful run's own cleanup.
pub struct LockFile {
  path: PathBuf,
}

impl LockFile {
  /// Acquires the lock at `<working_dir>/.lock`, failing if another run
  /// already holds it. Acquisition is mandatory before any mutating run
  /// touches the Catalog or filesystem (§4.7).
  pub fn acquire(working_dir: &Path) -> Result<Self> {
    let path = working_dir.join(".lock");
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
      Ok(mut file) => {
        let _ = writeln!(file, "{}", std::process::id());
        Ok(LockFile { path })
      }
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(EngineError::Fatal(format!(
        "lock file already held at {}; another run may be in progress",
        path.display()
      ))),
      Err(e) => Err(EngineError::Fatal(format!("cannot acquire lock file: {e}"))),
    }
  }
}

impl Drop for LockFile {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.path);
  }
}
