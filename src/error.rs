use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// The error taxonomy of the download orchestration subsystem. Each variant
/// carries its propagation policy via [`EngineError::retryable`] and a stable
/// code string for the `errors/<epoch>.txt` sink.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("transient network failure: {0}")]
  TransientNetwork(#[source] reqwest::Error),

  #[error("permanent url failure: {0}")]
  PermanentUrl(String),

  #[error("authentication failed: {0}")]
  AuthFailure(String),

  #[error("local file corrupted: expected size {expected}, found {actual}")]
  CorruptedLocalFile { expected: u64, actual: u64 },

  #[error("catalog write failed: {0}")]
  CatalogWrite(#[source] rusqlite::Error),

  #[error("shutdown requested")]
  ShutdownRequested,

  #[error("catalog missing or unreadable: {0}")]
  Fatal(String),
}

impl EngineError {
  /// Whether this error kind is eligible for in-session retry (§7).
  pub fn retryable(&self) -> bool {
    matches!(self, EngineError::TransientNetwork(_))
  }

  /// A stable identifier suitable for the crash-report sink and structured logs.
  pub fn code(&self) -> &'static str {
    match self {
      EngineError::TransientNetwork(_) => "TRANSIENT_NETWORK",
      EngineError::PermanentUrl(_) => "PERMANENT_URL",
      EngineError::AuthFailure(_) => "AUTH_FAILURE",
      EngineError::CorruptedLocalFile { .. } => "CORRUPTED_LOCAL_FILE",
      EngineError::CatalogWrite(_) => "CATALOG_WRITE",
      EngineError::ShutdownRequested => "SHUTDOWN_REQUESTED",
      EngineError::Fatal(_) => "FATAL",
    }
  }

  /// Exit code a top-level run should use if this error is what aborted it.
  pub fn exit_code(&self) -> i32 {
    match self {
      EngineError::Fatal(_) => 2,
      EngineError::AuthFailure(_) => 1,
      _ => 1,
    }
  }
}

impl From<rusqlite::Error> for EngineError {
  fn from(e: rusqlite::Error) -> Self {
    EngineError::CatalogWrite(e)
  }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Initializes process-wide structured logging: JSON, daily-rotated file output
/// under `logs_dir`. Module targets (`catalog`, `rate_limiter`, `session`,
/// `downloader`, `conflict_resolver`, `shutdown`) are expected to be filtered
/// via `RUST_LOG`.
pub fn init_tracing(logs_dir: &Path) -> anyhow::Result<()> {
  let file_appender = tracing_appender::rolling::daily(logs_dir, "campus-sync.jsonl");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  let _ = LOG_GUARD.set(guard);

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn"));

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(non_blocking)
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .init();

  Ok(())
}

/// Writes a crash backtrace to `<intern>/errors/<epoch>.txt` and returns the
/// path written, per §6/§7's `generate_error_message` sink.
pub fn generate_error_message(errors_dir: &Path, epoch_secs: u64, message: &str) -> std::io::Result<std::path::PathBuf> {
  std::fs::create_dir_all(errors_dir)?;
  let path = errors_dir.join(format!("{epoch_secs}.txt"));
  std::fs::write(&path, message)?;
  Ok(path)
}
