//! Minimal contracts for the out-of-scope collaborators named in §1/§2b: the
//! core depends only on these narrow interfaces, never on how a concrete
//! implementation (Shibboleth login flow, ANSI status renderer, update
//! checker) actually works.

use crate::model::User;
use crate::session::AuthenticatedSession;

/// Errors an [`Authenticator`] implementation can surface; the core treats
/// any of them as the *Auth failure* taxonomy entry (§7) and aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
  #[error("Shibboleth/SAML login failed: {0}")]
  LoginFailed(String),
  #[error("mobile API token response was empty")]
  EmptyMobileToken,
}

/// The Shibboleth/SAML login flow and session-key extraction (out of scope,
/// §1). The core only ever holds the resulting [`AuthenticatedSession`].
pub trait Authenticator {
  fn authenticate(&self, user: &User, config: &crate::config::Config) -> Result<AuthenticatedSession, AuthError>;
}

/// Progress reporting (out of scope, §1/§2b): the core calls these methods;
/// an ANSI renderer or other UI consumes whatever forwarder implements them.
pub trait ProgressObserver: Send + Sync {
  fn on_course_progress(&self, course_id: i64, completed: usize, total: usize);
  fn on_artifact_progress(&self, course_id: i64, url: &str, bytes_so_far: u64, total_bytes: Option<u64>);
  fn on_run_complete(&self, courses_processed: usize, artifacts_downloaded: usize);
}

/// The default no-op/broadcast forwarder (§2b): the core's only built-in
/// [`ProgressObserver`], in the `EventHub` broadcast idiom this codebase
/// already uses for emitting updates to an out-of-process UI.
#[derive(Clone)]
pub struct BroadcastProgressObserver {
  hub: crate::events::EventHub,
}

impl BroadcastProgressObserver {
  pub fn new(hub: crate::events::EventHub) -> Self {
    BroadcastProgressObserver { hub }
  }
}

impl ProgressObserver for BroadcastProgressObserver {
  fn on_course_progress(&self, course_id: i64, completed: usize, total: usize) {
    self.hub.emit(crate::events::ProgressEvent::CourseProgress { course_id, completed, total });
  }

  fn on_artifact_progress(&self, course_id: i64, url: &str, bytes_so_far: u64, total_bytes: Option<u64>) {
    self.hub.emit(crate::events::ProgressEvent::ArtifactProgress {
      course_id,
      url: url.to_string(),
      bytes_so_far,
      total_bytes,
    });
  }

  fn on_run_complete(&self, courses_processed: usize, artifacts_downloaded: usize) {
    self.hub.emit(crate::events::ProgressEvent::RunComplete { courses_processed, artifacts_downloaded });
  }
}
