//! Process-wide progress event bus (§2b), in this codebase's existing
//! broadcast-channel `EventHub` idiom. The core's only built-in
//! [`crate::collaborators::ProgressObserver`] forwards onto this hub; an
//! out-of-scope status renderer subscribes and consumes it.

use tokio::sync::broadcast;

/// One update emitted by the Per-Course Downloader / run driver (§4.5/§2b).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
  CourseProgress { course_id: i64, completed: usize, total: usize },
  ArtifactProgress { course_id: i64, url: String, bytes_so_far: u64, total_bytes: Option<u64> },
  RunComplete { courses_processed: usize, artifacts_downloaded: usize },
}

#[derive(Clone)]
pub struct EventHub {
  tx: broadcast::Sender<ProgressEvent>,
}

impl EventHub {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(512);
    EventHub { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: ProgressEvent) {
    // No subscribers is the common case when run headless; not an error.
    let _ = self.tx.send(event);
  }
}

impl Default for EventHub {
  fn default() -> Self {
    Self::new()
  }
}
