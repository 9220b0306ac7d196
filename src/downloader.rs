//! Per-Course Downloader (§4.5): drives one course's planned artifacts
//! through the rate limiter into content-addressed temp files.
//!
//! Grounded on this codebase's `engine/job.rs` (single-stream read loop,
//! `set_http_error`/`set_reqwest_error` classification — multipart/segment
//! resume stripped per the Non-goals in §1) and
//! `original_source/src/isisdl/api/download.py`'s course-priority sort and
//! register/completed scoping around a course's fetch batch.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;

use crate::catalog::{now_rfc3339, temp_file_path, Catalog};
use crate::collaborators::ProgressObserver;
use crate::error::{EngineError, Result};
use crate::model::{Course, TempFile, TrafficClass};
use crate::planner::PlannedDownload;
use crate::rate_limiter::RateLimiter;
use crate::session::AuthenticatedSession;

/// Shared, cheaply-clonable stop flag the Shutdown Coordinator sets (§4.7/§5).
/// Checked between token acquisitions so a task mid-read always finishes its
/// current chunk before unwinding.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
  pub fn new() -> Self {
    StopFlag(Arc::new(AtomicBool::new(false)))
  }

  pub fn set(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_set(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// The outcome of fetching one planned artifact (§4.5/§7).
pub enum FetchOutcome {
  /// Fully written; ready for the Conflict Resolver.
  Completed(TempFile),
  /// Recorded as `BadURL`; partial temp file (if any) was deleted.
  Failed,
  /// Two planned artifacts resolved to the same `download_url` in this run;
  /// the loser aborts without touching `BadURL` (§5, §2b).
  DuplicateInFlight,
  /// A shutdown signal arrived mid-fetch; the partial temp file is left on
  /// disk for GC at the next run's startup (§4.5 step 6, §5).
  ShutdownInterrupted,
}

/// Fetches one planned artifact into its content-addressed temp file
/// location, following the per-URL protocol of §4.5.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_one(
  session: &AuthenticatedSession,
  limiter: &RateLimiter,
  catalog: &Catalog,
  stop: &StopFlag,
  working_dir: &Path,
  temp_root: &str,
  course_id: i64,
  course_dir: &str,
  planned: &PlannedDownload,
) -> Result<FetchOutcome> {
  let class = planned.media_class.traffic_class();
  limiter.register(class);
  let outcome = fetch_one_inner(session, limiter, catalog, stop, working_dir, temp_root, course_id, course_dir, planned, class).await;
  limiter.completed(class);
  outcome
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one_inner(
  session: &AuthenticatedSession,
  limiter: &RateLimiter,
  catalog: &Catalog,
  stop: &StopFlag,
  working_dir: &Path,
  temp_root: &str,
  course_id: i64,
  course_dir: &str,
  planned: &PlannedDownload,
  class: TrafficClass,
) -> Result<FetchOutcome> {
  let temp_path = temp_file_path(working_dir, temp_root, course_dir, &planned.download_url);
  if let Some(parent) = temp_path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| EngineError::Fatal(format!("cannot create temp directory: {e}")))?;
  }

  let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&temp_path) {
    Ok(f) => f,
    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(FetchOutcome::DuplicateInFlight),
    Err(e) => return Err(EngineError::Fatal(format!("cannot create temp file: {e}"))),
  };

  let response = match session.get(&planned.download_url).await {
    Ok(resp) if resp.status().is_success() => resp,
    Ok(resp) => {
      drop(file);
      let _ = std::fs::remove_file(&temp_path);
      catalog.record_bad_url(&planned.media_url.url, course_id, &now_rfc3339())?;
      tracing::warn!(target: "downloader", url = %planned.download_url, status = %resp.status(), "non-2xx response");
      return Ok(FetchOutcome::Failed);
    }
    Err(_) => {
      drop(file);
      let _ = std::fs::remove_file(&temp_path);
      catalog.record_bad_url(&planned.media_url.url, course_id, &now_rfc3339())?;
      return Ok(FetchOutcome::Failed);
    }
  };

  let mut stream = response.bytes_stream();
  let mut pending: Vec<u8> = Vec::new();
  let mut stream_done = false;

  loop {
    if stop.is_set() {
      return Ok(FetchOutcome::ShutdownInterrupted);
    }

    let token = limiter.get(class).await;
    while (pending.len() as u64) < token.num_bytes && !stream_done {
      match stream.next().await {
        Some(Ok(chunk)) => pending.extend_from_slice(&chunk),
        Some(Err(e)) => {
          limiter.return_token(token);
          drop(file);
          let _ = std::fs::remove_file(&temp_path);
          catalog.record_bad_url(&planned.media_url.url, course_id, &now_rfc3339())?;
          tracing::warn!(target: "downloader", url = %planned.download_url, error = %e, "body read failed");
          return Ok(FetchOutcome::Failed);
        }
        None => stream_done = true,
      }
    }

    let take = (token.num_bytes as usize).min(pending.len());
    if take == 0 {
      limiter.return_token(token);
      break;
    }
    let chunk: Vec<u8> = pending.drain(..take).collect();
    if let Err(e) = file.write_all(&chunk) {
      limiter.return_token(token);
      drop(file);
      let _ = std::fs::remove_file(&temp_path);
      return Err(EngineError::Fatal(format!("temp file write failed: {e}")));
    }
    limiter.return_token(token);
  }

  let final_name = final_name_for(planned);
  let temp_file = TempFile {
    course_id,
    url: planned.media_url.url.clone(),
    download_url: planned.download_url.clone(),
    traffic_class: class,
    relative_path: planned.media_url.relative_path.clone(),
    final_name,
    created_at: now_rfc3339(),
  };
  catalog.insert_temp_file(&temp_file)?;
  Ok(FetchOutcome::Completed(temp_file))
}

fn final_name_for(planned: &PlannedDownload) -> String {
  if let Some(name) = &planned.media_url.display_name {
    return sanitize_filename::sanitize(name);
  }
  url::Url::parse(&planned.media_url.url)
    .ok()
    .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
    .filter(|s| !s.is_empty())
    .map(|s| sanitize_filename::sanitize(&s))
    .unwrap_or_else(|| "download".to_string())
}

/// Deletes every file under `<working_dir>/<temp_root>` at startup (§5):
/// temp files never survive across invocations because a failed or
/// interrupted fetch always restarts from byte zero (§1 Non-goals).
pub fn gc_stale_temp_files(working_dir: &Path, temp_root: &str) -> std::io::Result<()> {
  let root = working_dir.join(temp_root);
  if root.exists() {
    std::fs::remove_dir_all(&root)?;
  }
  std::fs::create_dir_all(&root)
}

/// Course priority sort (§4.5): `(last modification desc, last access desc,
/// full name asc)`; lower index registers with the Rate Limiter first.
pub fn sort_courses_by_priority(mut courses: Vec<Course>) -> Vec<Course> {
  courses.sort_by(|a, b| {
    b.last_modification
      .cmp(&a.last_modification)
      .then_with(|| b.last_access.cmp(&a.last_access))
      .then_with(|| a.full_name.cmp(&b.full_name))
  });
  courses
}

/// Drives one course's planned artifacts to completion, bounding in-course
/// concurrency at `concurrency` (the session's effective connection-pool
/// size, §4.5). Returns the successfully-fetched `TempFile`s.
#[allow(clippy::too_many_arguments)]
pub async fn run_course(
  session: &AuthenticatedSession,
  limiter: &RateLimiter,
  catalog: &Catalog,
  stop: &StopFlag,
  working_dir: &Path,
  temp_root: &str,
  course: &Course,
  course_dir: &str,
  planned: Vec<PlannedDownload>,
  concurrency: usize,
  observer: &dyn ProgressObserver,
) -> Result<Vec<TempFile>> {
  let total = planned.len();
  let completed = std::sync::atomic::AtomicUsize::new(0);
  let results: Vec<Result<FetchOutcome>> = futures_util::stream::iter(planned.iter())
    .map(|planned_url| async {
      let outcome = fetch_one(session, limiter, catalog, stop, working_dir, temp_root, course.id, course_dir, planned_url).await;
      let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
      observer.on_course_progress(course.id, done, total);
      outcome
    })
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

  let mut temp_files = Vec::new();
  for result in results {
    if let FetchOutcome::Completed(tf) = result? {
      temp_files.push(tf);
    }
  }
  Ok(temp_files)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{MediaClass, MediaUrl};

  fn sample_course(id: i64, full_name: &str, last_mod: Option<&str>, last_access: Option<&str>) -> Course {
    Course {
      id,
      short_name: full_name.to_string(),
      full_name: full_name.to_string(),
      preferred_name: None,
      user_count: None,
      is_favorite: false,
      last_access: last_access.map(str::to_string),
      last_modification: last_mod.map(str::to_string),
      start: None,
      end: None,
    }
  }

  #[test]
  fn priority_sort_orders_by_modification_then_access_then_name() {
    let courses = vec![
      sample_course(1, "Zeta", Some("2024-01-01T00:00:00Z"), None),
      sample_course(2, "Alpha", Some("2024-06-01T00:00:00Z"), None),
      sample_course(3, "Beta", Some("2024-06-01T00:00:00Z"), None),
    ];
    let sorted = sort_courses_by_priority(courses);
    assert_eq!(sorted[0].id, 2); // tie on mod date -> alpha before beta
    assert_eq!(sorted[1].id, 3);
    assert_eq!(sorted[2].id, 1);
  }

  #[test]
  fn final_name_prefers_display_name() {
    let planned = PlannedDownload {
      media_url: MediaUrl {
        url: "https://isis.tu-berlin.de/pluginfile.php/1/x/y/slides.pdf".into(),
        course_id: 1,
        media_class: MediaClass::Document,
        relative_path: "".into(),
        display_name: Some("Slides (final).pdf".into()),
        size: None,
        created_at: None,
        modified_at: None,
      },
      download_url: "https://isis.tu-berlin.de/pluginfile.php/1/x/y/slides.pdf".into(),
      media_class: MediaClass::Document,
    };
    assert_eq!(final_name_for(&planned), "Slides (final).pdf");
  }

  #[tokio::test]
  async fn duplicate_in_flight_is_not_recorded_as_bad_url() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("state.db")).unwrap();
    let working_dir = dir.path();
    let course_dir = "course-1";

    let planned = PlannedDownload {
      media_url: MediaUrl {
        url: "https://example.org/a.pdf".into(),
        course_id: 1,
        media_class: MediaClass::Document,
        relative_path: "".into(),
        display_name: Some("a.pdf".into()),
        size: None,
        created_at: None,
        modified_at: None,
      },
      download_url: "https://example.org/a.pdf".into(),
      media_class: MediaClass::Document,
    };

    let path = temp_file_path(working_dir, "temp", course_dir, &planned.download_url);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"already here").unwrap();

    let (following, no_redirect) = crate::session::build_clients(1).unwrap();
    let session = AuthenticatedSession::new(following, no_redirect, "sesskey".into(), "tok".into());
    let limiter = RateLimiter::new(None);
    let stop = StopFlag::new();

    let outcome = fetch_one(&session, &limiter, &catalog, &stop, working_dir, "temp", 1, course_dir, &planned)
      .await
      .unwrap();
    assert!(matches!(outcome, FetchOutcome::DuplicateInFlight));
    assert!(catalog.get_bad_url("https://example.org/a.pdf", 1).unwrap().is_none());
    limiter.finish().await;
  }

  #[test]
  fn gc_removes_prior_run_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let temp_root = "temp";
    let stale = dir.path().join(temp_root).join("course-1").join("deadbeef");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"stale").unwrap();

    gc_stale_temp_files(dir.path(), temp_root).unwrap();
    assert!(!stale.exists());
    assert!(dir.path().join(temp_root).exists());
  }
}
