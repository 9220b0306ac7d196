//! Download orchestration core for a university LMS content-sync tool
//! (§1–§9): given an authenticated session and a snapshot of the LMS's own
//! JSON responses, discovers, plans, fetches and finalizes course artifacts.
//!
//! Global singletons the original tool kept as process-wide mutable state
//! (Catalog, Config, Rate Limiter) are explicit context here, constructed in
//! `Config -> Catalog -> RateLimiter -> Session` order and owned for the
//! duration of one [`Engine::run`] invocation (§9).

pub mod adapters;
pub mod catalog;
pub mod checksum;
pub mod collaborators;
pub mod config;
pub mod conflict_resolver;
pub mod downloader;
pub mod error;
pub mod events;
pub mod model;
pub mod planner;
pub mod rate_limiter;
pub mod session;
pub mod shutdown;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::Catalog;
use crate::collaborators::ProgressObserver;
use crate::config::Config;
use crate::downloader::StopFlag;
use crate::error::{EngineError, Result};
use crate::model::{Course, MediaUrl};
use crate::rate_limiter::RateLimiter;
use crate::session::AuthenticatedSession;
use crate::shutdown::ShutdownCoordinator;

/// On-disk layout roots relative to `working_dir` (§6).
pub const COURSES_ROOT: &str = "courses";
pub const TEMP_ROOT: &str = "temp";
pub const INTERN_DIR: &str = ".intern";

/// A snapshot of the LMS's own JSON responses for one run: the enrolment
/// list, each course's `core_course_get_contents` weeks, and each course's
/// `mod_videoservice_get_videos` payload (absent when the course has no
/// video listing, or videos are disabled). Fetching this snapshot is the
/// wire exchange §6 calls out as "consumed, not defined here" — the exact
/// Moodle webservice call shapes live outside this crate's component
/// contract; the Engine only ever translates already-fetched JSON.
#[derive(Debug, Clone, Default)]
pub struct LmsSnapshot {
  pub enrolments: Vec<Value>,
  pub course_content_weeks: HashMap<i64, Vec<Value>>,
  pub course_videos: HashMap<i64, Value>,
}

/// Outcome of one full run (§8 S3/S6 test observations).
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
  pub courses_processed: usize,
  pub artifacts_downloaded: usize,
  pub artifacts_finalized: usize,
}

/// Wires the six in-scope components together for one invocation.
pub struct Engine {
  working_dir: PathBuf,
  config: Config,
  catalog: Catalog,
  limiter: Arc<RateLimiter>,
  session: AuthenticatedSession,
  observer: Arc<dyn ProgressObserver>,
  coordinator: Arc<ShutdownCoordinator>,
  per_course_concurrency: usize,
}

impl Engine {
  /// Assembles an Engine from already-constructed context. Construction
  /// order (`Config -> Catalog -> RateLimiter -> Session`) is the caller's
  /// responsibility, matching §9's startup-order note; by the time this
  /// constructor runs, all four already exist.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    working_dir: PathBuf,
    config: Config,
    catalog: Catalog,
    session: AuthenticatedSession,
    observer: Arc<dyn ProgressObserver>,
    coordinator: Arc<ShutdownCoordinator>,
    per_course_concurrency: usize,
  ) -> Self {
    let limiter = Arc::new(RateLimiter::new(config.download_rate_mbit));
    Engine {
      working_dir,
      config,
      catalog,
      limiter,
      session,
      observer,
      coordinator,
      per_course_concurrency,
    }
  }

  pub fn catalog(&self) -> &Catalog {
    &self.catalog
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Runs one full sync: enumerate courses, plan and fetch each course's
  /// artifacts (bounded by `concurrent_courses`), then resolve conflicts
  /// and finalize. Stops issuing new per-URL fetches as soon as the
  /// Shutdown Coordinator's stop flag is set, but always resolves whatever
  /// TempFiles were produced before returning (§4.5/§4.6/§5).
  pub async fn run(&self, snapshot: LmsSnapshot) -> Result<RunSummary> {
    downloader::gc_stale_temp_files(&self.working_dir, TEMP_ROOT)
      .map_err(|e| EngineError::Fatal(format!("cannot prepare temp directory: {e}")))?;

    let mut courses = Vec::new();
    for enrolment in &snapshot.enrolments {
      if let Some(course) = adapters::course_from_enrolment(enrolment) {
        self.catalog.upsert_course(&course)?;
        courses.push(course);
      }
    }
    let courses = downloader::sort_courses_by_priority(courses);

    let mut course_dirs = HashMap::new();
    for course in &courses {
      course_dirs.insert(course.id, course.dir_name(self.config.fs_course_default_shortname));
    }

    let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.concurrent_courses.max(1) as usize));
    let mut handles = Vec::new();

    for course in &courses {
      let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
      let course = course.clone();
      let course_dir = course_dirs.get(&course.id).cloned().unwrap_or_else(|| course.dir_name(true));
      let weeks = snapshot.course_content_weeks.get(&course.id).cloned().unwrap_or_default();
      let videos = snapshot.course_videos.get(&course.id).cloned();
      let engine_ctx = self.clone_context();

      let handle = tokio::spawn(async move {
        let _permit = permit;
        engine_ctx.process_course(&course, &course_dir, &weeks, videos.as_ref()).await
      });
      handles.push(handle);
    }

    let mut artifacts_downloaded = 0usize;
    for handle in handles {
      match handle.await {
        Ok(Ok(count)) => artifacts_downloaded += count,
        Ok(Err(e)) => tracing::error!(target: "downloader", error = %e, "course task failed"),
        Err(e) => tracing::error!(target: "downloader", error = %e, "course task panicked"),
      }
    }

    let finalized = conflict_resolver::resolve_all(&self.catalog, &self.working_dir, COURSES_ROOT, &course_dirs)?;

    self.observer.on_run_complete(courses.len(), finalized);
    self.coordinator.run_cleanups();

    Ok(RunSummary {
      courses_processed: courses.len(),
      artifacts_downloaded,
      artifacts_finalized: finalized,
    })
  }

  /// A cheaply-cloneable handle carrying only what a spawned per-course task
  /// needs, so `run` doesn't have to hold `&self` across a `tokio::spawn`.
  fn clone_context(&self) -> EngineContext {
    EngineContext {
      working_dir: self.working_dir.clone(),
      catalog: self.catalog.clone(),
      limiter: self.limiter.clone(),
      session: self.session.clone(),
      observer: self.observer.clone(),
      stop: self.coordinator.stop_flag(),
      per_course_concurrency: self.per_course_concurrency,
    }
  }

}

#[derive(Clone)]
struct EngineContext {
  working_dir: PathBuf,
  catalog: Catalog,
  limiter: Arc<RateLimiter>,
  session: AuthenticatedSession,
  observer: Arc<dyn ProgressObserver>,
  stop: StopFlag,
  per_course_concurrency: usize,
}

impl EngineContext {
  async fn process_course(&self, course: &Course, course_dir: &str, weeks: &[Value], videos: Option<&Value>) -> Result<usize> {
    let documents: Vec<MediaUrl> = weeks
      .iter()
      .filter_map(|week| week.get("modules").and_then(Value::as_array))
      .flatten()
      .flat_map(|module| adapters::document_entries(course.id, module))
      .collect();
    let video_entries = videos.map(|v| adapters::video_entries(course.id, v)).unwrap_or_default();
    let discovered = adapters::merge_documents_then_videos(documents, video_entries);

    for media_url in &discovered {
      self.catalog.insert_media_url(media_url)?;
    }

    let now = time::OffsetDateTime::now_utc();
    let planned = planner::plan_course(&self.session, &self.catalog, &self.working_dir, COURSES_ROOT, course_dir, discovered, now).await?;

    if self.stop.is_set() {
      return Ok(0);
    }

    let temp_files = downloader::run_course(
      &self.session,
      &self.limiter,
      &self.catalog,
      &self.stop,
      &self.working_dir,
      TEMP_ROOT,
      course,
      course_dir,
      planned,
      self.per_course_concurrency,
      self.observer.as_ref(),
    )
    .await?;

    Ok(temp_files.len())
  }
}

/// Opens the Catalog at `<working_dir>/<INTERN_DIR>/state.db`, creating the
/// directory if needed (§6).
pub fn open_catalog(working_dir: &Path) -> Result<Catalog> {
  let dir = working_dir.join(INTERN_DIR);
  std::fs::create_dir_all(&dir).map_err(|e| EngineError::Fatal(format!("cannot create intern directory: {e}")))?;
  Catalog::open(dir.join("state.db"))
}
