//! URL Filter / Planner (§4.4): turns the full set of discovered `MediaUrl`s
//! for one course into the sequence of artifacts to actually attempt this
//! run, applying the five ordered filter rules.
//!
//! Grounded on `original_source/src/isisdl/api/download.py`'s
//! `filter_bad_urls` step and `original_source/src/isisdl/backend/
//! request_helper.py`'s folder/resource URL handling (`mod/folder`,
//! `mod/resource`), combined with spec §4.4 directly for the HEAD-redirect
//! resolution rule the distillation otherwise leaves implicit.

use std::path::Path;

use crate::adapters::is_ignored;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::model::{MediaClass, MediaUrl};
use crate::session::AuthenticatedSession;

const FOLDER_MARKER: &str = "mod/folder/";
const RESOURCE_MARKER: &str = "mod/resource/";

/// An artifact this run will actually attempt, after all five filter rules.
/// `download_url` is the resolved fetch URL (possibly rewritten by rule 4/5);
/// it may differ from `media_url.url`, which stays the query-stripped
/// storage identity (§2b).
#[derive(Debug, Clone)]
pub struct PlannedDownload {
  pub media_url: MediaUrl,
  pub download_url: String,
  /// The effective media class for this download: equal to
  /// `media_url.media_class` unless rule 4 retagged it `archive`.
  pub media_class: MediaClass,
}

/// Applies the five ordered filter rules of §4.4 to one course's discovered
/// `MediaUrl`s, producing the sequence to attempt this run.
pub async fn plan_course(
  session: &AuthenticatedSession,
  catalog: &Catalog,
  working_dir: &Path,
  courses_root: &str,
  course_dir: &str,
  discovered: Vec<MediaUrl>,
  now: time::OffsetDateTime,
) -> Result<Vec<PlannedDownload>> {
  let mut planned = Vec::new();

  for media_url in discovered {
    // Rule 1: drop ignore-listed URLs.
    if is_ignored(&media_url.url) {
      continue;
    }

    // Rule 2: drop URLs already represented by a live MediaContainer.
    if let Some(container) = catalog.get_media_container(&media_url.url, media_url.course_id)? {
      let final_path = working_dir
        .join(courses_root)
        .join(course_dir)
        .join(&container.relative_path)
        .join(&container.final_name);
      if let Ok(meta) = std::fs::metadata(&final_path) {
        if meta.len() as i64 == container.size {
          continue;
        }
      }
      // size mismatch or file missing: fall through, re-attempt (I3).
    }

    // Rule 3: BadURL back-off.
    if let Some(bad) = catalog.get_bad_url(&media_url.url, media_url.course_id)? {
      if !bad.should_retry(now) {
        continue;
      }
    }

    // Rules 4/5: folder/resource URL resolution.
    if media_url.url.contains(FOLDER_MARKER) {
      let download_url = bulk_download_url(session, &media_url.url);
      planned.push(PlannedDownload {
        media_url,
        download_url,
        media_class: MediaClass::Archive,
      });
      continue;
    }

    if media_url.url.contains(RESOURCE_MARKER) {
      match resolve_resource_redirect(session, &media_url.url).await {
        Some(location) => {
          let media_class = media_url.media_class;
          planned.push(PlannedDownload {
            media_url,
            download_url: location,
            media_class,
          });
        }
        None => {
          catalog.record_bad_url(&media_url.url, media_url.course_id, &crate::catalog::now_rfc3339())?;
        }
      }
      continue;
    }

    let media_class = media_url.media_class;
    let download_url = media_url.url.clone();
    planned.push(PlannedDownload { media_url, download_url, media_class });
  }

  Ok(planned)
}

/// Rewrites an LMS folder URL to the bulk-download endpoint, carrying the
/// session key the POST body needs (§4.4 rule 4).
fn bulk_download_url(session: &AuthenticatedSession, folder_url: &str) -> String {
  let id = folder_url
    .split("id=")
    .nth(1)
    .and_then(|rest| rest.split('&').next())
    .unwrap_or_default();
  format!(
    "https://isis.tu-berlin.de/mod/folder/download_folder.php?id={id}&sesskey={}",
    session.session_key()
  )
}

/// Issues a HEAD with redirects disabled and returns the `Location` header
/// only on a 303 (§4.4 rule 5); any other outcome (non-303, missing header,
/// request failure) is a permanent-URL failure for the caller to record.
async fn resolve_resource_redirect(session: &AuthenticatedSession, url: &str) -> Option<String> {
  let resp = session.head_no_redirect(url).await.ok()?;
  if resp.status().as_u16() != 303 {
    return None;
  }
  resp.headers().get(reqwest::header::LOCATION)?.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bulk_download_url_extracts_id_and_session_key() {
    let (following, no_redirect) = crate::session::build_clients(1).unwrap();
    let session = AuthenticatedSession::new(following, no_redirect, "sesskey123".to_string(), "tok".to_string());
    let out = bulk_download_url(&session, "https://isis.tu-berlin.de/mod/folder/view.php?id=42");
    assert!(out.contains("id=42"));
    assert!(out.contains("sesskey=sesskey123"));
  }

  fn plain_media_url(url: &str, course_id: i64) -> MediaUrl {
    MediaUrl {
      url: url.to_string(),
      course_id,
      media_class: MediaClass::Document,
      relative_path: "".into(),
      display_name: Some("slides.pdf".into()),
      size: None,
      created_at: None,
      modified_at: None,
    }
  }

  /// S5: a BadURL within its back-off window is dropped; once wall clock
  /// passes `(times_checked × 5)^3` minutes it is re-attempted.
  #[tokio::test]
  async fn bad_url_is_dropped_then_retried_after_backoff_elapses_s5() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(dir.path().join("state.db")).unwrap();
    let (following, no_redirect) = crate::session::build_clients(1).unwrap();
    let session = AuthenticatedSession::new(following, no_redirect, "sesskey123".to_string(), "tok".to_string());

    let url = "https://isis.tu-berlin.de/pluginfile.php/1/mod_resource/content/1/slides.pdf";
    let now = time::OffsetDateTime::now_utc();
    catalog.record_bad_url(url, 1, &now.format(&time::format_description::well_known::Rfc3339).unwrap()).unwrap();
    catalog.record_bad_url(url, 1, &now.format(&time::format_description::well_known::Rfc3339).unwrap()).unwrap();
    let bad = catalog.get_bad_url(url, 1).unwrap().unwrap();
    assert_eq!(bad.times_checked, 2);

    let planned = plan_course(&session, &catalog, dir.path(), "courses", "course", vec![plain_media_url(url, 1)], now)
      .await
      .unwrap();
    assert!(planned.is_empty(), "BadURL inside its back-off window must be dropped");

    let past_backoff = now + time::Duration::minutes((2 * 5i64).pow(3)) + time::Duration::seconds(1);
    let planned = plan_course(&session, &catalog, dir.path(), "courses", "course", vec![plain_media_url(url, 1)], past_backoff)
      .await
      .unwrap();
    assert_eq!(planned.len(), 1, "BadURL past its back-off window must be re-attempted");

    catalog
      .record_bad_url(url, 1, &past_backoff.format(&time::format_description::well_known::Rfc3339).unwrap())
      .unwrap();
    let bad = catalog.get_bad_url(url, 1).unwrap().unwrap();
    assert_eq!(bad.times_checked, 3);
  }
}
