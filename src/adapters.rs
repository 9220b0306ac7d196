//! Endpoint Adapters (§2, §6): translate LMS JSON responses into `Course`
//! and `MediaUrl` values. Responsible only for translation, not scheduling.
//!
//! Grounded on `original_source/src/isisdl/api/endpoints.py` (the
//! `CourseContentsAPI`/video-list match-statement logic) and
//! `original_source/src/isisdl/backend/request_helper.py` (the ignore
//! regex and video-path rule, §2b).

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::model::{Course, MediaClass, MediaUrl};

/// The LMS's own file-serving host; a `fileurl` resolving elsewhere is `extern` (§2b).
pub const LMS_FILE_HOST: &str = "isis.tu-berlin.de";
const VIDEO_ENDPOINT_MARKER: &str = "mod/videoservice/file.php";

static IGNORE_PATTERN: OnceLock<Regex> = OnceLock::new();

/// The global ignore pattern of §4.4 rule 1, enumerated in §2b: non-downloadable
/// LMS modules the document adapter never plans. `videoservice` is excluded from
/// this match deliberately — the video adapter is its sole consumer.
fn ignore_pattern() -> &'static Regex {
  IGNORE_PATTERN.get_or_init(|| {
    Regex::new(
      r"mod/(forum|url|choicegroup|assign|videoservice|feedback|choice|quiz|glossary|questionnaire|scorm|etherpadlite|lti|h5pactivity|page)/",
    )
    .expect("ignore pattern is a valid regex")
  })
}

/// Whether `url` matches the global ignore pattern (§4.4 rule 1), exposed
/// for the Planner to re-check at plan time.
pub fn is_ignored(url: &str) -> bool {
  ignore_pattern().is_match(url)
}

/// Strips a URL's query string for Catalog storage identity (§2b); the
/// original, unstripped URL is kept separately as the fetch/`download_url`.
pub fn strip_query(url: &str) -> String {
  match url::Url::parse(url) {
    Ok(mut u) => {
      u.set_query(None);
      u.set_fragment(None);
      u.into()
    }
    Err(_) => url.to_string(),
  }
}

fn classify(fileurl: &str) -> MediaClass {
  if fileurl.contains(VIDEO_ENDPOINT_MARKER) {
    return MediaClass::Video;
  }
  match url::Url::parse(fileurl).ok().and_then(|u| u.host_str().map(str::to_string)) {
    Some(host) if host != LMS_FILE_HOST => MediaClass::Extern,
    _ => MediaClass::Document,
  }
}

fn unix_to_rfc3339(epoch_secs: i64) -> Option<String> {
  time::OffsetDateTime::from_unix_timestamp(epoch_secs)
    .ok()
    .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
}

/// Parses one entry of `core_enrol_get_users_courses` into a `Course` (§3).
pub fn course_from_enrolment(json: &Value) -> Option<Course> {
  let id = json.get("id").and_then(Value::as_i64)?;
  let short_name = json.get("shortname").and_then(Value::as_str)?.to_string();
  let full_name = json.get("fullname").and_then(Value::as_str)?.to_string();

  Some(Course {
    id,
    short_name,
    full_name,
    preferred_name: json.get("displayname").and_then(Value::as_str).map(str::to_string),
    user_count: json.get("enrolledusercount").and_then(Value::as_i64),
    is_favorite: json.get("isfavourite").and_then(Value::as_bool).unwrap_or(false),
    last_access: json.get("lastaccess").and_then(Value::as_i64).and_then(unix_to_rfc3339),
    last_modification: None,
    start: json.get("startdate").and_then(Value::as_i64).and_then(unix_to_rfc3339),
    end: json.get("enddate").and_then(Value::as_i64).and_then(unix_to_rfc3339),
  })
}

/// Document adapter: translates one `core_course_get_contents` module entry's
/// `contents` array into `MediaUrl`s (§6). A module whose `url` matches the
/// ignore pattern is skipped entirely; individual contents missing a
/// required field are silently dropped, not recorded as bad (§6).
pub fn document_entries(course_id: i64, module: &Value) -> Vec<MediaUrl> {
  let Some(module_url) = module.get("url").and_then(Value::as_str) else {
    return vec![];
  };
  if ignore_pattern().is_match(module_url) {
    return vec![];
  }

  let Some(contents) = module.get("contents").and_then(Value::as_array) else {
    return vec![];
  };

  contents.iter().filter_map(|item| media_url_from_content(course_id, item, false)).collect()
}

/// Video adapter: `mod_videoservice_get_videos` entries are planned only
/// here, with `relative_path` fixed to `Videos/` (§2b).
pub fn video_entries(course_id: i64, videos_json: &Value) -> Vec<MediaUrl> {
  let Some(items) = videos_json.get("data").and_then(|d| d.get("videos")).and_then(Value::as_array) else {
    return vec![];
  };
  items.iter().filter_map(|item| media_url_from_content(course_id, item, true)).collect()
}

fn media_url_from_content(course_id: i64, item: &Value, force_video: bool) -> Option<MediaUrl> {
  let fileurl = item.get("fileurl").and_then(Value::as_str)?;
  let filename = item.get("filename").and_then(Value::as_str)?;

  if !force_video && ignore_pattern().is_match(fileurl) {
    return None;
  }

  let media_class = if force_video { MediaClass::Video } else { classify(fileurl) };
  let relative_path = if media_class == MediaClass::Video {
    "Videos".to_string()
  } else {
    item
      .get("filepath")
      .and_then(Value::as_str)
      .unwrap_or("/")
      .trim_matches('/')
      .to_string()
  };

  Some(MediaUrl {
    url: strip_query(fileurl),
    course_id,
    media_class,
    relative_path,
    display_name: Some(filename.to_string()),
    size: item.get("filesize").and_then(Value::as_i64),
    created_at: item.get("timecreated").and_then(Value::as_i64).and_then(unix_to_rfc3339),
    modified_at: item.get("timemodified").and_then(Value::as_i64).and_then(unix_to_rfc3339),
  })
}

/// Merges MediaUrls from distinct adapters for the same course in the
/// deterministic order §5 requires: documents before videos.
pub fn merge_documents_then_videos(documents: Vec<MediaUrl>, videos: Vec<MediaUrl>) -> Vec<MediaUrl> {
  let mut out = documents;
  out.extend(videos);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn ignores_forum_module() {
    let module = json!({
      "url": "https://isis.tu-berlin.de/mod/forum/view.php?id=1",
      "contents": [{"fileurl": "x", "filename": "y"}],
    });
    assert!(document_entries(1, &module).is_empty());
  }

  #[test]
  fn document_with_missing_field_is_dropped_not_bad() {
    let module = json!({
      "url": "https://isis.tu-berlin.de/mod/resource/view.php?id=1",
      "contents": [{"fileurl": "https://isis.tu-berlin.de/pluginfile.php/1/mod_resource/content/1/a.pdf"}],
    });
    assert!(document_entries(1, &module).is_empty());
  }

  #[test]
  fn extern_classified_by_foreign_host() {
    let module = json!({
      "url": "https://isis.tu-berlin.de/mod/resource/view.php?id=1",
      "contents": [{
        "fileurl": "https://example.org/slides.pdf?token=abc",
        "filename": "slides.pdf",
        "filesize": 100,
        "filepath": "/",
      }],
    });
    let entries = document_entries(1, &module);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].media_class, MediaClass::Extern);
    assert!(!entries[0].url.contains("token="));
  }

  #[test]
  fn video_entries_fixed_to_videos_path() {
    let videos_json = json!({
      "data": {"videos": [{
        "fileurl": "https://isis.tu-berlin.de/mod/videoservice/file.php?id=1",
        "filename": "lecture.mp4",
        "filesize": 500,
      }]}
    });
    let entries = video_entries(1, &videos_json);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].relative_path, "Videos");
    assert_eq!(entries[0].media_class, MediaClass::Video);
  }

  #[test]
  fn merge_orders_documents_before_videos() {
    let doc = MediaUrl {
      url: "d".into(),
      course_id: 1,
      media_class: MediaClass::Document,
      relative_path: String::new(),
      display_name: None,
      size: None,
      created_at: None,
      modified_at: None,
    };
    let vid = MediaUrl { media_class: MediaClass::Video, url: "v".into(), ..doc.clone() };
    let merged = merge_documents_then_videos(vec![doc.clone()], vec![vid.clone()]);
    assert_eq!(merged[0].url, "d");
    assert_eq!(merged[1].url, "v");
  }
}
