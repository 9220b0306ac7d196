//! Data model entities of §3: the shapes the Catalog stores and every other
//! component passes around. Timestamps are RFC3339 strings, matching the
//! Catalog's own storage convention (see `catalog::now_rfc3339`).

/// One of the five traffic classes the Rate Limiter shapes bandwidth for (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficClass {
  Stream,
  Extern,
  Document,
  Video,
  FreeForAll,
}

impl TrafficClass {
  pub const ALL: [TrafficClass; 5] = [
    TrafficClass::Stream,
    TrafficClass::Extern,
    TrafficClass::Document,
    TrafficClass::Video,
    TrafficClass::FreeForAll,
  ];

  /// The raw fairness score from §4.1, before normalization.
  pub fn raw_score(self) -> u32 {
    match self {
      TrafficClass::Stream => 1000,
      TrafficClass::Extern => 100,
      TrafficClass::Document => 50,
      TrafficClass::Video => 10,
      TrafficClass::FreeForAll => 0,
    }
  }
}

/// The media class of a planned or finalized artifact (§3). The three failure
/// classes exist so a `MediaUrl`/`MediaContainer` can record why an artifact
/// could not be realized without losing its place in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
  Document,
  Extern,
  Video,
  Archive,
  CorruptedOnDisk,
  NotAvailable,
  NotAvailableForLegalReasons,
  Hardlink,
}

impl MediaClass {
  /// Maps a media class to the traffic class the Rate Limiter should account it under.
  pub fn traffic_class(self) -> TrafficClass {
    match self {
      MediaClass::Document => TrafficClass::Document,
      MediaClass::Extern => TrafficClass::Extern,
      MediaClass::Video => TrafficClass::Video,
      MediaClass::Archive => TrafficClass::Document,
      _ => TrafficClass::FreeForAll,
    }
  }
}

/// A stable course identity (§3). On-disk directory names are derived from
/// `short_name`/`full_name` by `Course::dir_name`, never stored directly.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Course {
  pub id: i64,
  pub short_name: String,
  pub full_name: String,
  pub preferred_name: Option<String>,
  pub user_count: Option<i64>,
  pub is_favorite: bool,
  pub last_access: Option<String>,
  pub last_modification: Option<String>,
  pub start: Option<String>,
  pub end: Option<String>,
}

impl Course {
  /// Derives the filesystem-safe on-disk directory name for this course,
  /// preferring the short name unless it is empty (§2b fallback rule).
  pub fn dir_name(&self, prefer_short_name: bool) -> String {
    let raw = if prefer_short_name && !self.short_name.trim().is_empty() {
      self.short_name.as_str()
    } else {
      self.full_name.as_str()
    };
    sanitize_filename::sanitize(raw)
  }
}

/// A planned artifact discovered by an Endpoint Adapter (§3). `url` is the
/// query-stripped storage identity; `download_url` (carried on `TempFile`,
/// not here) is the original fetch URL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MediaUrl {
  pub url: String,
  pub course_id: i64,
  pub media_class: MediaClass,
  pub relative_path: String,
  pub display_name: Option<String>,
  pub size: Option<i64>,
  pub created_at: Option<String>,
  pub modified_at: Option<String>,
}

/// A URL previously observed to fail, with back-off state (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BadUrl {
  pub url: String,
  pub course_id: i64,
  pub last_checked: String,
  pub times_checked: i64,
}

impl BadUrl {
  /// The cubic-in-attempts back-off from §3/P6: eligible for retry once
  /// `now > last_checked + (times_checked * 5)^3 minutes`.
  pub fn should_retry(&self, now: time::OffsetDateTime) -> bool {
    let last_checked = match time::OffsetDateTime::parse(&self.last_checked, &time::format_description::well_known::Rfc3339) {
      Ok(t) => t,
      Err(_) => return true,
    };
    let backoff_minutes = (self.times_checked * 5).pow(3);
    let eligible_at = last_checked + time::Duration::minutes(backoff_minutes);
    now > eligible_at
  }
}

/// An in-flight artifact on disk at a content-addressed path (§3). Exists only
/// between the download stage and conflict resolution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TempFile {
  pub course_id: i64,
  pub url: String,
  pub download_url: String,
  pub traffic_class: TrafficClass,
  pub relative_path: String,
  pub final_name: String,
  pub created_at: String,
}

/// The finalized on-disk artifact with its catalog record (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MediaContainer {
  pub url: String,
  pub course_id: i64,
  pub download_url: String,
  pub media_class: MediaClass,
  pub relative_path: String,
  pub final_name: String,
  pub size: i64,
  pub created_at: String,
  pub modified_at: Option<String>,
  pub checksum: String,
}

/// The single-row user identity (§3). `encrypted_password` is opaque to the
/// core; only the out-of-scope Authenticator collaborator decrypts it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct User {
  pub username: String,
  pub encrypted_password: Vec<u8>,
}

/// The one of {none, pip_install, pip_notify, github_install, github_notify}
/// external update collaborators consume (§6); the core only parses and stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
  None,
  PipInstall,
  PipNotify,
  GithubInstall,
  GithubNotify,
}

/// The single-row config entity (§3/§6). Durable fields that must survive
/// identically across runs (salt, sanitize flag, schema version) live here,
/// reconciled at startup with the operator-facing layered config (§2a).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigRow {
  pub salt: Vec<u8>,
  pub pw_encrypt_password: bool,
  pub download_rate_mbit: Option<f64>,
  pub fs_sanitize_filenames: bool,
  pub fs_course_default_shortname: bool,
  pub concurrent_courses: i64,
  pub update_policy: UpdatePolicy,
  pub schema_version: i64,
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  proptest! {
    /// P6: for any `times_checked`, `should_retry` is false at exactly the
    /// back-off boundary and true one second past it - monotone, not flaky.
    #[test]
    fn should_retry_flips_exactly_at_backoff_boundary_p6(times_checked in 1i64..20) {
      let last_checked = time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
      let bad = BadUrl {
        url: "https://example.org/x".into(),
        course_id: 1,
        last_checked: last_checked.format(&time::format_description::well_known::Rfc3339).unwrap(),
        times_checked,
      };
      let backoff_minutes = (times_checked * 5).pow(3);
      let at_boundary = last_checked + time::Duration::minutes(backoff_minutes);
      let past_boundary = at_boundary + time::Duration::seconds(1);
      let before_boundary = at_boundary - time::Duration::seconds(1);

      prop_assert!(!bad.should_retry(at_boundary));
      prop_assert!(!bad.should_retry(before_boundary));
      prop_assert!(bad.should_retry(past_boundary));
    }
  }
}
