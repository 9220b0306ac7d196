//! Authenticated Session (§4.2): a long-lived HTTP client carrying the LMS
//! session key and mobile API token, with bounded retry and a per-attempt
//! timeout policy.
//!
//! Grounded on the reference tool's `AuthenticatedSession`
//! (`original_source/src/isisdl/api/models.py`) for the retry/timeout/scheme
//! rules, and on this codebase's `transport::build_client` for the
//! reqwest client-builder idiom.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, Response};

use crate::error::EngineError;

/// `num_tries` from §4.2.
pub const NUM_TRIES_DOWNLOAD: u32 = 5;
const DOWNLOAD_BASE_TIMEOUT_SECS: f64 = 10.0;
const DOWNLOAD_TIMEOUT_MULTIPLIER: f64 = 2.0;
const DOWNLOAD_STATIC_SLEEP: Duration = Duration::from_millis(500);
const TUBCLOUD_HOST: &str = "tubcloud.tu-berlin.de";
const TUBCLOUD_BASE_TIMEOUT_SECS: f64 = 25.0;

/// The LMS REST endpoint, which is exempt from the timeout formula (§4.2):
/// it may legitimately block for tens of seconds.
pub const LMS_API_ENDPOINT: &str = "https://isis.tu-berlin.de/webservice/rest/server.php";

/// A long-lived, authenticated HTTP client. Construction (obtaining
/// `session_key`/`api_token` via Shibboleth/SAML) is the out-of-scope
/// Authenticator collaborator's job (§2b); this type only wraps the result.
#[derive(Clone)]
pub struct AuthenticatedSession {
  client: Client,
  client_no_redirect: Client,
  session_key: String,
  api_token: String,
}

impl AuthenticatedSession {
  pub fn new(client: Client, client_no_redirect: Client, session_key: String, api_token: String) -> Self {
    AuthenticatedSession {
      client,
      client_no_redirect,
      session_key,
      api_token,
    }
  }

  pub fn session_key(&self) -> &str {
    &self.session_key
  }

  pub fn api_token(&self) -> &str {
    &self.api_token
  }

  /// Transparent scheme upgrade (§4.2c): a URL with no scheme is treated as `https://`.
  fn normalize_scheme(url: &str) -> String {
    if url.starts_with("http") {
      url.to_string()
    } else {
      format!("https://{url}")
    }
  }

  /// Intercepts the LMS's custom `moodlemobile://` redirect scheme (§4.2d),
  /// extracting the mobile API token embedded after `token=` without an OS
  /// scheme-handler round trip.
  pub fn extract_moodlemobile_token(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("token=")?;
    let token = rest.split(['&', '#']).next().unwrap_or(rest);
    if token.is_empty() {
      None
    } else {
      Some(token.to_string())
    }
  }

  /// `base_timeout + multiplier^(1.7*attempt)` (§4.2b), with the LMS REST
  /// endpoint exempt and the known-slow tubcloud host using a longer base.
  fn calculate_timeout(url: &str, attempt: u32) -> Option<Duration> {
    if url == LMS_API_ENDPOINT {
      return None;
    }
    let base = if url.contains(TUBCLOUD_HOST) {
      TUBCLOUD_BASE_TIMEOUT_SECS
    } else {
      DOWNLOAD_BASE_TIMEOUT_SECS
    };
    let extra = DOWNLOAD_TIMEOUT_MULTIPLIER.powf(1.7 * attempt as f64);
    Some(Duration::from_secs_f64(base + extra))
  }

  async fn with_retry<F, Fut>(&self, url: &str, build: F) -> Result<Response, EngineError>
  where
    F: Fn(&Client, &str, Option<Duration>) -> Fut,
    Fut: std::future::Future<Output = reqwest::Result<Response>>,
  {
    let url = Self::normalize_scheme(url);
    let mut last_err = None;

    for attempt in 0..NUM_TRIES_DOWNLOAD {
      let timeout = Self::calculate_timeout(&url, attempt);
      match build(&self.client, &url, timeout).await {
        Ok(resp) => return Ok(resp),
        Err(e) => {
          tracing::warn!(target: "session", attempt, url = %url, error = %e, "request attempt failed");
          last_err = Some(e);
          tokio::time::sleep(DOWNLOAD_STATIC_SLEEP).await;
        }
      }
    }

    // Retry budget exhausted: a plain `Err` fulfils the role the source's
    // `Error` async-context-manager sentinel played (§9 redesign note) —
    // callers use ordinary `?`/scoped cleanup instead of null-checking.
    Err(EngineError::TransientNetwork(last_err.expect("at least one attempt was made")))
  }

  pub async fn get(&self, url: &str) -> Result<Response, EngineError> {
    self
      .with_retry(url, |client, url, timeout| {
        let mut req = client.get(url);
        if let Some(t) = timeout {
          req = req.timeout(t);
        }
        req.send()
      })
      .await
  }

  pub async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<Response, EngineError> {
    self
      .with_retry(url, move |client, url, timeout| {
        let mut req = client.post(url).json(&body);
        if let Some(t) = timeout {
          req = req.timeout(t);
        }
        req.send()
      })
      .await
  }

  /// A `HEAD` request with redirects disabled, so the Planner (§4.4 rule 5)
  /// can observe a 303's `Location` header directly.
  pub async fn head_no_redirect(&self, url: &str) -> Result<Response, EngineError> {
    let url = Self::normalize_scheme(url);
    let mut last_err = None;
    for attempt in 0..NUM_TRIES_DOWNLOAD {
      let timeout = Self::calculate_timeout(&url, attempt);
      let mut req = self.client_no_redirect.head(&url);
      if let Some(t) = timeout {
        req = req.timeout(t);
      }
      match req.send().await {
        Ok(resp) => return Ok(resp),
        Err(e) => {
          last_err = Some(e);
          tokio::time::sleep(DOWNLOAD_STATIC_SLEEP).await;
        }
      }
    }
    Err(EngineError::TransientNetwork(last_err.expect("at least one attempt was made")))
  }
}

/// Builds the two reqwest clients an `AuthenticatedSession` needs: one that
/// follows redirects normally, one that never does (for Planner rule 5).
/// `pool_size` is provisioned once from the resolved `concurrent_courses`
/// worker-count configuration (§4.2), not reconfigured per request.
pub fn build_clients(pool_size: usize) -> anyhow::Result<(Client, Client)> {
  let user_agent = concat!("campus-sync (Rust) version ", env!("CARGO_PKG_VERSION"));

  let following = Client::builder()
    .user_agent(user_agent)
    .redirect(reqwest::redirect::Policy::limited(10))
    .pool_max_idle_per_host(pool_size.max(1))
    .connect_timeout(Duration::from_secs(15))
    .build()
    .context("failed to build redirect-following reqwest client")?;

  let no_redirect = Client::builder()
    .user_agent(user_agent)
    .redirect(reqwest::redirect::Policy::none())
    .pool_max_idle_per_host(pool_size.max(1))
    .connect_timeout(Duration::from_secs(15))
    .build()
    .context("failed to build non-redirecting reqwest client")?;

  Ok((following, no_redirect))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn moodlemobile_token_extraction() {
    let url = "moodlemobile://launch?service=moodle_mobile_app&token=abc123&extra=1";
    assert_eq!(AuthenticatedSession::extract_moodlemobile_token(url), Some("abc123".to_string()));
  }

  #[test]
  fn moodlemobile_token_missing() {
    assert_eq!(AuthenticatedSession::extract_moodlemobile_token("moodlemobile://launch?service=x"), None);
  }

  #[test]
  fn scheme_upgrade() {
    assert_eq!(AuthenticatedSession::normalize_scheme("example.com/file"), "https://example.com/file");
    assert_eq!(AuthenticatedSession::normalize_scheme("http://example.com"), "http://example.com");
  }

  #[test]
  fn timeout_formula_skips_for_lms_endpoint() {
    assert_eq!(AuthenticatedSession::calculate_timeout(LMS_API_ENDPOINT, 3), None);
  }

  #[test]
  fn timeout_grows_with_attempts() {
    let t0 = AuthenticatedSession::calculate_timeout("https://isis.tu-berlin.de/file.php", 0).unwrap();
    let t3 = AuthenticatedSession::calculate_timeout("https://isis.tu-berlin.de/file.php", 3).unwrap();
    assert!(t3 > t0);
  }

  #[test]
  fn tubcloud_gets_longer_base_timeout() {
    let normal = AuthenticatedSession::calculate_timeout("https://isis.tu-berlin.de/file.php", 0).unwrap();
    let tubcloud = AuthenticatedSession::calculate_timeout("https://tubcloud.tu-berlin.de/file.php", 0).unwrap();
    assert!(tubcloud > normal);
  }
}
