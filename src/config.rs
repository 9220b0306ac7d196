//! Layered configuration (§2a, §6): defaults -> `<working_dir>/config.toml`
//! -> environment variables, producing an immutable [`Config`] snapshot.
//!
//! Durable fields that must survive identically across runs (the KDF salt,
//! the sanitize-filenames flag, the schema version) are not sourced from this
//! layered loader at all; they live in the Catalog's single-row `config` table
//! and are reconciled separately by [`reconcile_with_catalog`].

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::model::UpdatePolicy;

const ENV_PREFIX: &str = "CAMPUS_SYNC_";

/// The operator-facing configuration snapshot (§6), merged from defaults,
/// `config.toml`, and `CAMPUS_SYNC_*` environment variables, in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
  pub download_rate_mbit: Option<f64>,
  pub concurrent_courses: i64,
  pub fs_course_default_shortname: bool,
  pub fs_sanitize_filenames: bool,
  pub pw_encrypt_password: bool,
  pub update_policy: UpdatePolicy,
  /// §2b: a test-mode flag controlling whether Catalog write failures are
  /// re-raised instead of logged and swallowed. Defaults on under `#[cfg(test)]`.
  #[serde(default = "default_catalog_panic_on_write_failure")]
  pub catalog_panic_on_write_failure: bool,
}

fn default_catalog_panic_on_write_failure() -> bool {
  cfg!(test)
}

impl Default for Config {
  fn default() -> Self {
    Config {
      download_rate_mbit: None,
      concurrent_courses: 3,
      fs_course_default_shortname: true,
      fs_sanitize_filenames: true,
      pw_encrypt_password: false,
      update_policy: UpdatePolicy::None,
      catalog_panic_on_write_failure: default_catalog_panic_on_write_failure(),
    }
  }
}

impl Config {
  /// Loads the layered configuration from `<working_dir>/config.toml`,
  /// overridden by `CAMPUS_SYNC_*` environment variables (§2a/§6).
  pub fn load(working_dir: &Path) -> anyhow::Result<Config> {
    let toml_path = working_dir.join("config.toml");
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
      .merge(Toml::file(toml_path))
      .merge(Env::prefixed(ENV_PREFIX))
      .extract()?;
    Ok(config)
  }
}

/// Reconciles the layered config with the Catalog's durable `config` row
/// (§2a): the on-disk/env layer supplies operator-facing tunables, the
/// Catalog row is authoritative for the salt and, once set, the
/// sanitize-filenames flag (toggling it without migration invalidates the
/// existing catalog per §6, so the Catalog's prior value wins on conflict).
pub fn reconcile_with_catalog(layered: &Config, catalog_row: Option<&crate::model::ConfigRow>) -> crate::model::ConfigRow {
  match catalog_row {
    Some(existing) => crate::model::ConfigRow {
      salt: existing.salt.clone(),
      pw_encrypt_password: existing.pw_encrypt_password,
      download_rate_mbit: layered.download_rate_mbit,
      fs_sanitize_filenames: existing.fs_sanitize_filenames,
      fs_course_default_shortname: layered.fs_course_default_shortname,
      concurrent_courses: layered.concurrent_courses,
      update_policy: layered.update_policy,
      schema_version: existing.schema_version,
    },
    None => crate::model::ConfigRow {
      salt: generate_salt(),
      pw_encrypt_password: layered.pw_encrypt_password,
      download_rate_mbit: layered.download_rate_mbit,
      fs_sanitize_filenames: layered.fs_sanitize_filenames,
      fs_course_default_shortname: layered.fs_course_default_shortname,
      concurrent_courses: layered.concurrent_courses,
      update_policy: layered.update_policy,
      schema_version: crate::catalog::CURRENT_SCHEMA_VERSION,
    },
  }
}

/// A fresh per-install 32-byte salt for the PBKDF2-HMAC-SHA3-512 KDF (§6).
fn generate_salt() -> Vec<u8> {
  use rand::RngCore;
  let mut salt = vec![0u8; 32];
  rand::thread_rng().fill_bytes(&mut salt);
  salt
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_when_no_file_or_env() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.concurrent_courses, 3);
    assert!(config.download_rate_mbit.is_none());
  }

  #[test]
  fn toml_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "concurrent_courses = 7\ndownload_rate_mbit = 50.0\n").unwrap();
    let config = Config::load(dir.path()).unwrap();
    assert_eq!(config.concurrent_courses, 7);
    assert_eq!(config.download_rate_mbit, Some(50.0));
  }

  #[test]
  fn reconcile_seeds_fresh_salt_on_first_run() {
    let layered = Config::default();
    let row = reconcile_with_catalog(&layered, None);
    assert_eq!(row.salt.len(), 32);
    assert_eq!(row.schema_version, crate::catalog::CURRENT_SCHEMA_VERSION);
  }

  #[test]
  fn reconcile_preserves_existing_sanitize_flag() {
    let layered = Config {
      fs_sanitize_filenames: false,
      ..Config::default()
    };
    let existing = crate::model::ConfigRow {
      salt: vec![1; 32],
      pw_encrypt_password: false,
      download_rate_mbit: None,
      fs_sanitize_filenames: true,
      fs_course_default_shortname: true,
      concurrent_courses: 3,
      update_policy: UpdatePolicy::None,
      schema_version: 1,
    };
    let row = reconcile_with_catalog(&layered, Some(&existing));
    assert!(row.fs_sanitize_filenames, "catalog's prior flag wins over the new layered value");
    assert_eq!(row.salt, existing.salt);
  }
}
