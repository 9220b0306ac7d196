//! The Catalog (§4.3): durable relational store for Course, MediaUrl, BadUrl,
//! TempFile, MediaContainer, User and Config. All writes are idempotent;
//! primary-key conflicts collapse via `ON CONFLICT ... DO UPDATE`.
//!
//! Grounded on this codebase's `Db` (`persistence/mod.rs` in the pre-transform
//! tree): single-connection-behind-a-mutex, WAL pragmas, `params!`/
//! `query_row`/`query_map` idioms, and the settings-table upsert pattern.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, Result};
use crate::model::{BadUrl, Course, MediaClass, MediaContainer, MediaUrl, TempFile, TrafficClass, UpdatePolicy};

/// The schema version this binary expects. Table-driven migrations (below)
/// carry an on-disk database forward to this version at startup (§9).
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Catalog {
  #[allow(dead_code)]
  path: Arc<PathBuf>,
  conn: Arc<Mutex<Connection>>,
}

impl Catalog {
  pub fn open(path: PathBuf) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| EngineError::Fatal(format!("cannot create catalog directory: {e}")))?;
    }
    let conn = Connection::open(&path).map_err(EngineError::from)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let catalog = Catalog {
      path: Arc::new(path),
      conn: Arc::new(Mutex::new(conn)),
    };
    catalog.init_schema()?;
    catalog.migrate()?;
    Ok(catalog)
  }

  fn init_schema(&self) -> Result<()> {
    let sql = r#"
      CREATE TABLE IF NOT EXISTS courses (
        id INTEGER PRIMARY KEY,
        short_name TEXT NOT NULL,
        full_name TEXT NOT NULL,
        preferred_name TEXT,
        user_count INTEGER,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        last_access TEXT,
        last_modification TEXT,
        start TEXT,
        end TEXT
      );

      CREATE TABLE IF NOT EXISTS media_urls (
        url TEXT NOT NULL,
        course_id INTEGER NOT NULL REFERENCES courses(id),
        media_class TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        display_name TEXT,
        size INTEGER,
        created_at TEXT,
        modified_at TEXT,
        PRIMARY KEY (url, course_id)
      );

      CREATE TABLE IF NOT EXISTS bad_urls (
        url TEXT NOT NULL,
        course_id INTEGER NOT NULL,
        last_checked TEXT NOT NULL,
        times_checked INTEGER NOT NULL,
        PRIMARY KEY (url, course_id)
      );

      CREATE TABLE IF NOT EXISTS temp_files (
        course_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        download_url TEXT NOT NULL,
        traffic_class TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        final_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (course_id, url)
      );

      CREATE TABLE IF NOT EXISTS media_containers (
        url TEXT NOT NULL,
        course_id INTEGER NOT NULL,
        download_url TEXT NOT NULL,
        media_class TEXT NOT NULL,
        relative_path TEXT NOT NULL,
        final_name TEXT NOT NULL,
        size INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        modified_at TEXT,
        checksum TEXT NOT NULL,
        PRIMARY KEY (url, course_id)
      );

      CREATE TABLE IF NOT EXISTS user (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        username TEXT NOT NULL,
        encrypted_password BLOB NOT NULL
      );

      CREATE TABLE IF NOT EXISTS config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        salt BLOB NOT NULL,
        pw_encrypt_password INTEGER NOT NULL,
        download_rate_mbit REAL,
        fs_sanitize_filenames INTEGER NOT NULL,
        fs_course_default_shortname INTEGER NOT NULL,
        concurrent_courses INTEGER NOT NULL,
        update_policy TEXT NOT NULL,
        schema_version INTEGER NOT NULL
      );

      CREATE INDEX IF NOT EXISTS idx_media_urls_course ON media_urls(course_id);
      CREATE INDEX IF NOT EXISTS idx_temp_files_course ON temp_files(course_id);
    "#;

    let conn = self.conn.lock();
    conn.execute_batch(sql).map_err(EngineError::from)?;
    Ok(())
  }

  /// Table-driven migration list (§9 redesign note): an ordered
  /// `(from_version, to_version, closure)` list, applied in sequence. A
  /// database with no migration path to `CURRENT_SCHEMA_VERSION` is Fatal (§7).
  fn migrate(&self) -> Result<()> {
    const MIGRATIONS: &[(i64, i64, fn(&Connection) -> rusqlite::Result<()>)] = &[];

    let conn = self.conn.lock();
    let existing: Option<i64> = conn
      .query_row("SELECT schema_version FROM config WHERE id = 1", [], |r| r.get(0))
      .optional()
      .map_err(EngineError::from)?;

    let Some(mut version) = existing else {
      return Ok(()); // no config row yet: first run, seeded at CURRENT_SCHEMA_VERSION by write_config.
    };

    if version == CURRENT_SCHEMA_VERSION {
      return Ok(());
    }

    loop {
      let Some((_, to, apply)) = MIGRATIONS.iter().find(|(from, _, _)| *from == version) else {
        return Err(EngineError::Fatal(format!(
          "no migration path from schema version {version} to {CURRENT_SCHEMA_VERSION}"
        )));
      };
      apply(&conn).map_err(EngineError::from)?;
      version = *to;
      if version == CURRENT_SCHEMA_VERSION {
        break;
      }
    }

    conn
      .execute("UPDATE config SET schema_version = ?1 WHERE id = 1", params![CURRENT_SCHEMA_VERSION])
      .map_err(EngineError::from)?;
    Ok(())
  }

  // ---- Course ----

  pub fn upsert_course(&self, course: &Course) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO courses (id, short_name, full_name, preferred_name, user_count, is_favorite, last_access, last_modification, start, end)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
          short_name = excluded.short_name,
          full_name = excluded.full_name,
          preferred_name = excluded.preferred_name,
          user_count = excluded.user_count,
          is_favorite = excluded.is_favorite,
          last_access = excluded.last_access,
          last_modification = excluded.last_modification,
          start = excluded.start,
          end = excluded.end
        "#,
        params![
          course.id,
          course.short_name,
          course.full_name,
          course.preferred_name,
          course.user_count,
          course.is_favorite as i64,
          course.last_access,
          course.last_modification,
          course.start,
          course.end,
        ],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn get_course(&self, id: i64) -> Result<Option<Course>> {
    let conn = self.conn.lock();
    conn
      .query_row(
        "SELECT id, short_name, full_name, preferred_name, user_count, is_favorite, last_access, last_modification, start, end FROM courses WHERE id = ?1",
        params![id],
        row_to_course,
      )
      .optional()
      .map_err(EngineError::from)
  }

  pub fn list_courses(&self) -> Result<Vec<Course>> {
    let conn = self.conn.lock();
    let mut stmt = conn
      .prepare("SELECT id, short_name, full_name, preferred_name, user_count, is_favorite, last_access, last_modification, start, end FROM courses")
      .map_err(EngineError::from)?;
    let rows = stmt.query_map([], row_to_course).map_err(EngineError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
  }

  // ---- MediaUrl ----

  pub fn insert_media_url(&self, media_url: &MediaUrl) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO media_urls (url, course_id, media_class, relative_path, display_name, size, created_at, modified_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(url, course_id) DO UPDATE SET
          size = COALESCE(excluded.size, media_urls.size),
          modified_at = COALESCE(excluded.modified_at, media_urls.modified_at)
        "#,
        params![
          media_url.url,
          media_url.course_id,
          media_class_to_str(media_url.media_class),
          media_url.relative_path,
          media_url.display_name,
          media_url.size,
          media_url.created_at,
          media_url.modified_at,
        ],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn get_media_url(&self, url: &str, course_id: i64) -> Result<Option<MediaUrl>> {
    let conn = self.conn.lock();
    conn
      .query_row(
        "SELECT url, course_id, media_class, relative_path, display_name, size, created_at, modified_at FROM media_urls WHERE url = ?1 AND course_id = ?2",
        params![url, course_id],
        row_to_media_url,
      )
      .optional()
      .map_err(EngineError::from)
  }

  pub fn list_media_urls_by_course(&self, course_id: i64) -> Result<Vec<MediaUrl>> {
    let conn = self.conn.lock();
    let mut stmt = conn
      .prepare("SELECT url, course_id, media_class, relative_path, display_name, size, created_at, modified_at FROM media_urls WHERE course_id = ?1")
      .map_err(EngineError::from)?;
    let rows = stmt.query_map(params![course_id], row_to_media_url).map_err(EngineError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
  }

  // ---- BadUrl ----

  /// Inserts a new `BadUrl` or bumps `times_checked`/`last_checked` on an
  /// existing one (§3/§4.3).
  pub fn record_bad_url(&self, url: &str, course_id: i64, now_rfc3339: &str) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO bad_urls (url, course_id, last_checked, times_checked)
        VALUES (?1, ?2, ?3, 1)
        ON CONFLICT(url, course_id) DO UPDATE SET
          last_checked = excluded.last_checked,
          times_checked = bad_urls.times_checked + 1
        "#,
        params![url, course_id, now_rfc3339],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn get_bad_url(&self, url: &str, course_id: i64) -> Result<Option<BadUrl>> {
    let conn = self.conn.lock();
    conn
      .query_row(
        "SELECT url, course_id, last_checked, times_checked FROM bad_urls WHERE url = ?1 AND course_id = ?2",
        params![url, course_id],
        |row| {
          Ok(BadUrl {
            url: row.get(0)?,
            course_id: row.get(1)?,
            last_checked: row.get(2)?,
            times_checked: row.get(3)?,
          })
        },
      )
      .optional()
      .map_err(EngineError::from)
  }

  pub fn delete_bad_url(&self, url: &str, course_id: i64) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute("DELETE FROM bad_urls WHERE url = ?1 AND course_id = ?2", params![url, course_id])
      .map_err(EngineError::from)?;
    Ok(())
  }

  // ---- TempFile ----

  pub fn insert_temp_file(&self, temp_file: &TempFile) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO temp_files (course_id, url, download_url, traffic_class, relative_path, final_name, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(course_id, url) DO UPDATE SET
          download_url = excluded.download_url,
          traffic_class = excluded.traffic_class,
          relative_path = excluded.relative_path,
          final_name = excluded.final_name,
          created_at = excluded.created_at
        "#,
        params![
          temp_file.course_id,
          temp_file.url,
          temp_file.download_url,
          traffic_class_to_str(temp_file.traffic_class),
          temp_file.relative_path,
          temp_file.final_name,
          temp_file.created_at,
        ],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn delete_temp_file(&self, course_id: i64, url: &str) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute("DELETE FROM temp_files WHERE course_id = ?1 AND url = ?2", params![course_id, url])
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn list_temp_files(&self) -> Result<Vec<TempFile>> {
    let conn = self.conn.lock();
    let mut stmt = conn
      .prepare("SELECT course_id, url, download_url, traffic_class, relative_path, final_name, created_at FROM temp_files")
      .map_err(EngineError::from)?;
    let rows = stmt.query_map([], row_to_temp_file).map_err(EngineError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
  }

  // ---- MediaContainer ----

  pub fn get_media_container(&self, url: &str, course_id: i64) -> Result<Option<MediaContainer>> {
    let conn = self.conn.lock();
    conn
      .query_row(
        "SELECT url, course_id, download_url, media_class, relative_path, final_name, size, created_at, modified_at, checksum FROM media_containers WHERE url = ?1 AND course_id = ?2",
        params![url, course_id],
        row_to_media_container,
      )
      .optional()
      .map_err(EngineError::from)
  }

  pub fn list_media_containers(&self) -> Result<Vec<MediaContainer>> {
    let conn = self.conn.lock();
    let mut stmt = conn
      .prepare("SELECT url, course_id, download_url, media_class, relative_path, final_name, size, created_at, modified_at, checksum FROM media_containers")
      .map_err(EngineError::from)?;
    let rows = stmt.query_map([], row_to_media_container).map_err(EngineError::from)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
  }

  /// Atomically swaps a `TempFile` for a `MediaContainer` (§4.6 step 3): the
  /// insert and the delete happen in one transaction, so a crash leaves
  /// either the temp row or the final row, never both.
  pub fn commit_temp_file_as_container(&self, container: &MediaContainer) -> Result<()> {
    let mut conn = self.conn.lock();
    let tx = conn.transaction().map_err(EngineError::from)?;

    tx.execute(
      r#"
      INSERT INTO media_containers (url, course_id, download_url, media_class, relative_path, final_name, size, created_at, modified_at, checksum)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
      ON CONFLICT(url, course_id) DO UPDATE SET
        download_url = excluded.download_url,
        media_class = excluded.media_class,
        relative_path = excluded.relative_path,
        final_name = excluded.final_name,
        size = excluded.size,
        created_at = excluded.created_at,
        modified_at = excluded.modified_at,
        checksum = excluded.checksum
      "#,
      params![
        container.url,
        container.course_id,
        container.download_url,
        media_class_to_str(container.media_class),
        container.relative_path,
        container.final_name,
        container.size,
        container.created_at,
        container.modified_at,
        container.checksum,
      ],
    )
    .map_err(EngineError::from)?;

    tx.execute(
      "DELETE FROM temp_files WHERE course_id = ?1 AND url = ?2",
      params![container.course_id, container.url],
    )
    .map_err(EngineError::from)?;

    tx.commit().map_err(EngineError::from)?;
    Ok(())
  }

  // ---- User / Config (single-row entities) ----

  pub fn read_config(&self) -> Result<Option<crate::model::ConfigRow>> {
    let conn = self.conn.lock();
    conn
      .query_row(
        "SELECT salt, pw_encrypt_password, download_rate_mbit, fs_sanitize_filenames, fs_course_default_shortname, concurrent_courses, update_policy, schema_version FROM config WHERE id = 1",
        [],
        |row| {
          Ok(crate::model::ConfigRow {
            salt: row.get(0)?,
            pw_encrypt_password: row.get::<_, i64>(1)? != 0,
            download_rate_mbit: row.get(2)?,
            fs_sanitize_filenames: row.get::<_, i64>(3)? != 0,
            fs_course_default_shortname: row.get::<_, i64>(4)? != 0,
            concurrent_courses: row.get(5)?,
            update_policy: str_to_update_policy(&row.get::<_, String>(6)?),
            schema_version: row.get(7)?,
          })
        },
      )
      .optional()
      .map_err(EngineError::from)
  }

  pub fn write_config(&self, config: &crate::model::ConfigRow) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO config (id, salt, pw_encrypt_password, download_rate_mbit, fs_sanitize_filenames, fs_course_default_shortname, concurrent_courses, update_policy, schema_version)
        VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
          salt = excluded.salt,
          pw_encrypt_password = excluded.pw_encrypt_password,
          download_rate_mbit = excluded.download_rate_mbit,
          fs_sanitize_filenames = excluded.fs_sanitize_filenames,
          fs_course_default_shortname = excluded.fs_course_default_shortname,
          concurrent_courses = excluded.concurrent_courses,
          update_policy = excluded.update_policy,
          schema_version = excluded.schema_version
        "#,
        params![
          config.salt,
          config.pw_encrypt_password as i64,
          config.download_rate_mbit,
          config.fs_sanitize_filenames as i64,
          config.fs_course_default_shortname as i64,
          config.concurrent_courses,
          update_policy_to_str(config.update_policy),
          config.schema_version,
        ],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }

  pub fn read_user(&self) -> Result<Option<crate::model::User>> {
    let conn = self.conn.lock();
    conn
      .query_row("SELECT username, encrypted_password FROM user WHERE id = 1", [], |row| {
        Ok(crate::model::User {
          username: row.get(0)?,
          encrypted_password: row.get(1)?,
        })
      })
      .optional()
      .map_err(EngineError::from)
  }

  pub fn write_user(&self, user: &crate::model::User) -> Result<()> {
    let conn = self.conn.lock();
    conn
      .execute(
        r#"
        INSERT INTO user (id, username, encrypted_password) VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET username = excluded.username, encrypted_password = excluded.encrypted_password
        "#,
        params![user.username, user.encrypted_password],
      )
      .map_err(EngineError::from)?;
    Ok(())
  }
}

pub fn now_rfc3339() -> String {
  time::OffsetDateTime::now_utc()
    .format(&time::format_description::well_known::Rfc3339)
    .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn media_class_to_str(c: MediaClass) -> &'static str {
  match c {
    MediaClass::Document => "document",
    MediaClass::Extern => "extern",
    MediaClass::Video => "video",
    MediaClass::Archive => "archive",
    MediaClass::CorruptedOnDisk => "corrupted_on_disk",
    MediaClass::NotAvailable => "not_available",
    MediaClass::NotAvailableForLegalReasons => "not_available_for_legal_reasons",
    MediaClass::Hardlink => "hardlink",
  }
}

fn str_to_media_class(s: &str) -> MediaClass {
  match s {
    "extern" => MediaClass::Extern,
    "video" => MediaClass::Video,
    "archive" => MediaClass::Archive,
    "corrupted_on_disk" => MediaClass::CorruptedOnDisk,
    "not_available" => MediaClass::NotAvailable,
    "not_available_for_legal_reasons" => MediaClass::NotAvailableForLegalReasons,
    "hardlink" => MediaClass::Hardlink,
    _ => MediaClass::Document,
  }
}

fn traffic_class_to_str(c: TrafficClass) -> &'static str {
  match c {
    TrafficClass::Stream => "stream",
    TrafficClass::Extern => "extern",
    TrafficClass::Document => "document",
    TrafficClass::Video => "video",
    TrafficClass::FreeForAll => "free_for_all",
  }
}

fn str_to_traffic_class(s: &str) -> TrafficClass {
  match s {
    "stream" => TrafficClass::Stream,
    "extern" => TrafficClass::Extern,
    "video" => TrafficClass::Video,
    "free_for_all" => TrafficClass::FreeForAll,
    _ => TrafficClass::Document,
  }
}

fn update_policy_to_str(p: UpdatePolicy) -> &'static str {
  match p {
    UpdatePolicy::None => "none",
    UpdatePolicy::PipInstall => "pip_install",
    UpdatePolicy::PipNotify => "pip_notify",
    UpdatePolicy::GithubInstall => "github_install",
    UpdatePolicy::GithubNotify => "github_notify",
  }
}

fn str_to_update_policy(s: &str) -> UpdatePolicy {
  match s {
    "pip_install" => UpdatePolicy::PipInstall,
    "pip_notify" => UpdatePolicy::PipNotify,
    "github_install" => UpdatePolicy::GithubInstall,
    "github_notify" => UpdatePolicy::GithubNotify,
    _ => UpdatePolicy::None,
  }
}

fn row_to_course(row: &rusqlite::Row) -> rusqlite::Result<Course> {
  Ok(Course {
    id: row.get(0)?,
    short_name: row.get(1)?,
    full_name: row.get(2)?,
    preferred_name: row.get(3)?,
    user_count: row.get(4)?,
    is_favorite: row.get::<_, i64>(5)? != 0,
    last_access: row.get(6)?,
    last_modification: row.get(7)?,
    start: row.get(8)?,
    end: row.get(9)?,
  })
}

fn row_to_media_url(row: &rusqlite::Row) -> rusqlite::Result<MediaUrl> {
  Ok(MediaUrl {
    url: row.get(0)?,
    course_id: row.get(1)?,
    media_class: str_to_media_class(&row.get::<_, String>(2)?),
    relative_path: row.get(3)?,
    display_name: row.get(4)?,
    size: row.get(5)?,
    created_at: row.get(6)?,
    modified_at: row.get(7)?,
  })
}

fn row_to_temp_file(row: &rusqlite::Row) -> rusqlite::Result<TempFile> {
  Ok(TempFile {
    course_id: row.get(0)?,
    url: row.get(1)?,
    download_url: row.get(2)?,
    traffic_class: str_to_traffic_class(&row.get::<_, String>(3)?),
    relative_path: row.get(4)?,
    final_name: row.get(5)?,
    created_at: row.get(6)?,
  })
}

fn row_to_media_container(row: &rusqlite::Row) -> rusqlite::Result<MediaContainer> {
  Ok(MediaContainer {
    url: row.get(0)?,
    course_id: row.get(1)?,
    download_url: row.get(2)?,
    media_class: str_to_media_class(&row.get::<_, String>(3)?),
    relative_path: row.get(4)?,
    final_name: row.get(5)?,
    size: row.get(6)?,
    created_at: row.get(7)?,
    modified_at: row.get(8)?,
    checksum: row.get(9)?,
  })
}

/// Computes the on-disk location of a `TempFile` (§3): content-addressed by
/// `hex(sha256(download_url))`, partitioned by course directory.
pub fn temp_file_path(working_dir: &Path, temp_root: &str, course_dir: &str, download_url: &str) -> PathBuf {
  use sha2::{Digest, Sha256};
  let digest = Sha256::digest(download_url.as_bytes());
  working_dir.join(temp_root).join(course_dir).join(hex::encode(digest))
}
