//! Conflict Resolver (§4.6): checksums every `TempFile` produced this run,
//! collapses or disambiguates name collisions, then commits finalized
//! `MediaContainer` rows and moves files into their final home.
//!
//! Grounded on `original_source/src/isisdl/backend/checksums.py` (the
//! sampled-checksum comparison used to dedup equal content) and this
//! codebase's `engine/naming.rs` (`(n)`-suffix collision mechanics,
//! generalized here to the `(i/n)` form §4.6 specifies).

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::catalog::{now_rfc3339, Catalog};
use crate::checksum::local_checksum;
use crate::error::{EngineError, Result};
use crate::model::{MediaClass, MediaContainer, TempFile};

/// One `TempFile` plus its computed local checksum (§4.3), carried through
/// bucketing so the checksum is never recomputed.
struct Checksummed {
  temp_file: TempFile,
  media_class: MediaClass,
  checksum: String,
  size: i64,
}

/// Runs the full resolution pass over every `TempFile` currently in the
/// Catalog: checksum, bucket, disambiguate, commit. Returns the number of
/// `MediaContainer`s produced.
pub fn resolve_all(catalog: &Catalog, working_dir: &Path, courses_root: &str, course_dirs: &HashMap<i64, String>) -> Result<usize> {
  let temp_files = catalog.list_temp_files()?;
  let mut checksummed = Vec::with_capacity(temp_files.len());

  for temp_file in temp_files {
    let Some(course_dir) = course_dirs.get(&temp_file.course_id) else {
      tracing::warn!(target: "conflict_resolver", course_id = temp_file.course_id, "no course directory known, skipping temp file");
      continue;
    };
    let temp_path = crate::catalog::temp_file_path(working_dir, &temp_root_name(), course_dir, &temp_file.download_url);
    let metadata = match std::fs::metadata(&temp_path) {
      Ok(m) => m,
      Err(e) => {
        tracing::warn!(target: "conflict_resolver", path = %temp_path.display(), error = %e, "temp file missing at resolution time");
        continue;
      }
    };
    let size = metadata.len() as i64;
    let file = File::open(&temp_path).map_err(|e| EngineError::Fatal(format!("cannot open temp file for checksum: {e}")))?;
    let checksum = local_checksum(file, size as u64).map_err(|e| EngineError::Fatal(format!("checksum failed: {e}")))?;
    let media_class = media_class_for(catalog, &temp_file)?;
    checksummed.push(Checksummed { temp_file, media_class, checksum, size });
  }

  let buckets = bucket_by_destination(checksummed);
  let mut produced = 0;

  for ((course_id, relative_path, final_name), bucket) in buckets {
    let course_dir = match course_dirs.get(&course_id) {
      Some(d) => d,
      None => continue,
    };
    produced += resolve_bucket(catalog, working_dir, courses_root, course_dir, &relative_path, &final_name, bucket)?;
  }

  Ok(produced)
}

/// `TempFile` doesn't carry its own `media_class` column, but it shares its
/// `(url, course_id)` key with the `MediaUrl` that produced it, so the
/// winning `MediaContainer` recovers its class through that join rather
/// than assuming `document`. A `MediaUrl` row always exists by the time a
/// `TempFile` for it does (the planner only schedules what the Catalog
/// already holds a `MediaUrl` for); falling back to `document` only covers
/// the Catalog having been mutated out from under a run.
fn media_class_for(catalog: &Catalog, temp_file: &TempFile) -> Result<MediaClass> {
  Ok(
    catalog
      .get_media_url(&temp_file.url, temp_file.course_id)?
      .map(|media_url| media_url.media_class)
      .unwrap_or(MediaClass::Document),
  )
}

fn temp_root_name() -> String {
  "temp".to_string()
}

type BucketKey = (i64, String, String);

fn bucket_by_destination(items: Vec<Checksummed>) -> HashMap<BucketKey, Vec<Checksummed>> {
  let mut buckets: HashMap<BucketKey, Vec<Checksummed>> = HashMap::new();
  for item in items {
    let key = (item.temp_file.course_id, item.temp_file.relative_path.clone(), item.temp_file.final_name.clone());
    buckets.entry(key).or_default().push(item);
  }
  buckets
}

#[allow(clippy::too_many_arguments)]
fn resolve_bucket(
  catalog: &Catalog,
  working_dir: &Path,
  courses_root: &str,
  course_dir: &str,
  relative_path: &str,
  final_name: &str,
  mut bucket: Vec<Checksummed>,
) -> Result<usize> {
  if bucket.is_empty() {
    return Ok(0);
  }

  // Stable order by (created_at asc, url asc), per §4.6 step 2.
  bucket.sort_by(|a, b| {
    a.temp_file
      .created_at
      .cmp(&b.temp_file.created_at)
      .then_with(|| a.temp_file.url.cmp(&b.temp_file.url))
  });

  let mut winners_by_checksum: HashMap<String, usize> = HashMap::new();
  let mut survivors: Vec<&Checksummed> = Vec::new();
  for item in &bucket {
    if !winners_by_checksum.contains_key(&item.checksum) {
      winners_by_checksum.insert(item.checksum.clone(), survivors.len());
      survivors.push(item);
    } else {
      // Equal-checksum duplicate: the loser's temp file is simply discarded.
      let loser_path = crate::catalog::temp_file_path(working_dir, &temp_root_name(), course_dir, &item.temp_file.download_url);
      let _ = std::fs::remove_file(&loser_path);
      catalog.delete_temp_file(item.temp_file.course_id, &item.temp_file.url)?;
    }
  }

  let n = survivors.len().saturating_sub(1);
  let mut committed = 0;
  for (i, item) in survivors.into_iter().enumerate() {
    let disambiguated_name = if n == 0 {
      final_name.to_string()
    } else {
      append_disambiguation_suffix(final_name, i, n)
    };

    let dest_dir = working_dir.join(courses_root).join(course_dir).join(relative_path);
    std::fs::create_dir_all(&dest_dir).map_err(|e| EngineError::Fatal(format!("cannot create destination directory: {e}")))?;
    let dest_path = dest_dir.join(&disambiguated_name);
    let temp_path = crate::catalog::temp_file_path(working_dir, &temp_root_name(), course_dir, &item.temp_file.download_url);

    std::fs::rename(&temp_path, &dest_path).map_err(|e| EngineError::Fatal(format!("cannot finalize temp file: {e}")))?;

    let container = MediaContainer {
      url: item.temp_file.url.clone(),
      course_id: item.temp_file.course_id,
      download_url: item.temp_file.download_url.clone(),
      media_class: item.media_class,
      relative_path: relative_path.to_string(),
      final_name: disambiguated_name,
      size: item.size,
      created_at: item.temp_file.created_at.clone(),
      modified_at: Some(now_rfc3339()),
      checksum: item.checksum.clone(),
    };

    if let Err(e) = catalog.commit_temp_file_as_container(&container) {
      // The rename already happened; undo it so the filesystem and Catalog
      // don't disagree about what's finalized.
      let _ = std::fs::rename(&dest_path, &temp_path);
      return Err(e);
    }
    committed += 1;
  }

  Ok(committed)
}

/// Appends the `(i/n)` disambiguation suffix of §4.6 step 2 before the file
/// extension, e.g. `slides.pdf` -> `slides(1/2).pdf`.
fn append_disambiguation_suffix(final_name: &str, i: usize, n: usize) -> String {
  let path = Path::new(final_name);
  let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(final_name);
  match path.extension().and_then(|e| e.to_str()) {
    Some(ext) => format!("{stem}({i}/{n}).{ext}"),
    None => format!("{stem}({i}/{n})"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disambiguation_suffix_preserves_extension() {
    assert_eq!(append_disambiguation_suffix("slides.pdf", 1, 2), "slides(1/2).pdf");
    assert_eq!(append_disambiguation_suffix("README", 0, 1), "README(0/1)");
  }

  fn temp_file(course_id: i64, url: &str, created_at: &str) -> TempFile {
    TempFile {
      course_id,
      url: url.to_string(),
      download_url: format!("https://example.org/{url}"),
      traffic_class: crate::model::TrafficClass::Document,
      relative_path: "docs".to_string(),
      final_name: "slides.pdf".to_string(),
      created_at: created_at.to_string(),
    }
  }

  #[test]
  fn bucket_groups_by_course_path_and_name() {
    let items = vec![
      Checksummed { temp_file: temp_file(1, "a", "2024-01-01T00:00:00Z"), media_class: MediaClass::Document, checksum: "c1".into(), size: 10 },
      Checksummed { temp_file: temp_file(1, "b", "2024-01-02T00:00:00Z"), media_class: MediaClass::Document, checksum: "c2".into(), size: 20 },
      Checksummed { temp_file: temp_file(2, "c", "2024-01-01T00:00:00Z"), media_class: MediaClass::Document, checksum: "c3".into(), size: 30 },
    ];
    let buckets = bucket_by_destination(items);
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets.get(&(1, "docs".to_string(), "slides.pdf".to_string())).unwrap().len(), 2);
  }

  #[test]
  fn resolve_bucket_collapses_equal_checksums_and_finalizes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let working_dir = dir.path();
    let catalog = Catalog::open(working_dir.join("state.db")).unwrap();
    catalog
      .upsert_course(&crate::model::Course {
        id: 1,
        short_name: "cs101".into(),
        full_name: "Intro to CS".into(),
        preferred_name: None,
        user_count: None,
        is_favorite: false,
        last_access: None,
        last_modification: None,
        start: None,
        end: None,
      })
      .unwrap();

    let temp_root = working_dir.join("temp").join("cs101");
    std::fs::create_dir_all(&temp_root).unwrap();

    let tf_a = temp_file(1, "a", "2024-01-01T00:00:00Z");
    let tf_b = temp_file(1, "b", "2024-01-02T00:00:00Z");
    let path_a = crate::catalog::temp_file_path(working_dir, "temp", "cs101", &tf_a.download_url);
    let path_b = crate::catalog::temp_file_path(working_dir, "temp", "cs101", &tf_b.download_url);
    std::fs::write(&path_a, b"identical content").unwrap();
    std::fs::write(&path_b, b"identical content").unwrap();
    catalog.insert_temp_file(&tf_a).unwrap();
    catalog.insert_temp_file(&tf_b).unwrap();

    let mut course_dirs = HashMap::new();
    course_dirs.insert(1, "cs101".to_string());

    let produced = resolve_all(&catalog, working_dir, "courses", &course_dirs).unwrap();
    assert_eq!(produced, 1);
    assert!(working_dir.join("courses").join("cs101").join("docs").join("slides.pdf").exists());
    assert!(catalog.list_temp_files().unwrap().is_empty());
    assert_eq!(catalog.list_media_containers().unwrap().len(), 1);
  }

  #[test]
  fn media_class_for_joins_the_originating_media_url() {
    let dir = tempfile::tempdir().unwrap();
    let working_dir = dir.path();
    let catalog = Catalog::open(working_dir.join("state.db")).unwrap();
    catalog
      .upsert_course(&crate::model::Course {
        id: 1,
        short_name: "cs101".into(),
        full_name: "Intro to CS".into(),
        preferred_name: None,
        user_count: None,
        is_favorite: false,
        last_access: None,
        last_modification: None,
        start: None,
        end: None,
      })
      .unwrap();
    catalog
      .insert_media_url(&crate::model::MediaUrl {
        url: "a".into(),
        course_id: 1,
        media_class: MediaClass::Video,
        relative_path: "docs".into(),
        display_name: None,
        size: None,
        created_at: None,
        modified_at: None,
      })
      .unwrap();

    let tf = temp_file(1, "a", "2024-01-01T00:00:00Z");
    assert_eq!(media_class_for(&catalog, &tf).unwrap(), MediaClass::Video);

    // Falls back to `document` when the Catalog has no matching `MediaUrl`.
    let tf_orphan = temp_file(1, "missing", "2024-01-01T00:00:00Z");
    assert_eq!(media_class_for(&catalog, &tf_orphan).unwrap(), MediaClass::Document);
  }

  #[test]
  fn resolve_bucket_disambiguates_distinct_checksums_by_arrival_time_s4() {
    let dir = tempfile::tempdir().unwrap();
    let working_dir = dir.path();
    let catalog = Catalog::open(working_dir.join("state.db")).unwrap();
    catalog
      .upsert_course(&crate::model::Course {
        id: 1,
        short_name: "cs101".into(),
        full_name: "Intro to CS".into(),
        preferred_name: None,
        user_count: None,
        is_favorite: false,
        last_access: None,
        last_modification: None,
        start: None,
        end: None,
      })
      .unwrap();

    let tf_a = temp_file(1, "a", "2024-01-01T00:00:00Z");
    let tf_b = temp_file(1, "b", "2024-01-02T00:00:00Z");
    let path_a = crate::catalog::temp_file_path(working_dir, "temp", "cs101", &tf_a.download_url);
    let path_b = crate::catalog::temp_file_path(working_dir, "temp", "cs101", &tf_b.download_url);
    std::fs::create_dir_all(path_a.parent().unwrap()).unwrap();
    std::fs::write(&path_a, b"version one").unwrap();
    std::fs::write(&path_b, b"version two, different bytes").unwrap();
    catalog.insert_temp_file(&tf_a).unwrap();
    catalog.insert_temp_file(&tf_b).unwrap();

    let mut course_dirs = HashMap::new();
    course_dirs.insert(1, "cs101".to_string());

    let produced = resolve_all(&catalog, working_dir, "courses", &course_dirs).unwrap();
    assert_eq!(produced, 2);
    let dest = working_dir.join("courses").join("cs101").join("docs");
    assert!(dest.join("slides(0/1).pdf").exists());
    assert!(dest.join("slides(1/1).pdf").exists());
  }

  /// P8: the resulting `(final_name -> content)` set for a colliding bucket
  /// depends only on `(created_at, url)` ordering, not on the order temp
  /// files happen to be inserted into the catalog.
  #[test]
  fn collision_outcome_is_deterministic_regardless_of_arrival_order_p8() {
    fn run_with_insertion_order(urls: &[&str]) -> Vec<(String, Vec<u8>)> {
      let entries: HashMap<&str, (&str, &[u8])> = HashMap::from([
        ("a", ("2024-01-01T00:00:00Z", b"content A".as_slice())),
        ("b", ("2024-01-02T00:00:00Z", b"content B, longer".as_slice())),
        ("c", ("2024-01-03T00:00:00Z", b"content C".as_slice())),
      ]);

      let dir = tempfile::tempdir().unwrap();
      let working_dir = dir.path();
      let catalog = Catalog::open(working_dir.join("state.db")).unwrap();
      catalog
        .upsert_course(&crate::model::Course {
          id: 1,
          short_name: "cs101".into(),
          full_name: "Intro to CS".into(),
          preferred_name: None,
          user_count: None,
          is_favorite: false,
          last_access: None,
          last_modification: None,
          start: None,
          end: None,
        })
        .unwrap();

      for url in urls {
        let (created_at, content) = entries[url];
        let tf = temp_file(1, url, created_at);
        let path = crate::catalog::temp_file_path(working_dir, "temp", "cs101", &tf.download_url);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        catalog.insert_temp_file(&tf).unwrap();
      }

      let mut course_dirs = HashMap::new();
      course_dirs.insert(1, "cs101".to_string());
      resolve_all(&catalog, working_dir, "courses", &course_dirs).unwrap();

      let dest = working_dir.join("courses").join("cs101").join("docs");
      let mut out: Vec<(String, Vec<u8>)> = std::fs::read_dir(&dest)
        .unwrap()
        .map(|e| {
          let entry = e.unwrap();
          let name = entry.file_name().to_string_lossy().into_owned();
          let content = std::fs::read(entry.path()).unwrap();
          (name, content)
        })
        .collect();
      out.sort();
      out
    }

    let forward = run_with_insertion_order(&["a", "b", "c"]);
    let shuffled = run_with_insertion_order(&["c", "a", "b"]);
    assert_eq!(forward, shuffled);
    assert_eq!(forward.len(), 3);
  }
}
