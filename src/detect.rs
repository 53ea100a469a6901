use std::collections::HashSet;
use std::fs;
use std::path::Path;

use glob::Pattern;
use tracing::{debug, trace};
use walkdir::{DirEntry, WalkDir};

use crate::archive::ShardArchive;
use crate::error::CookError;
use crate::models::{DiffResult, FileRecord, Stamp};

// -----------------------------------------------------------------------------
// Path helpers
// -----------------------------------------------------------------------------

/// Forward slashes, relative to `root` when the path lives under it.
pub fn normalize(path: &str, root: &Path) -> String {
    let mut rel = path.replace('\\', "/");
    let base = root.to_string_lossy().replace('\\', "/");
    let base = base.trim_end_matches('/');
    if !base.is_empty() {
        if let Some(rest) = rel.strip_prefix(base) {
            if rest.is_empty() || rest.starts_with('/') {
                rel = rest.to_string();
            }
        }
    }
    let mut rel = rel.as_str();
    loop {
        if let Some(rest) = rel.strip_prefix("./") {
            rel = rest;
        } else if let Some(rest) = rel.strip_prefix('/') {
            rel = rest;
        } else {
            break;
        }
    }
    rel.to_string()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Dotfiles are internal: shards, the index, scratch files, config.
pub fn is_internal(path: &str) -> bool {
    file_name(path).starts_with('.')
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_string_lossy().starts_with('.')
}

// -----------------------------------------------------------------------------
// Listing
// -----------------------------------------------------------------------------

/// Compiles `;`-separated glob masks. `**` matches everything.
pub fn compile_masks(masks: &str) -> Result<Vec<Pattern>, CookError> {
    let mut patterns = Vec::new();
    for mask in masks.split(';').map(str::trim).filter(|m| !m.is_empty()) {
        let pattern = Pattern::new(mask).map_err(|source| CookError::Mask {
            mask: mask.to_string(),
            source,
        })?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

/// Every regular file under `root` matching `masks`, as normalized relative paths.
pub fn list_files(root: &Path, masks: &str) -> Result<Vec<String>, CookError> {
    let patterns = compile_masks(masks)?;
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                debug!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if patterns.iter().any(|p| p.matches(&rel)) {
            files.push(rel);
        }
    }
    Ok(files)
}

// -----------------------------------------------------------------------------
// Scan
// -----------------------------------------------------------------------------

/// Stats the candidate files a worker owns.
///
/// Directories, dotfiles and files that vanished since listing are skipped.
pub fn scan<F>(root: &Path, files: &[String], owns: F) -> Vec<FileRecord>
where
    F: Fn(&str) -> bool,
{
    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for raw in files {
        if raw.starts_with('.') && !raw.starts_with("./") {
            continue;
        }
        let path = normalize(raw, root);
        if path.is_empty() || is_internal(&path) || !owns(&path) {
            continue;
        }
        let meta = match fs::metadata(root.join(&path)) {
            Ok(m) => m,
            Err(err) => {
                trace!("{path}: {err}");
                continue;
            }
        };
        if meta.is_dir() || !seen.insert(path.clone()) {
            continue;
        }
        let modified = meta
            .modified()
            .map(Stamp::from_system_time)
            .unwrap_or_default();

        records.push(FileRecord {
            path,
            size: meta.len(),
            modified,
            status: ' ',
        });
    }
    records
}

// -----------------------------------------------------------------------------
// Diff
// -----------------------------------------------------------------------------

/// Classifies scanned files against what the shard already holds.
pub fn diff(existing: Option<&ShardArchive>, now: &[FileRecord]) -> DiffResult {
    let mut result = DiffResult::default();

    let Some(archive) = existing else {
        for record in now {
            result.added.push(record.path.clone());
            result.uncooked.push(record.path.clone());
        }
        return result;
    };

    for record in now {
        match archive.latest(&record.path) {
            None => {
                result.added.push(record.path.clone());
                result.uncooked.push(record.path.clone());
            }
            Some(version) => {
                let size_changed = version.original_size() != Some(record.size);
                let stamp_drifted = match version.stamp() {
                    Some(stamp) => stamp.drifted_from(record.modified),
                    None => true,
                };
                if size_changed || stamp_drifted {
                    debug!(
                        "{}: {} vs {}, {} vs {}",
                        record.path, version.comment, record.size, version.modified, record.modified
                    );
                    result.changed.push(record.path.clone());
                    result.uncooked.push(record.path.clone());
                }
            }
        }
    }

    let present: HashSet<&str> = now.iter().map(|r| r.path.as_str()).collect();
    for name in archive.names() {
        let already_deleted = archive
            .latest(name)
            .map(|v| v.is_deletion_marker())
            .unwrap_or(true);
        if already_deleted || present.contains(name) {
            continue;
        }
        result.deleted.push(name.to_string());
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::NewEntry;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn record(path: &str, size: u64, stamp: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            modified: Stamp::parse(stamp).unwrap(),
            status: ' ',
        }
    }

    fn cooked(shard: &mut ShardArchive, name: &str, size: u64, stamp: &str) {
        let payload = vec![7u8; size as usize + 1];
        shard
            .append(
                name,
                NewEntry {
                    comment: size.to_string(),
                    modified: Stamp::parse(stamp).unwrap(),
                    level: 0,
                },
                &mut Cursor::new(&payload),
                payload.len() as u64,
            )
            .unwrap();
    }

    #[test]
    fn normalize_rebases_and_flips_separators() {
        let root = Path::new("/work/game");
        assert_eq!(normalize("/work/game/art/a.png", root), "art/a.png");
        assert_eq!(normalize("art\\b.png", root), "art/b.png");
        assert_eq!(normalize("./art/c.png", root), "art/c.png");
        assert_eq!(normalize("/work/gamedata/x.png", root), "work/gamedata/x.png");
    }

    #[test]
    fn no_archive_means_everything_added() {
        let now = vec![
            record("a.png", 10, "20240101000000"),
            record("b.txt", 4, "20240101000000"),
        ];
        let diff = diff(None, &now);
        assert_eq!(diff.added, vec!["a.png", "b.txt"]);
        assert_eq!(diff.uncooked, diff.added);
        assert!(diff.changed.is_empty());
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn classifies_added_changed_deleted_and_unchanged() {
        let dir = tempdir().unwrap();
        let mut shard = ShardArchive::open_or_create(&dir.path().join(".cook[0].zip")).unwrap();
        cooked(&mut shard, "same.txt", 5, "20240101120000");
        cooked(&mut shard, "grown.txt", 5, "20240101120000");
        cooked(&mut shard, "touched.txt", 5, "20240101120000");
        cooked(&mut shard, "removed.txt", 5, "20240101120000");

        let now = vec![
            record("same.txt", 5, "20240101120001"),
            record("grown.txt", 6, "20240101120000"),
            record("touched.txt", 5, "20240101120002"),
            record("fresh.txt", 1, "20240101120000"),
        ];
        let diff = diff(Some(&shard), &now);
        assert_eq!(diff.added, vec!["fresh.txt"]);
        assert_eq!(diff.changed, vec!["grown.txt", "touched.txt"]);
        assert_eq!(diff.uncooked, vec!["grown.txt", "touched.txt", "fresh.txt"]);
        assert_eq!(diff.deleted, vec!["removed.txt"]);
    }

    #[test]
    fn deletion_markers_are_not_deleted_again() {
        let dir = tempdir().unwrap();
        let mut shard = ShardArchive::open_or_create(&dir.path().join(".cook[0].zip")).unwrap();
        cooked(&mut shard, "old.txt", 5, "20240101120000");
        shard.append_deletion_marker("old.txt", Stamp::now()).unwrap();

        let diff = diff(Some(&shard), &[]);
        assert!(diff.is_clean());
    }

    #[test]
    fn list_and_scan_skip_internal_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("art/ui")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("art/ui/button.png"), b"png!").unwrap();
        fs::write(root.join("notes.txt"), b"hi").unwrap();
        fs::write(root.join(".cook[0].zip"), b"").unwrap();
        fs::write(root.join(".git/config"), b"x").unwrap();

        let listed = list_files(root, "**").unwrap();
        assert_eq!(listed, vec![".cook[0].zip", "art/ui/button.png", "notes.txt"]);

        let records = scan(root, &listed, |_| true);
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["art/ui/button.png", "notes.txt"]);
        assert_eq!(records[0].size, 4);
        assert!(records[0].modified.to_naive().is_some());
    }

    #[test]
    fn masks_filter_by_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.png"), b"1").unwrap();
        fs::write(dir.path().join("b.txt"), b"2").unwrap();
        let listed = list_files(dir.path(), "*.png; *.ogg").unwrap();
        assert_eq!(listed, vec!["a.png"]);
        assert!(compile_masks("[").is_err());
    }
}
