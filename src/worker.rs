//! One shard's cooking pass: scan, diff, then commit deletions and stale files
//! one by one into the shard archive.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::archive::{NewEntry, ShardArchive};
use crate::detect;
use crate::error::{CookError, TransformError};
use crate::models::{FileRecord, ShardReport, Stamp, WorkerAssignment};
use crate::progress::{item_progress, ProgressTracker};
use crate::transform::{Disposition, TransformJob};

const HEADER_LEN: u64 = 16;

enum FileOutcome {
    Committed,
    Bypassed,
    Failed(TransformError),
}

/// Runs one worker pass against its own shard under `root`.
pub fn run(
    assignment: &WorkerAssignment,
    root: &Path,
    progress: &ProgressTracker,
) -> Result<ShardReport, CookError> {
    let id = assignment.worker_id;
    progress.set(id, 0);

    let records = detect::scan(root, &assignment.files, |path| assignment.owns(path));
    let shard_path = root.join(&assignment.shard);
    discard_empty_shard(&shard_path);

    let existing = match ShardArchive::load(&shard_path) {
        Ok(shard) => shard,
        Err(err) => {
            warn!("{}: unreadable shard, rebuilding: {err}", shard_path.display());
            None
        }
    };
    let diff = detect::diff(existing.as_ref(), &records);
    debug!(
        "worker {id}: {} scanned, +{} ~{} -{}",
        records.len(),
        diff.added.len(),
        diff.changed.len(),
        diff.deleted.len()
    );

    let mut shard = match existing {
        Some(shard) => shard,
        None => open_fresh(&shard_path)?,
    };

    let mut report = ShardReport {
        worker_id: id,
        added: diff.added.len(),
        changed: diff.changed.len(),
        ..ShardReport::default()
    };

    for (i, name) in diff.deleted.iter().enumerate() {
        info!("Deleting {:03}% {name}", item_progress(i, diff.deleted.len()));
        shard
            .append_deletion_marker(name, Stamp::now())
            .map_err(|source| CookError::Commit {
                path: shard_path.clone(),
                name: name.clone(),
                source,
            })?;
        report.deleted += 1;
    }

    if !diff.uncooked.is_empty() {
        let mut scratch = tempfile::tempfile().map_err(CookError::Scratch)?;
        let by_path: HashMap<&str, &FileRecord> =
            records.iter().map(|r| (r.path.as_str(), r)).collect();
        let total = diff.uncooked.len();

        for (i, path) in diff.uncooked.iter().enumerate() {
            let pct = item_progress(i, total);
            progress.set(id, pct);
            let modified = by_path
                .get(path.as_str())
                .map(|r| r.modified)
                .unwrap_or_default();

            match cook_file(assignment, root, &mut shard, &mut scratch, path, modified, pct)? {
                FileOutcome::Committed => report.cooked += 1,
                FileOutcome::Bypassed => report.bypassed += 1,
                FileOutcome::Failed(err) => {
                    error!("importing failed: {path}: {err}");
                    report.failed += 1;
                }
            }
        }
    }

    progress.set(id, 100);
    info!(
        "{}: {} cooked, {} bypassed, {} failed, {} deleted",
        assignment.shard, report.cooked, report.bypassed, report.failed, report.deleted
    );
    Ok(report)
}

fn discard_empty_shard(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() == 0 {
            if let Err(err) = fs::remove_file(path) {
                warn!("cannot remove empty shard {}: {err}", path.display());
            }
        }
    }
}

/// Creates an empty shard, deleting the old file and retrying once on failure.
fn open_fresh(path: &Path) -> Result<ShardArchive, CookError> {
    match ShardArchive::create(path) {
        Ok(shard) => Ok(shard),
        Err(first) => {
            warn!("{}: {first}; retrying", path.display());
            let _ = fs::remove_file(path);
            ShardArchive::create(path).map_err(|source| CookError::ShardOpen {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Pushes one file through the transform and commits its output.
///
/// Only archive failures escape as errors; everything else is per-file.
fn cook_file(
    assignment: &WorkerAssignment,
    root: &Path,
    shard: &mut ShardArchive,
    scratch: &mut File,
    path: &str,
    modified: Stamp,
    pct: i32,
) -> Result<FileOutcome, CookError> {
    let open_failed = |source| {
        FileOutcome::Failed(TransformError::Open {
            path: path.to_string(),
            source,
        })
    };

    let mut input = match File::open(root.join(path)) {
        Ok(f) => f,
        Err(err) => return Ok(open_failed(err)),
    };
    let input_len = match input.metadata() {
        Ok(m) => m.len(),
        Err(err) => return Ok(open_failed(err)),
    };
    let header = match read_header(&mut input) {
        Ok(header) => header,
        Err(err) => return Ok(open_failed(err)),
    };

    if let Err(err) = reset(scratch) {
        return Ok(FileOutcome::Failed(TransformError::Copy {
            path: path.to_string(),
            source: err,
        }));
    }

    let extension = extension_of(path);
    let info = format!("Cooking {pct:03}% {path}");
    let result = {
        let mut job = TransformJob {
            path,
            extension: &extension,
            header: &header,
            input: &mut input,
            output: &mut *scratch,
            info: &info,
            worker_id: assignment.worker_id,
        };
        assignment.transform.transform(&mut job)
    };

    let level = match result {
        Ok(Disposition::Commit { level }) => level,
        Ok(Disposition::Bypass) => {
            debug!("bypassed {path}");
            return Ok(FileOutcome::Bypassed);
        }
        Err(err) => return Ok(FileOutcome::Failed(err)),
    };

    let payload_len = match scratch
        .flush()
        .and_then(|_| scratch.stream_position())
        .and_then(|len| scratch.seek(SeekFrom::Start(0)).map(|_| len))
    {
        Ok(len) => len,
        Err(err) => {
            return Ok(FileOutcome::Failed(TransformError::Copy {
                path: path.to_string(),
                source: err,
            }))
        }
    };

    let meta = NewEntry {
        comment: input_len.to_string(),
        modified,
        level,
    };
    shard
        .append(path, meta, &mut Read::by_ref(&mut *scratch).take(payload_len), payload_len)
        .map_err(|source| CookError::Commit {
            path: shard.path().to_path_buf(),
            name: path.to_string(),
            source,
        })?;
    Ok(FileOutcome::Committed)
}

fn read_header(input: &mut File) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    Read::by_ref(&mut *input).take(HEADER_LEN).read_to_end(&mut header)?;
    input.seek(SeekFrom::Start(0))?;
    Ok(header)
}

fn reset(scratch: &mut File) -> std::io::Result<()> {
    scratch.set_len(0)?;
    scratch.seek(SeekFrom::Start(0))?;
    Ok(())
}

/// `".png"` for `art/hero.png`; empty when the file name has no extension.
pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}
