//! Shard archive: an append-only zip container plus a commit journal.
//!
//! Every committed version is its own zip entry. The first version of a name
//! is stored under the name itself, later ones under `name;v{k}`. Each commit
//! also appends a small JSON record under [`JOURNAL_DIR`] naming the version
//! and its metadata (`comment` holds the original byte size, `modified` the
//! source stamp). Replaying the journal in order rebuilds the index, and
//! lookups always go through [`ShardArchive::latest`].
//!
//! Commits open the shard with [`ZipWriter::new_append`], so earlier payloads
//! are never rewritten. Superseded versions stay in the file.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime as ZipDateTime, ZipArchive, ZipWriter};

use crate::error::ArchiveError;
use crate::models::Stamp;

/// Prefix of the per-commit journal records.
pub const JOURNAL_DIR: &str = ".cook-index/";

/// Highest zstd level handed to the zip writer.
pub const MAX_LEVEL: u32 = 21;

// -----------------------------------------------------------------------------
// Index
// -----------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EntryVersion {
    /// Decimal byte size of the source before transformation.
    pub comment: String,
    /// Source stamp (`YYYYMMDDhhmmss`) at cook time.
    pub modified: String,
    /// Bytes actually stored; 0 for deletion markers.
    pub payload_size: u64,
    #[serde(default)]
    pub level: u32,
    /// Zip entry holding this version's payload.
    #[serde(default)]
    pub entry: String,
}

impl EntryVersion {
    pub fn original_size(&self) -> Option<u64> {
        self.comment.trim().parse().ok()
    }

    pub fn stamp(&self) -> Option<Stamp> {
        Stamp::parse(&self.modified)
    }

    pub fn is_deletion_marker(&self) -> bool {
        self.payload_size == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexedEntry {
    name: String,
    versions: Vec<EntryVersion>,
}

/// One journal record: a single committed version.
#[derive(Serialize, Deserialize, Debug)]
struct Commit {
    name: String,
    version: EntryVersion,
}

/// Metadata supplied by the caller for a new version.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub comment: String,
    pub modified: Stamp,
    pub level: u32,
}

// -----------------------------------------------------------------------------
// ShardArchive
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ShardArchive {
    path: PathBuf,
    entries: Vec<IndexedEntry>,
    lookup: HashMap<String, usize>,
    /// Entry indices in commit order.
    history: Vec<usize>,
    /// Every zip entry name already taken in the file.
    occupied: HashSet<String>,
    commits: usize,
}

impl ShardArchive {
    /// Reads an existing shard. Missing and zero-byte files yield `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, ArchiveError> {
        match fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ArchiveError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let file = File::open(path).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut zip = ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        })?;

        let mut shard = Self::empty(path);
        shard.occupied = zip.file_names().map(str::to_string).collect();

        let mut journal: Vec<String> = shard
            .occupied
            .iter()
            .filter(|n| n.starts_with(JOURNAL_DIR))
            .cloned()
            .collect();
        journal.sort();

        if journal.is_empty() {
            if !shard.occupied.is_empty() {
                warn!("{} has no journal; treating all entries as stale", path.display());
            }
            for version in foreign_entries(&mut zip, path)? {
                shard.record(version.0, version.1);
            }
        } else {
            for record in &journal {
                let commit = read_commit(&mut zip, record, path)?;
                shard.record(commit.name, commit.version);
            }
            shard.commits = journal.len();
        }

        Ok(Some(shard))
    }

    /// Writes a fresh, empty shard at `path`, replacing whatever was there.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let shard = Self::empty(path);
        let mut staged = shard.stage()?;
        ZipWriter::new(staged.as_file_mut())
            .finish()
            .map_err(|source| shard.zip_err(source))?;
        shard.persist(staged)?;
        Ok(shard)
    }

    /// Loads the shard, creating an empty one if there is none yet.
    pub fn open_or_create(path: &Path) -> Result<Self, ArchiveError> {
        match Self::load(path)? {
            Some(shard) => Ok(shard),
            None => Self::create(path),
        }
    }

    fn empty(path: &Path) -> Self {
        ShardArchive {
            path: path.to_path_buf(),
            entries: Vec::new(),
            lookup: HashMap::new(),
            history: Vec::new(),
            occupied: HashSet::new(),
            commits: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in first-commit order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Latest version of every name, in first-commit order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &EntryVersion)> {
        self.entries
            .iter()
            .filter_map(|e| e.versions.last().map(|v| (e.name.as_str(), v)))
    }

    /// Names of every committed version, oldest commit first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(|&i| self.entries[i].name.as_str())
    }

    /// The most recent version recorded for `name`.
    pub fn latest(&self, name: &str) -> Option<&EntryVersion> {
        self.versions(name).last()
    }

    pub fn versions(&self, name: &str) -> &[EntryVersion] {
        self.lookup
            .get(name)
            .map(|&i| self.entries[i].versions.as_slice())
            .unwrap_or(&[])
    }

    /// Latest payload of `name`; `None` when absent or deleted.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let version = match self.latest(name) {
            Some(version) if !version.is_deletion_marker() => version,
            _ => return Ok(None),
        };
        let file = File::open(&self.path).map_err(|source| self.io_err(source))?;
        let mut zip = ZipArchive::new(file).map_err(|source| self.zip_err(source))?;
        let mut entry = match zip.by_name(physical_name(name, version)) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(source) => return Err(self.zip_err(source)),
        };
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| self.io_err(source))?;
        Ok(Some(bytes))
    }

    /// Appends a new version of `name` whose payload is read from `payload`.
    pub fn append<R: Read>(
        &mut self,
        name: &str,
        meta: NewEntry,
        payload: &mut R,
        payload_len: u64,
    ) -> Result<u64, ArchiveError> {
        let physical = self.free_name(name, self.versions(name).len());
        let record = self.free_name(&format!("{JOURNAL_DIR}{:08}.json", self.commits), 0);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        let mut writer = ZipWriter::new_append(file).map_err(|source| self.zip_err(source))?;

        writer
            .start_file(physical.as_str(), entry_options(meta.level, meta.modified, payload_len))
            .map_err(|source| self.zip_err(source))?;
        let written = io::copy(payload, &mut writer).map_err(|source| self.io_err(source))?;

        let commit = Commit {
            name: name.to_string(),
            version: EntryVersion {
                comment: meta.comment,
                modified: meta.modified.to_string(),
                payload_size: written,
                level: meta.level,
                entry: physical.clone(),
            },
        };
        writer
            .start_file(record.as_str(), journal_options())
            .map_err(|source| self.zip_err(source))?;
        serde_json::to_writer(&mut writer, &commit).map_err(|source| ArchiveError::Index {
            path: self.path.clone(),
            source,
        })?;

        let file = writer.finish().map_err(|source| self.zip_err(source))?;
        file.sync_all().map_err(|source| self.io_err(source))?;

        self.occupied.insert(physical);
        self.occupied.insert(record);
        self.commits += 1;
        self.record(commit.name, commit.version);
        debug!("{}: committed {name} ({written} bytes)", self.path.display());
        Ok(written)
    }

    /// Records that `name` no longer exists on disk.
    pub fn append_deletion_marker(&mut self, name: &str, when: Stamp) -> Result<(), ArchiveError> {
        let meta = NewEntry {
            comment: "0".into(),
            modified: when,
            level: 0,
        };
        self.append(name, meta, &mut io::empty(), 0).map(|_| ())
    }

    fn record(&mut self, name: String, version: EntryVersion) {
        let index = match self.lookup.get(&name) {
            Some(&i) => i,
            None => {
                self.lookup.insert(name.clone(), self.entries.len());
                self.entries.push(IndexedEntry {
                    name,
                    versions: Vec::new(),
                });
                self.entries.len() - 1
            }
        };
        self.entries[index].versions.push(version);
        self.history.push(index);
    }

    /// `base` for version 0, `base;v{k}` after that, skipping names already in the file.
    fn free_name(&self, base: &str, mut k: usize) -> String {
        loop {
            let candidate = if k == 0 {
                base.to_string()
            } else {
                format!("{base};v{k}")
            };
            if !self.occupied.contains(&candidate) {
                return candidate;
            }
            k += 1;
        }
    }

    fn stage(&self) -> Result<NamedTempFile, ArchiveError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        NamedTempFile::new_in(dir).map_err(|source| self.io_err(source))
    }

    fn persist(&self, staged: NamedTempFile) -> Result<(), ArchiveError> {
        staged
            .as_file()
            .sync_all()
            .map_err(|source| self.io_err(source))?;
        staged
            .persist(&self.path)
            .map_err(|e| ArchiveError::Persist {
                path: self.path.clone(),
                source: e.error,
            })?;
        Ok(())
    }

    fn io_err(&self, source: io::Error) -> ArchiveError {
        ArchiveError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn zip_err(&self, source: ZipError) -> ArchiveError {
        ArchiveError::Zip {
            path: self.path.clone(),
            source,
        }
    }
}

fn physical_name<'a>(name: &'a str, version: &'a EntryVersion) -> &'a str {
    if version.entry.is_empty() {
        name
    } else {
        &version.entry
    }
}

fn read_commit(zip: &mut ZipArchive<File>, record: &str, path: &Path) -> Result<Commit, ArchiveError> {
    let mut txt = String::new();
    zip.by_name(record)
        .map_err(|source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        })?
        .read_to_string(&mut txt)
        .map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&txt).map_err(|source| ArchiveError::Index {
        path: path.to_path_buf(),
        source,
    })
}

/// Versions for a zip written without a journal: sizes are known, metadata is not.
fn foreign_entries(
    zip: &mut ZipArchive<File>,
    path: &Path,
) -> Result<Vec<(String, EntryVersion)>, ArchiveError> {
    let mut versions = Vec::new();
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i).map_err(|source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        })?;
        if entry.is_dir() {
            continue;
        }
        versions.push((
            entry.name().to_string(),
            EntryVersion {
                comment: String::new(),
                modified: String::new(),
                payload_size: entry.size(),
                level: 0,
                entry: entry.name().to_string(),
            },
        ));
    }
    Ok(versions)
}

fn journal_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
}

fn entry_options(level: u32, modified: Stamp, len: u64) -> SimpleFileOptions {
    let zip_time = modified
        .to_naive()
        .and_then(|dt| {
            use chrono::{Datelike, Timelike};
            ZipDateTime::from_date_and_time(
                dt.year() as u16,
                dt.month() as u8,
                dt.day() as u8,
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
            )
            .ok()
        })
        .unwrap_or_else(ZipDateTime::default_for_write);

    let options = SimpleFileOptions::default()
        .unix_permissions(0o644)
        .large_file(len > 0xffffffff)
        .last_modified_time(zip_time);

    if level == 0 {
        options.compression_method(CompressionMethod::Stored)
    } else {
        options
            .compression_method(CompressionMethod::Zstd)
            .compression_level(Some(level.clamp(1, MAX_LEVEL) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::tempdir;

    fn meta(size: u64, level: u32) -> NewEntry {
        NewEntry {
            comment: size.to_string(),
            modified: Stamp::parse("20240501101500").unwrap(),
            level,
        }
    }

    #[test]
    fn missing_and_empty_shards_load_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        assert!(ShardArchive::load(&path).unwrap().is_none());

        fs::write(&path, b"").unwrap();
        assert!(ShardArchive::load(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_shard_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(ShardArchive::load(&path).is_err());
    }

    #[test]
    fn append_then_reload_keeps_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        let mut shard = ShardArchive::open_or_create(&path).unwrap();
        assert!(shard.is_empty());

        let body = b"hello hello hello hello".to_vec();
        let written = shard
            .append("text/readme.txt", meta(23, 6), &mut Cursor::new(&body), 23)
            .unwrap();
        assert_eq!(written, 23);

        let reloaded = ShardArchive::load(&path).unwrap().unwrap();
        let latest = reloaded.latest("text/readme.txt").unwrap();
        assert_eq!(latest.original_size(), Some(23));
        assert_eq!(latest.modified, "20240501101500");
        assert_eq!(latest.level, 6);
        assert_eq!(reloaded.read("text/readme.txt").unwrap(), Some(body));
    }

    #[test]
    fn newer_versions_shadow_older_ones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[1].zip");
        let mut shard = ShardArchive::open_or_create(&path).unwrap();

        shard
            .append("a.txt", meta(3, 0), &mut Cursor::new(b"one".to_vec()), 3)
            .unwrap();
        shard
            .append("b.txt", meta(3, 0), &mut Cursor::new(b"two".to_vec()), 3)
            .unwrap();
        shard
            .append("a.txt", meta(5, 0), &mut Cursor::new(b"three".to_vec()), 5)
            .unwrap();

        let reloaded = ShardArchive::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.names().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
        assert_eq!(reloaded.versions("a.txt").len(), 2);
        assert_eq!(reloaded.latest("a.txt").unwrap().original_size(), Some(5));
        assert_eq!(reloaded.read("a.txt").unwrap(), Some(b"three".to_vec()));
        assert_eq!(reloaded.read("b.txt").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn deletion_marker_hides_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        let mut shard = ShardArchive::open_or_create(&path).unwrap();
        shard
            .append("gone.txt", meta(4, 0), &mut Cursor::new(b"data".to_vec()), 4)
            .unwrap();
        shard
            .append_deletion_marker("gone.txt", Stamp::now())
            .unwrap();

        let latest = shard.latest("gone.txt").unwrap();
        assert!(latest.is_deletion_marker());
        assert_eq!(latest.comment, "0");
        assert_eq!(shard.read("gone.txt").unwrap(), None);
    }

    #[test]
    fn foreign_zip_without_index_is_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        {
            let file = File::create(&path).unwrap();
            let mut zip = ZipWriter::new(file);
            zip.start_file("loose.bin", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"1234").unwrap();
            zip.finish().unwrap();
        }

        let shard = ShardArchive::load(&path).unwrap().unwrap();
        let latest = shard.latest("loose.bin").unwrap();
        assert_eq!(latest.payload_size, 4);
        assert_eq!(latest.original_size(), None);
        assert_eq!(latest.stamp(), None);
    }

    #[test]
    fn commits_append_without_copying_earlier_payloads() {
        const PAYLOAD: usize = 16 * 1024;
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        let mut shard = ShardArchive::open_or_create(&path).unwrap();

        for i in 0..10u8 {
            let before = fs::read(&path).unwrap();
            let body = vec![i; PAYLOAD];
            shard
                .append("asset.bin", meta(PAYLOAD as u64, 0), &mut Cursor::new(body), PAYLOAD as u64)
                .unwrap();
            let after = fs::read(&path).unwrap();

            // Only the central directory at the tail is rewritten.
            let kept = before.len().saturating_sub(PAYLOAD);
            assert_eq!(&after[..kept], &before[..kept], "commit {i} rewrote earlier bytes");
            let grown = (after.len() - before.len()) as u64;
            assert!(grown >= PAYLOAD as u64 && grown < PAYLOAD as u64 + 4096, "commit {i} grew by {grown}");
        }

        let zip = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let stored: HashSet<&str> = zip.file_names().collect();
        assert!(stored.contains("asset.bin"));
        assert!(stored.contains("asset.bin;v9"));

        let reloaded = ShardArchive::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.versions("asset.bin").len(), 10);
        assert_eq!(reloaded.history().count(), 10);
        assert_eq!(reloaded.read("asset.bin").unwrap(), Some(vec![9u8; PAYLOAD]));
    }

    #[cfg(unix)]
    #[test]
    fn commits_keep_the_same_file() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        let mut shard = ShardArchive::open_or_create(&path).unwrap();
        let inode = fs::metadata(&path).unwrap().ino();
        shard
            .append("a.txt", meta(3, 0), &mut Cursor::new(b"one".to_vec()), 3)
            .unwrap();
        shard.append_deletion_marker("a.txt", Stamp::now()).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
    }

    #[test]
    fn foreign_zip_gains_a_journal_on_first_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cook[0].zip");
        {
            let mut zip = ZipWriter::new(File::create(&path).unwrap());
            zip.start_file("loose.bin", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"1234").unwrap();
            zip.finish().unwrap();
        }

        let mut shard = ShardArchive::load(&path).unwrap().unwrap();
        shard
            .append("loose.bin", meta(5, 0), &mut Cursor::new(b"fresh".to_vec()), 5)
            .unwrap();
        assert_eq!(shard.latest("loose.bin").unwrap().entry, "loose.bin;v1");

        let reloaded = ShardArchive::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.versions("loose.bin").len(), 1);
        assert_eq!(reloaded.read("loose.bin").unwrap(), Some(b"fresh".to_vec()));
    }
}
