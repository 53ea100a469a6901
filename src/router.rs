use std::path::{Path, PathBuf};
use std::thread;

use sha2::{Digest, Sha256};

/// Upper bound on shards; sizes the progress table.
pub const MAX_WORKERS: usize = 16;

/// Stable 64-bit hash of a path string. Identical across runs and hosts.
pub fn path_hash(path: &str) -> u64 {
    let digest = Sha256::digest(path.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

pub fn worker_id_for(path: &str, worker_count: usize) -> usize {
    let count = worker_count.clamp(1, MAX_WORKERS) as u64;
    (path_hash(path) % count) as usize
}

/// Splits `files` into `worker_count` disjoint lists, keeping input order inside each.
pub fn partition(files: &[String], worker_count: usize) -> Vec<Vec<String>> {
    let count = worker_count.clamp(1, MAX_WORKERS);
    (0..count)
        .map(|worker_id| {
            files
                .iter()
                .filter(|path| worker_id_for(path, count) == worker_id)
                .cloned()
                .collect()
        })
        .collect()
}

pub fn shard_file_name(worker_id: usize) -> String {
    format!(".cook[{worker_id}].zip")
}

/// Resolves a requested worker count (0 = one per logical core).
pub fn resolve_worker_count(requested: usize) -> usize {
    let wanted = if requested == 0 {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    };
    wanted.clamp(1, MAX_WORKERS)
}

/// Existing shard archives under `root`, in the order they should be mounted.
pub fn mount_order(root: &Path) -> Vec<PathBuf> {
    (0..MAX_WORKERS)
        .map(|id| root.join(shard_file_name(id)))
        .filter(|path| path.is_file())
        .collect()
}
