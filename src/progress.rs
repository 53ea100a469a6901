use std::sync::atomic::{AtomicI32, Ordering};

use crate::router::MAX_WORKERS;

/// Per-worker completion cells in `[0, 100]`.
///
/// Each cell has a single writer, its worker. Readers may see cells from
/// different moments.
#[derive(Debug)]
pub struct ProgressTracker {
    cells: [AtomicI32; MAX_WORKERS],
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        ProgressTracker {
            cells: std::array::from_fn(|_| AtomicI32::new(0)),
        }
    }

    pub fn set(&self, worker_id: usize, value: i32) {
        if let Some(cell) = self.cells.get(worker_id) {
            cell.store(value.clamp(0, 100), Ordering::Relaxed);
        }
    }

    pub fn get(&self, worker_id: usize) -> i32 {
        self.cells
            .get(worker_id)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        for cell in &self.cells {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Mean of the active cells (value > 0), or 0 when nothing is running.
    pub fn aggregate(&self) -> i32 {
        let (sum, count) = self
            .cells
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .filter(|value| *value > 0)
            .fold((0, 0), |(sum, count), value| (sum + value, count + 1));
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    pub fn snapshot(&self, workers: usize) -> Vec<i32> {
        (0..workers.min(MAX_WORKERS)).map(|id| self.get(id)).collect()
    }
}

/// Percentage reported before cooking item `index` of `total`; the last item is always 100.
pub fn item_progress(index: usize, total: usize) -> i32 {
    if total == 0 || index + 1 >= total {
        return 100;
    }
    ((index * 200 + total) / (2 * total)) as i32
}
