//! Entry point of the subsystem: lists sources, shards them across workers and
//! either cooks inline or hands back a handle to the running pool.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::CookerConfig;
use crate::detect;
use crate::dispatch::AssetPipeline;
use crate::error::CookError;
use crate::models::{ShardReport, WorkerAssignment};
use crate::progress::ProgressTracker;
use crate::router;
use crate::transform::Transform;
use crate::worker;

/// Raised by the host once it is ready to observe progress.
pub type ReadySignal = Arc<AtomicBool>;

#[derive(Debug, Clone, Default)]
pub struct CookOptions {
    /// Spawn one thread per shard and return immediately.
    pub asynchronous: bool,
    /// Async workers idle until this flips to `true`. `None` starts them at once.
    pub ready: Option<ReadySignal>,
}

impl CookOptions {
    pub fn sync() -> Self {
        Self::default()
    }

    pub fn background(ready: Option<ReadySignal>) -> Self {
        CookOptions {
            asynchronous: true,
            ready,
        }
    }
}

/// Outcome of [`Cooker::cook`].
#[derive(Debug)]
pub enum Cooking {
    Finished(ShardReport),
    Launched(CookHandle),
}

type WorkerThread = (usize, JoinHandle<Result<ShardReport, CookError>>);

/// Running asynchronous cook. Dropping it detaches the workers.
#[derive(Debug)]
pub struct CookHandle {
    workers: Vec<WorkerThread>,
}

impl CookHandle {
    pub fn shard_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|(_, h)| h.is_finished())
    }

    /// Joins every worker. The first fatal error wins, but all workers are joined.
    pub fn wait(self) -> Result<Vec<ShardReport>, CookError> {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for (id, handle) in self.workers {
            let outcome = handle
                .join()
                .unwrap_or(Err(CookError::WorkerPanicked(id)));
            match outcome {
                Ok(report) => reports.push(report),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}

pub struct Cooker {
    root: PathBuf,
    config: CookerConfig,
    progress: Arc<ProgressTracker>,
}

impl Cooker {
    /// Cooks the current working directory.
    pub fn new(config: CookerConfig) -> Result<Self, CookError> {
        let root = env::current_dir().map_err(CookError::Root)?;
        Ok(Self::with_root(root, config))
    }

    pub fn with_root(root: impl Into<PathBuf>, config: CookerConfig) -> Self {
        Cooker {
            root: root.into(),
            config,
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CookerConfig {
        &self.config
    }

    /// Overall completion, 0..=100. Zero before any worker reported.
    pub fn progress(&self) -> i32 {
        self.progress.aggregate()
    }

    pub fn progress_tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count()
    }

    /// The bundled tool-driven pipeline, configured from this cooker.
    pub fn default_transform(&self) -> Arc<dyn Transform> {
        Arc::new(AssetPipeline::new(&self.root, &self.config))
    }

    /// Cooks every file matching `masks` (`;`-separated globs).
    pub fn cook(
        &self,
        masks: &str,
        transform: Arc<dyn Transform>,
        options: CookOptions,
    ) -> Result<Cooking, CookError> {
        self.progress.reset();
        let files = detect::list_files(&self.root, masks)?;
        debug!("{} candidate files under {}", files.len(), self.root.display());

        if !options.asynchronous {
            let assignment =
                WorkerAssignment::new(Arc::new(files), transform, 0, self.worker_count());
            let report = worker::run(&assignment, &self.root, &self.progress)?;
            return Ok(Cooking::Finished(report));
        }

        let count = self.worker_count();
        let shards = router::partition(&files, count);
        let poll = Duration::from_millis(self.config.ready_poll_ms.max(1));
        info!("cooking {} files across {count} shards", files.len());

        let mut workers = Vec::with_capacity(count);
        for (id, shard_files) in shards.into_iter().enumerate() {
            let assignment =
                WorkerAssignment::new(Arc::new(shard_files), Arc::clone(&transform), id, count);
            let root = self.root.clone();
            let progress = Arc::clone(&self.progress);
            let ready = options.ready.clone();

            let handle = thread::Builder::new()
                .name(format!("cook-{id}"))
                .spawn(move || {
                    if let Some(ready) = ready {
                        while !ready.load(Ordering::Acquire) {
                            thread::sleep(poll);
                        }
                    }
                    let outcome = worker::run(&assignment, &root, &progress);
                    if let Err(err) = &outcome {
                        progress.set(id, 100);
                        error!("worker {id} aborted: {err}");
                    }
                    outcome
                })
                .map_err(|source| CookError::Spawn {
                    worker_id: id,
                    source,
                })?;
            workers.push((id, handle));
        }

        Ok(Cooking::Launched(CookHandle { workers }))
    }
}
