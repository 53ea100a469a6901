//! Incremental asset cooker.
//!
//! Source files under a project root are converted by a [`Transform`] and
//! committed into per-worker zip shards (`.cook[N].zip`). Later runs only
//! revisit files whose size or modification time moved.

pub mod archive;
pub mod config;
pub mod cooker;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod models;
pub mod progress;
pub mod router;
pub mod tools;
pub mod transform;
pub mod worker;

pub use archive::{EntryVersion, ShardArchive};
pub use config::CookerConfig;
pub use cooker::{CookHandle, CookOptions, Cooker, Cooking, ReadySignal};
pub use error::{ArchiveError, CookError, TransformError};
pub use models::{ShardReport, Stamp};
pub use progress::ProgressTracker;
pub use transform::{Disposition, Transform, TransformJob};
