use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::router;

pub const CONFIG_FILE: &str = ".cook.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CookerConfig {
    /// Shard count; 0 picks one per logical core.
    pub workers: usize,
    /// Level for compressible assets. 0 stores everything raw.
    pub compression_level: u32,
    pub tools_dir: PathBuf,
    pub soundbank: PathBuf,
    /// Run tools through `wine` (appending `.exe`) on non-Windows hosts.
    pub wine_fallback: bool,
    /// Append every external command to `.cook[N].bat`.
    pub record_commands: bool,
    /// Print coloured tool output to the console.
    pub echo_tools: bool,
    pub ready_poll_ms: u64,
}

impl Default for CookerConfig {
    fn default() -> Self {
        CookerConfig {
            workers: 0,
            compression_level: 6,
            tools_dir: PathBuf::from("3rd/3rd_tools"),
            soundbank: PathBuf::from("3rd/3rd_tools/AweROMGM.sf2"),
            wine_fallback: false,
            record_commands: false,
            echo_tools: true,
            ready_poll_ms: 100,
        }
    }
}

impl CookerConfig {
    /// Reads `.cook.json` from `root`; a missing file gives the defaults.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        let txt = match fs::read_to_string(&path) {
            Ok(txt) => txt,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no {} in {}, using defaults", CONFIG_FILE, root.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        serde_json::from_str(&txt).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn worker_count(&self) -> usize {
        router::resolve_worker_count(self.workers)
    }

    pub fn resolve(&self, root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        }
    }
}
