use std::io::{Read, Write};

use crate::error::TransformError;

/// Everything a transform sees for one stale file.
pub struct TransformJob<'a> {
    /// Project-relative path, forward slashes.
    pub path: &'a str,
    /// Extension with its leading dot (`".png"`), or empty.
    pub extension: &'a str,
    /// Up to the first 16 bytes of the input, for magic-number checks.
    pub header: &'a [u8],
    pub input: &'a mut dyn Read,
    pub output: &'a mut dyn Write,
    /// Human-readable progress line, e.g. `Cooking 042% art/hero.png`.
    pub info: &'a str,
    pub worker_id: usize,
}

/// What to do with a successfully handled file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Store the output bytes at this compression level (0 = stored).
    Commit { level: u32 },
    /// Leave the file out of the archive.
    Bypass,
}

/// Pluggable per-file asset processing.
pub trait Transform: Send + Sync {
    fn transform(&self, job: &mut TransformJob<'_>) -> Result<Disposition, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&mut TransformJob<'_>) -> Result<Disposition, TransformError> + Send + Sync,
{
    fn transform(&self, job: &mut TransformJob<'_>) -> Result<Disposition, TransformError> {
        self(job)
    }
}
