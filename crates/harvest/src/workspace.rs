//! Per-job temporary storage.
//!
//! One directory per job holds the zero-padded, index-named segment files and
//! the concatenation list. The directory is removed when the workspace is
//! closed, and by `Drop` on every other exit path.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use url::Url;

use crate::HarvestError;

const CONCAT_LIST_NAME: &str = "concat.txt";
const DEFAULT_SEGMENT_EXTENSION: &str = "ts";

#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    pub fn create(root: Option<&Path>) -> Result<Self, HarvestError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("harvest-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created job workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Index-derived segment path. The extension mirrors the segment URL so the
    /// classifier can compare it with the file's real content.
    pub fn segment_path(&self, index: usize, url: &Url) -> PathBuf {
        self.dir
            .path()
            .join(format!("segment_{index:06}.{}", segment_extension(url)))
    }

    pub fn concat_list_path(&self) -> PathBuf {
        self.dir.path().join(CONCAT_LIST_NAME)
    }

    /// Removes the directory and everything in it.
    pub fn close(self) -> Result<(), HarvestError> {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => {
                debug!(path = %path.display(), "Removed job workspace");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove job workspace");
                Err(e.into())
            }
        }
    }
}

/// Lower-cased extension of the URL path, `ts` when absent or implausible.
pub fn segment_extension(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_SEGMENT_EXTENSION.to_string(),
    }
}
