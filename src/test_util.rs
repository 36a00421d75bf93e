//! Shared helpers for this crate's tests.

use std::fs;
use std::path::{Path, PathBuf};

/// A uniquely-named directory under the system temp dir, removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(tag: &str) -> TempDir {
        let path = std::env::temp_dir().join(format!(
            "modelprep-{}-{}-{:x}",
            tag,
            std::process::id(),
            fastrand::u64(..)
        ));
        fs::create_dir_all(&path).expect("failed to create temp dir");
        TempDir { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
