//! On-disk artifact handles and filesystem queries.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Which stage produced an artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    Exported,
    Simplified,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Exported => write!(f, "exported"),
            Provenance::Simplified => write!(f, "simplified"),
        }
    }
}

/// Structural validity of an artifact. Unknown until a validator has seen it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Validity {
    #[default]
    Unknown,
    Valid,
}

/// Handle to a serialized graph file. Artifacts are never mutated in place;
/// each producing stage writes a new path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub provenance: Provenance,
    pub validity: Validity,
}

impl ModelArtifact {
    pub fn new(path: PathBuf, size: u64, provenance: Provenance) -> ModelArtifact {
        ModelArtifact {
            path,
            size,
            provenance,
            validity: Validity::Unknown,
        }
    }

    /// Copy of this handle with validity recorded as checked.
    pub fn validated(mut self) -> ModelArtifact {
        self.validity = Validity::Valid;
        self
    }

    /// File name portion of the artifact path.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Filesystem boundary for the pipeline's output directory: existence and
/// size queries only, no interpretation of file contents.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> ArtifactStore {
        ArtifactStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a file inside the store.
    pub fn path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Size of a file in bytes, or `None` if it does not exist or cannot be
    /// inspected.
    pub fn size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|m| m.len())
    }
}

/// Write `bytes` so that `path` either receives the complete content or is
/// left untouched: the data goes to a temporary sibling first and is renamed
/// into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp_path = match path.parent() {
        Some(parent) => parent.join(&tmp_name),
        None => PathBuf::from(&tmp_name),
    };

    fs::write(&tmp_path, bytes)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        // Leave no stray temporary behind on failure.
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
