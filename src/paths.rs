//! Raw/compiled root translation.
//!
//! The server never stores absolute paths in the record store or over the wire; everything
//! is a [`crate::id::ResourcePath`] relative to `data://`. These roots are where that virtual
//! path is anchored on disk for a given purpose.

use std::path::{Path, PathBuf};

use crate::id::ResourcePath;

/// The two on-disk roots a [`ResourcePath`] can be resolved against.
#[derive(Debug, Clone)]
pub struct PathRoots {
    raw_root: PathBuf,
    compiled_root: PathBuf,
}

impl PathRoots {
    pub fn new(raw_root: impl Into<PathBuf>, compiled_root: impl Into<PathBuf>) -> Self {
        Self { raw_root: dunce::simplified(&raw_root.into()).to_path_buf(), compiled_root: dunce::simplified(&compiled_root.into()).to_path_buf() }
    }

    pub fn raw_root(&self) -> &Path {
        &self.raw_root
    }

    pub fn compiled_root(&self) -> &Path {
        &self.compiled_root
    }

    /// The absolute path of the raw (source) file a resource is compiled from.
    pub fn to_raw(&self, path: &ResourcePath) -> PathBuf {
        path.to_absolute(&self.raw_root)
    }

    /// The absolute path of the compiled artifact a resource produces.
    pub fn to_compiled(&self, path: &ResourcePath) -> PathBuf {
        path.to_absolute(&self.compiled_root)
    }

    /// Reverses [`Self::to_raw`]: maps an absolute raw-root path back to a virtual path, used
    /// by the file-system watcher when translating OS change notifications.
    pub fn from_raw(&self, absolute: &Path) -> Option<ResourcePath> {
        Self::relativize(absolute, &self.raw_root)
    }

    fn relativize(absolute: &Path, root: &Path) -> Option<ResourcePath> {
        let relative = absolute.strip_prefix(root).ok()?;
        let slash = path_slash::PathExt::to_slash(relative)?;
        Some(ResourcePath::from_relative(&slash))
    }
}
