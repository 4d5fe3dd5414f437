//! Local directory sources.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::hash;
use crate::source::{self, Cache, Source, SourceError, SourceOptions, SourceType};

/// Source backed by a directory on the local filesystem.
pub struct Dir {
    dir: PathBuf,
}

impl Dir {
    /// Create a directory source.
    ///
    /// A `file:` scheme is stripped; a relative location is resolved against
    /// the current working directory once, here, not when the cache is used.
    pub fn new(url: &str) -> Result<Self, SourceError> {
        let path = url
            .strip_prefix("file://")
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);
        let path = Path::new(path);
        let dir = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()?.join(path)
        };
        Ok(Self { dir })
    }

    /// The normalized absolute location.
    pub fn location(&self) -> &Path {
        &self.dir
    }
}

impl Source for Dir {
    fn name(&self) -> &'static str {
        "dir"
    }

    /// Directory sources have no per-destination staging; the destination
    /// argument is unused.
    fn build_cache(&self, _tmpdir: &Path) -> Box<dyn Cache> {
        Box::new(DirCache {
            dir: self.dir.clone(),
        })
    }
}

struct DirCache {
    dir: PathBuf,
}

impl Cache for DirCache {
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
        source::tar_dir(&self.dir)
    }

    fn cachekey(&mut self) -> Result<String, SourceError> {
        let io = self.tar_io()?;
        Ok(hash::hash_reader(io)?)
    }

    /// Fast path: top-level children are copied directly, no archive
    /// round-trip.
    fn copy_to(&mut self, dst: &Path) -> Result<(), SourceError> {
        source::copy_children(&self.dir, dst)
    }
}

pub struct DirType;

impl SourceType for DirType {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn score(&self, url: &str) -> Option<usize> {
        if url.starts_with("file:") {
            Some(5)
        } else if url.starts_with('/') || url.starts_with("./") || url.starts_with("../") {
            Some(1)
        } else {
            None
        }
    }

    fn build(&self, url: &str, _options: &SourceOptions) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(Dir::new(url)?))
    }
}
