//! Version-control sources backed by the `git` command line.
//!
//! The cache keeps a bare repository under the destination directory and
//! fetches the requested revision into `FETCH_HEAD` once per build. The
//! archive stream comes straight out of `git archive`, and the content key
//! is the fetched commit id.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::exec;
use crate::source::{Cache, Source, SourceError, SourceOptions, SourceType};

/// Source backed by a git repository.
pub struct Git {
    url: String,
    rev: String,
}

impl Git {
    pub fn new(url: &str, options: &SourceOptions) -> Self {
        let url = url.strip_prefix("git+").unwrap_or(url).to_string();
        let rev = options.rev.clone().unwrap_or_else(|| "HEAD".to_string());
        Self { url, rev }
    }
}

impl Source for Git {
    fn name(&self) -> &'static str {
        "git"
    }

    fn build_cache(&self, tmpdir: &Path) -> Box<dyn Cache> {
        let repodir = tmpdir.join(format!("{}.git", sanitize(&self.url)));
        Box::new(GitCache {
            url: self.url.clone(),
            rev: self.rev.clone(),
            repodir,
            fetched: false,
        })
    }
}

/// Filesystem-safe name for the mirror directory of a URL.
fn sanitize(url: &str) -> String {
    url.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

struct GitCache {
    url: String,
    rev: String,
    repodir: PathBuf,
    fetched: bool,
}

impl GitCache {
    fn update(&mut self) -> Result<(), SourceError> {
        if self.fetched {
            return Ok(());
        }
        if !self.repodir.is_dir() {
            if let Some(parent) = self.repodir.parent() {
                fs::create_dir_all(parent)?;
            }
            exec::run(
                "git",
                [
                    OsStr::new("init"),
                    OsStr::new("--bare"),
                    OsStr::new("--quiet"),
                    self.repodir.as_os_str(),
                ],
                None,
            )?;
        }
        debug!(url = %self.url, rev = %self.rev, "fetching");
        exec::run(
            "git",
            [
                OsStr::new("--git-dir"),
                self.repodir.as_os_str(),
                OsStr::new("fetch"),
                OsStr::new("--quiet"),
                OsStr::new(self.url.as_str()),
                OsStr::new(self.rev.as_str()),
            ],
            None,
        )?;
        self.fetched = true;
        Ok(())
    }
}

impl Cache for GitCache {
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
        self.update()?;
        let stream = exec::popen(
            "git",
            [
                OsStr::new("--git-dir"),
                self.repodir.as_os_str(),
                OsStr::new("archive"),
                OsStr::new("--format=tar"),
                OsStr::new("--prefix=./"),
                OsStr::new("FETCH_HEAD"),
            ],
            None,
        )?;
        Ok(Box::new(stream))
    }

    fn cachekey(&mut self) -> Result<String, SourceError> {
        self.update()?;
        let out = exec::run(
            "git",
            [
                OsStr::new("--git-dir"),
                self.repodir.as_os_str(),
                OsStr::new("rev-parse"),
                OsStr::new("FETCH_HEAD"),
            ],
            None,
        )?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

pub struct GitType;

impl SourceType for GitType {
    fn name(&self) -> &'static str {
        "git"
    }

    fn score(&self, url: &str) -> Option<usize> {
        if url.ends_with(".git") {
            Some(url.len())
        } else if url.starts_with("git:") || url.starts_with("git+") {
            Some(4)
        } else {
            None
        }
    }

    fn build(&self, url: &str, options: &SourceOptions) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(Git::new(url, options)))
    }
}
