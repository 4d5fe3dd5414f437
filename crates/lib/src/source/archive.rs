//! Remote archive sources (`http(s)://…/pkg.tar.gz`).
//!
//! The cache downloads the archive once into the destination directory and
//! serves every later call from disk. An optional SHA-256 pin is verified
//! both for fresh downloads and for files found on disk from an earlier
//! build. Released tarballs conventionally nest their content under a
//! single `pkg-1.0/` directory; that directory is reported as the cache's
//! prefix so patches land inside it.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::hash;
use crate::source::{Cache, Source, SourceError, SourceOptions, SourceType};

/// Source backed by a downloadable tar archive.
pub struct Archive {
    url: String,
    sha256: Option<String>,
}

impl Archive {
    pub fn new(url: &str, options: &SourceOptions) -> Self {
        Self {
            url: url.to_string(),
            sha256: options.sha256.clone(),
        }
    }
}

impl Source for Archive {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn build_cache(&self, tmpdir: &Path) -> Box<dyn Cache> {
        let file = tmpdir.join(basename(&self.url));
        Box::new(ArchiveCache {
            url: self.url.clone(),
            sha256: self.sha256.clone(),
            file,
            key: None,
            checked: false,
        })
    }
}

/// Last path segment of the URL, query string stripped.
fn basename(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("source.tar")
        .to_string()
}

struct ArchiveCache {
    url: String,
    sha256: Option<String>,
    file: PathBuf,
    key: Option<String>,
    checked: bool,
}

impl ArchiveCache {
    fn update(&mut self) -> Result<(), SourceError> {
        if self.checked {
            return Ok(());
        }
        if !self.file.is_file() {
            self.download()?;
        } else {
            debug!(file = %self.file.display(), "archive already downloaded");
        }
        if let Some(expected) = &self.sha256 {
            let actual = hash::hash_reader(File::open(&self.file)?)?;
            if &actual != expected {
                // Drop the stale file so a retried build starts clean.
                fs::remove_file(&self.file)?;
                return Err(SourceError::ChecksumMismatch {
                    url: self.url.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        self.checked = true;
        Ok(())
    }

    fn download(&self) -> Result<(), SourceError> {
        info!(url = %self.url, "downloading");
        let response = reqwest::blocking::get(&self.url)
            .and_then(|response| response.error_for_status())
            .map_err(|source| SourceError::Download {
                url: self.url.clone(),
                source,
            })?;
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut partial = self.file.as_os_str().to_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let mut reader = response;
        let mut out = File::create(&partial)?;
        std::io::copy(&mut reader, &mut out)?;
        fs::rename(&partial, &self.file)?;
        Ok(())
    }

    /// Open the downloaded file with the decoder its extension calls for.
    fn decoded(&self) -> Result<Box<dyn Read + Send>, SourceError> {
        let name = basename(&self.url);
        let file = BufReader::new(File::open(&self.file)?);
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Box::new(GzDecoder::new(file)))
        } else if name.ends_with(".tar") {
            Ok(Box::new(file))
        } else {
            Err(SourceError::UnsupportedArchive(name))
        }
    }
}

impl Cache for ArchiveCache {
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
        self.update()?;
        self.decoded()
    }

    fn cachekey(&mut self) -> Result<String, SourceError> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        self.update()?;
        let key = hash::hash_reader(File::open(&self.file)?)?;
        self.key = Some(key.clone());
        Ok(key)
    }

    fn prefix(&mut self) -> Result<Option<String>, SourceError> {
        self.update()?;
        let mut archive = tar::Archive::new(self.decoded()?);
        let mut shared: Option<String> = None;
        for entry in archive.entries()? {
            let entry = entry?;
            let kind = entry.header().entry_type();
            if !kind.is_file() && !kind.is_dir() {
                continue;
            }
            let path = entry.path()?;
            let name = path.to_string_lossy();
            let name = name.strip_prefix("./").unwrap_or(&name);
            if name.is_empty() {
                continue;
            }
            let Some((first, _)) = name.split_once('/') else {
                // A top-level file means nothing is nested.
                if kind.is_file() {
                    return Ok(None);
                }
                continue;
            };
            match &shared {
                None => shared = Some(first.to_string()),
                Some(seen) if seen == first => {}
                Some(_) => return Ok(None),
            }
        }
        Ok(shared)
    }
}

pub struct ArchiveType;

impl SourceType for ArchiveType {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn score(&self, url: &str) -> Option<usize> {
        if url.starts_with("https:") {
            Some(6)
        } else if url.starts_with("http:") {
            Some(5)
        } else {
            None
        }
    }

    fn build(&self, url: &str, options: &SourceOptions) -> Result<Box<dyn Source>, SourceError> {
        Ok(Box::new(Archive::new(url, options)))
    }
}
