//! Tar stream plumbing shared by the source pipeline.
//!
//! Two structural rules hold everywhere:
//!
//! - entry names are relative and rooted as `./…`;
//! - a tar archive ends with exactly one 1024-byte zero terminator, so when
//!   several archives are concatenated into one logical stream, every
//!   constituent but the last must omit its terminator.
//!
//! [`instruction_archive`] produces such a marker-less head archive and
//! [`JoinedReader`] performs the concatenation.

use std::io::{self, Read};
use std::path::Path;

/// End-of-archive marker: two 512-byte zero blocks.
const TERMINATOR: [u8; 1024] = [0u8; 1024];

/// A structurally valid archive with no entries.
pub(crate) const EMPTY_ARCHIVE: [u8; 1024] = [0u8; 1024];

/// A generated file destined for an instruction archive.
pub struct ArchiveFile<'a> {
    pub name: &'a str,
    pub mode: u32,
    pub content: &'a [u8],
}

/// Build an in-memory archive of generated files *without* the
/// end-of-archive marker, so it can be joined ahead of another archive. The
/// final constituent of the joined stream supplies the single terminator.
pub fn instruction_archive(files: &[ArchiveFile<'_>]) -> io::Result<Vec<u8>> {
    let mut bytes = file_archive(files)?;
    bytes.truncate(bytes.len() - TERMINATOR.len());
    Ok(bytes)
}

/// Build a complete, self-terminated in-memory archive of generated files.
pub fn file_archive(files: &[ArchiveFile<'_>]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(file.content.len() as u64);
        header.set_mode(file.mode);
        header.set_cksum();
        builder.append_data(&mut header, format!("./{}", file.name), file.content)?;
    }
    builder.into_inner()
}

/// Unpack a tar stream into `dst`, preserving file modes.
pub fn unpack<R: Read>(reader: R, dst: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dst)
}

/// Collect `(name, content)` pairs for the regular files in a tar stream.
pub fn entries<R: Read>(reader: R) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        out.push((name, content));
    }
    Ok(out)
}

/// Reads a sequence of byte streams as one continuous stream.
///
/// Each read is served from the current constituent until it is exhausted,
/// then the reader advances to the next. Dropping the reader closes every
/// constituent, consumed or not.
pub struct JoinedReader {
    streams: Vec<Box<dyn Read + Send>>,
    index: usize,
}

impl JoinedReader {
    pub fn new(streams: Vec<Box<dyn Read + Send>>) -> Self {
        Self { streams, index: 0 }
    }
}

impl Read for JoinedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.index < self.streams.len() {
            let n = self.streams[self.index].read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.index += 1;
        }
        Ok(0)
    }
}
