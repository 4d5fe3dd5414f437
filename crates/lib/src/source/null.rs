//! The null source: no content at all.
//!
//! Recipes without a source declaration fall back to this. Its cache streams
//! a structurally valid empty archive and a constant content key.

use std::io::{Cursor, Read};
use std::path::Path;

use crate::hash;
use crate::source::{Cache, Source, SourceError};
use crate::tarstream;

pub struct Null;

impl Source for Null {
    fn name(&self) -> &'static str {
        "null"
    }

    fn build_cache(&self, _tmpdir: &Path) -> Box<dyn Cache> {
        Box::new(NullCache)
    }
}

struct NullCache;

impl Cache for NullCache {
    fn tar_io(&mut self) -> Result<Box<dyn Read + Send>, SourceError> {
        Ok(Box::new(Cursor::new(tarstream::EMPTY_ARCHIVE.to_vec())))
    }

    fn cachekey(&mut self) -> Result<String, SourceError> {
        Ok(hash::hash_bytes(&[]))
    }
}
