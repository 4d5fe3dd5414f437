//! Content hashing for cache keys.
//!
//! Every cache key in the pipeline is a lowercase hex SHA-256 digest, either
//! over a byte slice or streamed over an archive in small chunks.

use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Chunk size for streaming digests.
const CHUNK: usize = 1024;

/// Stream `reader` through SHA-256 and return the hex digest.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a byte slice in one shot.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
