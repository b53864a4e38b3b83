//! Streaming SHA-256 of files and strings.

use crate::error::{BundleResult, IoContext};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read size used while hashing. Overlays can be large, so files are never
/// loaded whole.
const CHUNK_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> BundleResult<String> {
    let f = File::open(path).io_context(|| format!("Failed to open {}", path.display()))?;
    sha256_reader(f).io_context(|| format!("Failed to read {}", path.display()))
}

/// Lowercase hex SHA-256 of everything `reader` yields.
pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_str(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

/// Whether `s` is a digest as written by this module: 64 lowercase hex
/// characters.
pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
