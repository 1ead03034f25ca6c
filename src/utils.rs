//! Content hashing, short-hash display, and atomic file writes.
//!
//! Node and proof identities across the crate are lowercase hex SHA-256
//! digests of canonical JSON. Users refer to nodes by shortened forms
//! (`f62a31..a75c09` or a plain prefix), so the comparison helpers here
//! accept either a full digest or a short form on both sides.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// SHA-256 of `data`, as 64 lowercase hex characters.
pub fn hash_str(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Is `s` a full digest (64 hex chars)?
pub fn is_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Shorten a digest to `left..right` for display.
pub fn shorten_hash(h: &str) -> String {
    if h.len() <= 12 {
        return h.to_string();
    }
    format!("{}..{}", &h[..6], &h[h.len() - 6..])
}

/// Split a short hash into its prefix and suffix parts.
///
/// Accepts a full digest (prefix = suffix = the digest), a `pre..suf` pair,
/// or a bare hex prefix.
pub fn deconstruct_short_hash(h: &str) -> Option<(String, String)> {
    let lower = h.to_ascii_lowercase();
    if is_hash(&lower) {
        return Some((lower.clone(), lower));
    }
    if let Some((pre, suf)) = lower.split_once("..") {
        if pre.chars().all(|c| c.is_ascii_hexdigit()) && suf.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Some((pre.to_string(), suf.to_string()));
        }
        return None;
    }
    if !lower.is_empty() && lower.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some((lower, String::new()));
    }
    None
}

/// Do two (possibly shortened) hashes refer to the same digest?
pub fn compare_short_hashes(lhs: &str, rhs: &str) -> bool {
    let (Some((l0, l1)), Some((r0, r1))) = (deconstruct_short_hash(lhs), deconstruct_short_hash(rhs))
    else {
        return false;
    };
    (l0.starts_with(&r0) || r0.starts_with(&l0)) && (l1.ends_with(&r1) || r1.ends_with(&l1))
}

/// The exactly-one-element extractor used by the structural graph rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleError {
    /// The iterator was empty.
    Empty,
    /// The iterator had two or more elements.
    Multiple,
}

impl std::fmt::Display for SingleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SingleError::Empty => write!(f, "expected a single element, found none"),
            SingleError::Multiple => write!(f, "expected a single element, found more"),
        }
    }
}

impl std::error::Error for SingleError {}

/// Return the only element of `iter`, or which way it failed.
pub fn single<T>(iter: impl IntoIterator<Item = T>) -> Result<T, SingleError> {
    let mut it = iter.into_iter();
    let first = it.next().ok_or(SingleError::Empty)?;
    match it.next() {
        None => Ok(first),
        Some(_) => Err(SingleError::Multiple),
    }
}

/// Write `contents` to `path` atomically: write a sibling temp file, then
/// rename over the destination. Readers never observe a torn file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => {
            let mut tmp_name = name.to_os_string();
            tmp_name.push(".tmp");
            dir.join(tmp_name)
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a writable file path: {}", path.display()),
            ))
        }
    };
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
