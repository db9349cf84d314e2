//! Content fingerprinting for the compilation cache.
//!
//! The fingerprint must be stable across runs and independent of file
//! insertion order, and two different input sets must never share one.
//! Every field is length-prefixed before hashing so concatenation
//! boundaries are unambiguous (`("ab", "c")` never collides with
//! `("a", "bc")`).

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::input::FileContent;

/// SHA-256 hex over the engine, entry, and sorted `(path, content)` set.
#[must_use]
pub fn fingerprint(engine: &str, entry: &str, files: &BTreeMap<String, FileContent>) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, engine.as_bytes());
    feed(&mut hasher, entry.as_bytes());
    for (path, content) in files {
        feed(&mut hasher, path.as_bytes());
        feed(&mut hasher, content.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
