//! Incremental content hashing for the upload tee.
//!
//! Every byte of the inbound stream is fed to md5, sha1, sha256 and
//! sha512 in parallel; `finish()` yields the lower-case hex digests the
//! finalization record carries.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;

/// Parallel digest state over a single byte stream.
pub struct MultiHash {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
}

impl MultiHash {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
        }
    }

    /// Feed one chunk to all digests. Hashing in-memory state cannot fail.
    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha1.update(chunk);
        self.sha256.update(chunk);
        self.sha512.update(chunk);
    }

    /// Consume the state and return the hex digest map.
    pub fn finish(self) -> HashMap<String, String> {
        let mut hashes = HashMap::with_capacity(4);
        hashes.insert("md5".to_string(), hex::encode(self.md5.finalize()));
        hashes.insert("sha1".to_string(), hex::encode(self.sha1.finalize()));
        hashes.insert("sha256".to_string(), hex::encode(self.sha256.finalize()));
        hashes.insert("sha512".to_string(), hex::encode(self.sha512.finalize()));
        hashes
    }
}

impl Default for MultiHash {
    fn default() -> Self {
        Self::new()
    }
}
