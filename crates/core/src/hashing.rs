//! SHA-256 hex digests.
//!
//! Used to fingerprint engine status responses so the completion detector
//! can tell "nothing changed" from "progress happened" in O(1) space.

use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}
