//! Shared fixtures for the benches.

use crackle_md5::{digest_words, Charset, Keyspace};
use crackle_utils::md5_digest;

/// An 8-character alnum keyspace and the digest words of a string that is
/// not in it, so a search always walks its whole window.
pub fn unreachable_target() -> (Keyspace, [u32; 4]) {
    let keyspace = Keyspace::new(Charset::Alnum, b"", 8);
    (keyspace, digest_words(&md5_digest(b"!not-in-alnum")))
}
