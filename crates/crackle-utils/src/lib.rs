use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::path::Path;

pub const MD5_DIGEST_LEN: usize = 16;

pub fn md5_digest(data: &[u8]) -> [u8; MD5_DIGEST_LEN] {
    let mut out = [0u8; MD5_DIGEST_LEN];
    out.copy_from_slice(&Md5::digest(data));
    out
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parses a 32-digit hex MD5 sum, either case.
pub fn hex_to_digest(text: &str) -> Result<[u8; MD5_DIGEST_LEN]> {
    let text = text.trim();
    if text.len() != 2 * MD5_DIGEST_LEN {
        bail!("md5 sum must be {} hex digits, got {}", 2 * MD5_DIGEST_LEN, text.len());
    }
    let mut out = [0u8; MD5_DIGEST_LEN];
    hex::decode_to_slice(text, &mut out).with_context(|| format!("invalid md5 sum `{text}`"))?;
    Ok(out)
}

pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vectors() {
        assert_eq!(bytes_to_hex(&md5_digest(b"")), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(bytes_to_hex(&md5_digest(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn hex_digest_parses_either_case() {
        let lower = hex_to_digest("900150983cd24fb0d6963f7d28e17f72").unwrap();
        let upper = hex_to_digest("900150983CD24FB0D6963F7D28E17F72\n").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, md5_digest(b"abc"));
    }

    #[test]
    fn hex_digest_rejects_bad_input() {
        assert!(hex_to_digest("abc").is_err());
        assert!(hex_to_digest("zz0150983cd24fb0d6963f7d28e17f72").is_err());
    }

    #[test]
    fn read_file_names_the_path() {
        let err = read_file("/nonexistent/crackle.kernel").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/crackle.kernel"));
    }
}
