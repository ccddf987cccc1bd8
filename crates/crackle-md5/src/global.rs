use crate::keyspace::MAX_NCHARS;
use crate::Charset;
use anyhow::{bail, Result};
use crackle_utils::MD5_DIGEST_LEN;

pub const PREFIX_CAPACITY: usize = 16;
pub const GLOBAL_DATA_LEN: usize = 40;

/// Search parameters broadcast from the coordinator to every worker.
///
/// Layout (little-endian):
/// prefix[16, NUL padded] | digest[16] | charset id u32 | nchars u8 | pad[3]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalData {
    pub prefix: Vec<u8>,
    pub digest: [u8; MD5_DIGEST_LEN],
    pub charset: Charset,
    pub nchars: u8,
}

impl GlobalData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.prefix.len() >= PREFIX_CAPACITY || self.prefix.contains(&0) {
            bail!("prefix must be under {PREFIX_CAPACITY} bytes without NUL");
        }
        let mut out = vec![0u8; GLOBAL_DATA_LEN];
        out[..self.prefix.len()].copy_from_slice(&self.prefix);
        out[16..32].copy_from_slice(&self.digest);
        out[32..36].copy_from_slice(&self.charset.id().to_le_bytes());
        out[36] = self.nchars;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < GLOBAL_DATA_LEN {
            bail!("global data is {} bytes, expected {GLOBAL_DATA_LEN}", buf.len());
        }
        let prefix_len = buf[..PREFIX_CAPACITY].iter().position(|&b| b == 0).unwrap_or(PREFIX_CAPACITY);
        let mut digest = [0u8; MD5_DIGEST_LEN];
        digest.copy_from_slice(&buf[16..32]);
        let id = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);
        let Some(charset) = Charset::from_id(id) else {
            bail!("unknown charset id {id}");
        };
        let nchars = buf[36];
        if nchars == 0 || nchars > MAX_NCHARS {
            bail!("string length {nchars} outside 1..={MAX_NCHARS}");
        }
        Ok(Self { prefix: buf[..prefix_len].to_vec(), digest, charset, nchars })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GlobalData {
        GlobalData {
            prefix: b"ab".to_vec(),
            digest: [0x5a; 16],
            charset: Charset::Special,
            nchars: 6,
        }
    }

    #[test]
    fn layout_is_fixed() {
        let buf = sample().encode().unwrap();
        assert_eq!(buf.len(), GLOBAL_DATA_LEN);
        assert_eq!(&buf[..3], b"ab\0");
        assert_eq!(buf[16], 0x5a);
        assert_eq!(&buf[32..36], &3u32.to_le_bytes());
        assert_eq!(buf[36], 6);
        assert_eq!(&buf[37..], &[0, 0, 0]);
        assert_eq!(GlobalData::decode(&buf).unwrap(), sample());
    }

    #[test]
    fn decode_rejects_bad_records() {
        let buf = sample().encode().unwrap();
        assert!(GlobalData::decode(&buf[..39]).is_err());

        let mut bad_charset = buf.clone();
        bad_charset[32] = 7;
        assert!(GlobalData::decode(&bad_charset).is_err());

        let mut bad_len = buf;
        bad_len[36] = 9;
        assert!(GlobalData::decode(&bad_len).is_err());
    }

    #[test]
    fn encode_rejects_long_prefix() {
        let mut g = sample();
        g.prefix = vec![b'a'; PREFIX_CAPACITY];
        assert!(g.encode().is_err());
    }
}
