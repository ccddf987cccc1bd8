use crate::{GlobalData, Keyspace};
use crackle_device_cpu::{CpuKernel, KernelContext, KernelError, KernelRegistry};
use crackle_utils::MD5_DIGEST_LEN;
use std::sync::Arc;

pub const KERNEL_NAME: &str = "md5_search";

/// Define carrying the candidate length into the program build.
pub const LEN_DEFINE: &str = "CRACKLE_MD5_LEN";

/// Manifest compiled by the host runtime when no kernel file is given.
pub const KERNEL_SOURCE: &str = "# MD5 preimage search over a charset keyspace\nkernel md5_search\n";

/// Longest message that still fits one MD5 block with its padding.
pub const MAX_SINGLE_BLOCK: usize = 55;

/// Searches task indices `[offset, offset + size)` of the keyspace described
/// by the global data record passed as launch arguments. Outputs the matching
/// candidate NUL padded to 16 bytes, or nothing.
#[derive(Debug, Default)]
pub struct Md5SearchKernel;

pub fn register_kernels(registry: &KernelRegistry) {
    registry.register(KERNEL_NAME, Arc::new(Md5SearchKernel));
}

impl CpuKernel for Md5SearchKernel {
    fn run(&self, ctx: &KernelContext<'_>) -> Result<Vec<u8>, KernelError> {
        let fail = |msg: String| KernelError::new(KERNEL_NAME, msg);
        let global = GlobalData::decode(ctx.args).map_err(|e| fail(e.to_string()))?;
        if let Some(len) = ctx.defines.get_u64(LEN_DEFINE) {
            if len != u64::from(global.nchars) {
                return Err(fail(format!(
                    "built for {len} characters, launched for {}",
                    global.nchars
                )));
            }
        }
        let keyspace = Keyspace::new(global.charset, &global.prefix, global.nchars);
        if keyspace.is_empty() || ctx.size == 0 {
            return Ok(Vec::new());
        }
        let target = digest_words(&global.digest);
        Ok(search(&keyspace, ctx.offset, ctx.size, &target)
            .map(|candidate| {
                let mut out = vec![0u8; MD5_DIGEST_LEN];
                out[..candidate.len()].copy_from_slice(&candidate);
                out
            })
            .unwrap_or_default())
    }
}

/// Walks `size` candidates starting at `offset` and returns the first whose
/// MD5 equals `target`.
pub fn search(keyspace: &Keyspace, offset: u64, size: u64, target: &[u32; 4]) -> Option<Vec<u8>> {
    let len = keyspace.candidate_len();
    if len > MAX_SINGLE_BLOCK {
        return None;
    }
    let mut block = [0u8; 64];
    keyspace.fill(offset, &mut block[..len]);
    block[len] = 0x80;
    block[56..64].copy_from_slice(&((len as u64) * 8).to_le_bytes());
    let mut digits = keyspace.digits(offset);

    for i in 0..size {
        let mut state = MD5_IV;
        md5_compress(&mut state, &block);
        if state == *target {
            return Some(block[..len].to_vec());
        }
        if i + 1 < size && !keyspace.advance(&mut digits, &mut block[..len]) {
            break;
        }
    }
    None
}

/// MD5 of a message short enough for a single block.
pub fn md5_single_block(msg: &[u8]) -> Option<[u8; MD5_DIGEST_LEN]> {
    if msg.len() > MAX_SINGLE_BLOCK {
        return None;
    }
    let mut block = [0u8; 64];
    block[..msg.len()].copy_from_slice(msg);
    block[msg.len()] = 0x80;
    block[56..64].copy_from_slice(&((msg.len() as u64) * 8).to_le_bytes());
    let mut state = MD5_IV;
    md5_compress(&mut state, &block);
    let mut out = [0u8; MD5_DIGEST_LEN];
    for (i, w) in state.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    Some(out)
}

/// Digest bytes as the four little-endian state words the compressor leaves.
pub fn digest_words(digest: &[u8; MD5_DIGEST_LEN]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (w, chunk) in words.iter_mut().zip(digest.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/* ==== Internal MD5 primitives (single-block compress) ==== */

const MD5_IV: [u32; 4] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

const S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, //
    5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9, 14, 20, //
    4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, //
    6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

const K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

fn md5_compress(state: &mut [u32; 4], block: &[u8; 64]) {
    let mut m = [0u32; 16];
    for (i, chunk) in block.chunks_exact(4).enumerate() {
        m[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    let mut a = state[0];
    let mut b = state[1];
    let mut c = state[2];
    let mut d = state[3];

    for i in 0..64 {
        let (f, g) = match i / 16 {
            0 => ((b & c) | (!b & d), i),
            1 => ((d & b) | (!d & c), (5 * i + 1) % 16),
            2 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | !d), (7 * i) % 16),
        };
        let f = f
            .wrapping_add(a)
            .wrapping_add(K[i])
            .wrapping_add(m[g]);
        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(f.rotate_left(S[i]));
    }

    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Charset;
    use crackle_device_cpu::Defines;
    use md5::{Digest, Md5};

    fn ctx<'a>(offset: u64, size: u64, args: &'a [u8], defines: &'a Defines) -> KernelContext<'a> {
        KernelContext { offset, size, args, defines, lane: 0 }
    }

    fn global(secret: &[u8], prefix: &[u8], charset: Charset) -> Vec<u8> {
        GlobalData {
            prefix: prefix.to_vec(),
            digest: crackle_utils::md5_digest(secret),
            charset,
            nchars: secret.len() as u8,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn single_block_matches_reference() {
        let msg: Vec<u8> = (0..=MAX_SINGLE_BLOCK as u8).map(|b| b.wrapping_mul(37)).collect();
        for len in 0..=MAX_SINGLE_BLOCK {
            let ours = md5_single_block(&msg[..len]).unwrap();
            let reference = Md5::digest(&msg[..len]);
            assert_eq!(&ours[..], &reference[..], "length {len}");
        }
        assert!(md5_single_block(&[0u8; 56]).is_none());
    }

    #[test]
    fn kernel_finds_the_planted_candidate() {
        let args = global(b"ab7x", b"", Charset::Alnum);
        let ks = Keyspace::new(Charset::Alnum, b"", 4);
        // a=0 b=1 '7'=59 x=23 in base 62.
        let index = ((62 + 59) * 62) + 23;
        assert_eq!(ks.candidate(index), b"ab7x");
        let defines = Defines::default();

        let hit = Md5SearchKernel.run(&ctx(index - 10, 64, &args, &defines)).unwrap();
        assert_eq!(&hit[..4], b"ab7x");
        assert!(hit[4..].iter().all(|&b| b == 0));

        let miss = Md5SearchKernel.run(&ctx(index + 1, 64, &args, &defines)).unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn kernel_respects_the_prefix() {
        let args = global(b"key42", b"key", Charset::Digit);
        let defines = Defines::default();
        let hit = Md5SearchKernel.run(&ctx(0, 100, &args, &defines)).unwrap();
        assert_eq!(&hit[..5], b"key42");
    }

    #[test]
    fn kernel_rejects_a_mismatched_build() {
        let args = global(b"abc", b"", Charset::Alpha);
        let mut defines = Defines::default();
        defines.insert(LEN_DEFINE, "5");
        assert!(Md5SearchKernel.run(&ctx(0, 10, &args, &defines)).is_err());
        assert!(Md5SearchKernel.run(&ctx(0, 10, &args[..20], &Defines::default())).is_err());
    }
}
