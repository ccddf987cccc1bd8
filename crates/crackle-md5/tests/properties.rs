//! Property tests for keyspace enumeration and the search kernel.
//!
//! Key invariants:
//! - stepping a candidate forward matches direct construction of the next index
//! - a planted index inside the searched window is always found
//! - the hand-rolled digest agrees with the reference implementation

use crackle_md5::{digest_words, md5_single_block, search, Charset, Keyspace};
use md5::{Digest, Md5};
use proptest::prelude::*;

fn charset() -> impl Strategy<Value = Charset> {
    prop::sample::select(Charset::ALL.to_vec())
}

proptest! {
    #[test]
    fn advance_agrees_with_fill(cs in charset(), nchars in 1u8..=6, start in 0u64..1_000_000, steps in 1usize..64) {
        let ks = Keyspace::new(cs, b"", nchars);
        let total = ks.len().unwrap();
        let start = start % total;
        let mut out = ks.candidate(start);
        let mut digits = ks.digits(start);
        for i in 1..=steps as u64 {
            let wrapped = !ks.advance(&mut digits, &mut out);
            if start + i >= total {
                prop_assert!(wrapped);
                break;
            }
            prop_assert_eq!(&out, &ks.candidate(start + i));
        }
    }

    #[test]
    fn planted_index_is_found(cs in charset(), index in 0u64..50_000, before in 0u64..200, after in 1u64..200) {
        let ks = Keyspace::new(cs, b"k", 5);
        let index = index % ks.len().unwrap();
        let secret = ks.candidate(index);
        let target = digest_words(&md5_single_block(&secret).unwrap());
        let offset = index.saturating_sub(before);
        let size = index - offset + after;
        prop_assert_eq!(search(&ks, offset, size, &target), Some(secret));
    }

    #[test]
    fn digest_matches_reference(msg in prop::collection::vec(any::<u8>(), 0..=55)) {
        let ours = md5_single_block(&msg).unwrap();
        prop_assert_eq!(&ours[..], &Md5::digest(&msg)[..]);
    }
}
