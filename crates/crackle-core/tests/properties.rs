//! Property tests for decomposition and the round completion latch.
//!
//! Key invariants:
//! - decomposed ranges tile `[0, num_tasks)` in rank order
//! - range sizes follow the capacity ratio when the space divides evenly
//! - the last non-empty range ends exactly at `num_tasks`
//! - the latch wakes its waiter once, after every completion, in any order

use crackle_core::{decompose, CompletionLatch};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

proptest! {
    #[test]
    fn ranges_tile_the_space(
        num_tasks in 1u64..1_000_000,
        caps in prop::collection::vec(1u64..10_000, 1..8),
        multiplier in 0u32..64,
    ) {
        let d = decompose(num_tasks, &caps, multiplier).unwrap();
        prop_assert_eq!(d.ranges.len(), caps.len());
        let mut cursor = 0;
        for r in &d.ranges {
            prop_assert!(r.start <= r.end);
            if !r.is_empty() {
                prop_assert_eq!(r.start, cursor);
                cursor = r.end;
            }
        }
        prop_assert_eq!(cursor, num_tasks);
    }

    #[test]
    fn sizes_follow_capacity_ratio(k in 1u64..50, rounds in 1u64..1000) {
        let n = (k + 1) * rounds;
        let d = decompose(n, &[k, 1], 1).unwrap();
        prop_assert_eq!(d.ranges[0].len(), k * rounds);
        prop_assert_eq!(d.ranges[1].len(), rounds);
    }

    #[test]
    fn last_range_is_clamped(
        num_tasks in 1u64..10_000,
        caps in prop::collection::vec(0u64..5_000, 1..6),
    ) {
        prop_assume!(caps.iter().any(|&c| c > 0));
        let d = decompose(num_tasks, &caps, 1).unwrap();
        let last = d.ranges.iter().rev().find(|r| !r.is_empty()).unwrap();
        prop_assert_eq!(last.end, num_tasks);
        for r in d.ranges.iter().filter(|r| r.is_empty()) {
            prop_assert!(r.start == r.end && r.end <= num_tasks);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn latch_signals_once_after_all_completions(
        order in Just((0u64..6).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let latch = CompletionLatch::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for &delay in &order {
            latch.register();
            let l = latch.clone();
            let f = fired.clone();
            handles.push(thread::spawn(move || {
                thread::sleep(Duration::from_micros(100 * delay));
                f.fetch_add(1, Ordering::SeqCst);
                l.count_down();
            }));
        }
        latch.wait();
        prop_assert_eq!(fired.load(Ordering::SeqCst), order.len());
        for h in handles {
            h.join().unwrap();
        }
        prop_assert_eq!(latch.signal_count(), 1);
        prop_assert_eq!(latch.pending(), 0);
    }
}
