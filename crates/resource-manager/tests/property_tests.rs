//! Property tests for pool invariants

use std::sync::Arc;

use proptest::prelude::*;
use resource_manager::events::NoopObserver;
use resource_manager::{Consumer, IdPool, IntervalSet, IpAddressPool, Range, Subnet};

fn ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..200, 0u64..200), 0..12)
}

proptest! {
    #[test]
    fn interval_set_stays_disjoint(input in ranges(), removals in ranges()) {
        let mut set: IntervalSet<u64> =
            input.iter().map(|&(a, b)| Range::new(a, b)).collect();
        for &(a, b) in &removals {
            set.remove_range(&Range::new(a, b));
        }

        let ranges = set.to_vec();
        for pair in ranges.windows(2) {
            // sorted, disjoint and never adjacent
            prop_assert!(pair[0].end() + 1 < pair[1].start());
        }
    }

    #[test]
    fn id_allocate_release_round_trip(excludes in ranges(), picks in prop::collection::vec(0u64..200, 1..20)) {
        let mut pool = IdPool::new("p", Range::new(0, 199), Arc::new(NoopObserver));
        for &(a, b) in &excludes {
            pool.add_exclude(Range::new(a, b));
        }
        let before = pool.available().clone();
        let consumer = Consumer::default();

        let mut held = Vec::new();
        for v in picks {
            if pool.allocate_specific(v, &consumer, "k").is_ok() {
                held.push(v);
            }
        }
        prop_assert!(pool.check_invariants().is_ok());

        for v in held {
            prop_assert!(pool.release(v).is_ok());
        }
        prop_assert_eq!(pool.available(), &before);
    }

    #[test]
    fn release_of_unheld_value_changes_nothing(v in 0u64..50) {
        let mut pool = IdPool::new("p", Range::new(0, 49), Arc::new(NoopObserver));
        let before = pool.available().clone();
        prop_assert!(pool.release(v).is_err());
        prop_assert_eq!(pool.available(), &before);
    }

    #[test]
    fn subnet_allocate_release_round_trip(prefixes in prop::collection::vec(24u8..=32, 1..16)) {
        let mut pool = IpAddressPool::new("p", Arc::new(NoopObserver));
        pool.add_subnet("10.0.0.0/22".parse::<Subnet>().unwrap()).unwrap();
        let before: Vec<Subnet> = pool.available().copied().collect();
        let consumer = Consumer::default();

        let mut held = Vec::new();
        for p in prefixes {
            if let Ok(s) = pool.allocate(p, 128, &consumer, "k") {
                held.push(s);
            }
        }
        prop_assert!(pool.check_invariants().is_ok());
        for pair in held.iter().enumerate() {
            for other in &held[pair.0 + 1..] {
                prop_assert!(!pair.1.overlaps(other));
            }
        }

        for s in held.iter().rev() {
            prop_assert!(pool.release(s).is_ok());
        }
        let after: Vec<Subnet> = pool.available().copied().collect();
        prop_assert_eq!(after, before);
    }
}
