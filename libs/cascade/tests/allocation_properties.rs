//! Allocation Property Tests
//!
//! For any segment and any set of weights with at least one active entry,
//! the split covers the segment exactly and never gives work to an
//! inactive System.

use cascade::allocate;
use proptest::prelude::*;

fn weights_strategy() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(prop_oneof![4 => 0.01f64..100.0, 1 => Just(0.0)], 1..12)
        .prop_filter("at least one active weight", |w| w.iter().any(|&x| x > 0.0))
}

proptest! {
    #[test]
    fn allocation_covers_segment(size in 0usize..10_000, weights in weights_strategy()) {
        let shares = allocate(size, &weights);
        prop_assert_eq!(shares.len(), weights.len());
        prop_assert_eq!(shares.iter().sum::<usize>(), size);
    }

    #[test]
    fn inactive_weights_get_nothing(size in 0usize..10_000, weights in weights_strategy()) {
        let shares = allocate(size, &weights);
        for (share, weight) in shares.iter().zip(&weights) {
            if *weight <= 0.0 {
                prop_assert_eq!(*share, 0);
            }
        }
    }

    #[test]
    fn every_active_system_works_when_pieces_suffice(
        weights in weights_strategy(),
        extra in 0usize..1_000,
    ) {
        let active = weights.iter().filter(|&&w| w > 0.0).count();
        let shares = allocate(active + extra, &weights);
        for (share, weight) in shares.iter().zip(&weights) {
            if *weight > 0.0 {
                prop_assert!(*share >= 1);
            }
        }
    }

    #[test]
    fn equal_weights_split_evenly(size in 0usize..10_000, count in 1usize..16) {
        let shares = allocate(size, &vec![1.0; count]);
        let max = *shares.iter().max().unwrap();
        let min = *shares.iter().min().unwrap();
        prop_assert!(max - min <= 1);
    }
}
