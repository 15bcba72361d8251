//! Randomized checks of the split-size arithmetic and the layout reconciler.

use ferrocoll::layout::{flatten, split_counts};
use ferrocoll::{Buffer, ElementType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Random split of `rows` into `parts` non-negative pieces.
fn random_splits(rng: &mut StdRng, rows: usize, parts: usize) -> Vec<usize> {
    let mut cuts: Vec<usize> = (0..parts - 1).map(|_| rng.gen_range(0..=rows)).collect();
    cuts.sort_unstable();
    let mut splits = Vec::with_capacity(parts);
    let mut prev = 0;
    for cut in cuts {
        splits.push(cut - prev);
        prev = cut;
    }
    splits.push(rows - prev);
    splits
}

#[test]
fn explicit_split_counts_sum_to_numel() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..500 {
        let group = rng.gen_range(1..=8);
        let rows = rng.gen_range(0..=40);
        let row_len = rng.gen_range(1..=5);
        let buf = Buffer::zeros(ElementType::I32, &[rows, row_len]);
        let splits = random_splits(&mut rng, rows, group);

        let counts = split_counts(&buf, &splits, group).unwrap();
        assert_eq!(counts.len(), group);
        assert_eq!(counts.iter().sum::<usize>(), buf.numel());
        for (count, split) in counts.iter().zip(&splits) {
            assert_eq!(*count, split * row_len);
        }
    }
}

#[test]
fn even_split_counts_sum_to_numel() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let group = rng.gen_range(1..=8);
        let rows = group * rng.gen_range(0..=6);
        let buf = Buffer::zeros(ElementType::F32, &[rows, 3]);
        let counts = split_counts(&buf, &[], group).unwrap();
        assert_eq!(counts.iter().sum::<usize>(), buf.numel());
        assert!(counts.windows(2).all(|w| w[0] == w[1]));
    }
}

#[test]
fn views_of_one_allocation_always_reconcile_flat() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let parts = rng.gen_range(1..=6);
        let total = rng.gen_range(0..=30);
        let sizes = random_splits(&mut rng, total, parts);
        let backing = Buffer::zeros(ElementType::I64, &[total]);
        let views = backing.split_with_sizes(&sizes).unwrap();

        let layout = flatten(&views).unwrap();
        assert!(layout.is_flat, "sizes {sizes:?}");
        assert_eq!(layout.lengths, sizes);
        assert_eq!(layout.flat.numel(), total);
        if total > 0 {
            assert!(layout.flat.same_storage(&backing));
        }
    }
}

#[test]
fn separate_allocations_reconcile_to_exact_staging() {
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..100 {
        let parts = rng.gen_range(2..=6);
        let sizes: Vec<usize> = (0..parts).map(|_| rng.gen_range(1..=5)).collect();
        let bufs: Vec<Buffer> = sizes
            .iter()
            .map(|&n| Buffer::zeros(ElementType::F64, &[n]))
            .collect();

        let layout = flatten(&bufs).unwrap();
        assert!(!layout.is_flat);
        assert_eq!(layout.flat.numel(), sizes.iter().sum::<usize>());
        assert!(bufs.iter().all(|b| !layout.flat.same_storage(b)));
    }
}
