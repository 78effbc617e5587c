//! Seeded visiting orders.

use rand::{RngExt, SeedableRng, rngs::StdRng};

/// Fisher-Yates shuffle driven by a seeded `StdRng`.
pub fn seeded_shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}

/// `0..len` in a seeded random order.
#[must_use]
pub fn seeded_permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    seeded_shuffle(&mut order, seed);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutation_is_complete_and_stable() {
        let a = seeded_permutation(50, 3);
        let b = seeded_permutation(50, 3);
        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        assert_ne!(a, seeded_permutation(50, 4));
    }

    #[test]
    fn test_shuffle_short_slices() {
        let mut empty: [u8; 0] = [];
        seeded_shuffle(&mut empty, 1);
        let mut one = [7];
        seeded_shuffle(&mut one, 1);
        assert_eq!(one, [7]);
    }
}
