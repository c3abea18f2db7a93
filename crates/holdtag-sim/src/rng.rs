use serde::{Deserialize, Serialize};

/// Seeded generator for simulation schedules (`SplitMix64`).
///
/// Same seed, same schedule, on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[must_use]
    pub const fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform index in `[0, len)`; `0` when `len` is zero.
    #[must_use]
    pub fn below(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let len_u64 = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.next_u64() % len_u64).unwrap_or(0)
    }

    /// `true` with probability `percent / 100`.
    #[must_use]
    pub fn percent(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            p if p >= 100 => true,
            p => self.next_u64() % 100 < u64::from(p),
        }
    }

    /// Pick an index according to integer weights. Returns `None` when all
    /// weights are zero.
    #[must_use]
    pub fn weighted(&mut self, weights: &[u32]) -> Option<usize> {
        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        if total == 0 {
            return None;
        }
        let mut roll = self.next_u64() % total;
        for (idx, weight) in weights.iter().enumerate() {
            let weight = u64::from(*weight);
            if roll < weight {
                return Some(idx);
            }
            roll -= weight;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::DeterministicRng;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = DeterministicRng::new(7);
        let mut b = DeterministicRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn below_stays_in_range() {
        let mut rng = DeterministicRng::new(1);
        assert_eq!(rng.below(0), 0);
        for _ in 0..256 {
            assert!(rng.below(5) < 5);
        }
    }

    #[test]
    fn weighted_skips_zero_weights() {
        let mut rng = DeterministicRng::new(3);
        assert_eq!(rng.weighted(&[0, 0]), None);
        for _ in 0..64 {
            assert_eq!(rng.weighted(&[0, 4, 0]), Some(1));
        }
    }

    #[test]
    fn percent_extremes() {
        let mut rng = DeterministicRng::new(9);
        assert!(!rng.percent(0));
        assert!(rng.percent(100));
    }
}
