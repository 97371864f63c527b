use std::collections::HashMap;

use crate::runtime::fastrand::fastrand;

/// Number of draws used to estimate one average.
pub const FAST_RAND_AVG_SAMPLES: u32 = 10_000;
/// Entries kept by [`FastRandAvgCache`] before it stops memoizing.
pub const FAST_RAND_CACHE_LIMIT: usize = 9230;

/// Memoized estimate of `mean(fastrand() % (target + 1))`.
///
/// The estimate replays the generator from seed 1, which is what makes it
/// reproducible across runs; it is used to report the expected length of
/// streams whose packet size is a RANDOM variable.
#[derive(Debug, Default, Clone)]
pub struct FastRandAvgCache {
    cache: HashMap<u16, f64>,
}

impl FastRandAvgCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn avg(&mut self, target: u16) -> f64 {
        if let Some(avg) = self.cache.get(&target) {
            return *avg;
        }
        let avg = Self::estimate(target);
        if self.cache.len() <= FAST_RAND_CACHE_LIMIT {
            self.cache.insert(target, avg);
        }
        avg
    }

    pub fn estimate(target: u16) -> f64 {
        let mut seed = 1u32;
        let modulo = target as u64 + 1;
        let sum: u64 = (0..FAST_RAND_AVG_SAMPLES)
            .map(|_| fastrand(&mut seed) as u64 % modulo)
            .sum();
        sum as f64 / FAST_RAND_AVG_SAMPLES as f64
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
    pub fn clear(&mut self) {
        self.cache.clear()
    }
}
