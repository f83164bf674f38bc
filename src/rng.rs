// seedable randomness for concurrent trials
//
// Each worker thread lazily derives its own SmallRng from the master seed
// and a per-service thread ordinal, so sampling never takes a lock. With a
// single thread the stream is fully deterministic; with several threads the
// seed assignment depends on which thread touches the service first, which
// keeps runs statistically equivalent across thread counts.

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_RNGS: RefCell<HashMap<u64, SmallRng>> = RefCell::new(HashMap::new());
}

pub struct RngService {
    service_id: u64,
    master_seed: u64,
    next_ordinal: AtomicU64,
}

impl RngService {
    pub fn new(master_seed: u64) -> Self {
        RngService {
            service_id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            master_seed,
            next_ordinal: AtomicU64::new(0),
        }
    }

    /// Runs `f` with this thread's generator, creating it on first use.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut SmallRng) -> T) -> T {
        THREAD_RNGS.with(|cell| {
            let mut rngs = cell.borrow_mut();
            let rng = rngs.entry(self.service_id).or_insert_with(|| {
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                SmallRng::seed_from_u64(self.master_seed.wrapping_add(ordinal.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
            });
            f(rng)
        })
    }

    /// Uniform integer in `[lo, hi)`.
    pub fn rand_int(&self, lo: usize, hi: usize) -> usize {
        self.with_rng(|rng| rng.random_range(lo..hi))
    }

    /// Uniform float in `[0, 1)`.
    pub fn rand_uniform(&self) -> f64 {
        self.with_rng(|rng| rng.random_range(0.0..1.0))
    }

    /// Samples an index proportionally to the given non-negative weights.
    /// Rejects empty, zero-mass and non-finite weight vectors.
    pub fn sample_weighted_index(&self, weights: &[f64]) -> Result<usize> {
        let distribution =
            WeightedIndex::new(weights).context("cannot sample from these weights")?;
        Ok(self.with_rng(|rng| distribution.sample(rng)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_stream_is_deterministic() {
        let a = RngService::new(123);
        let b = RngService::new(123);
        let xs: Vec<usize> = (0..32).map(|_| a.rand_int(0, 1000)).collect();
        let ys: Vec<usize> = (0..32).map(|_| b.rand_int(0, 1000)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn different_seeds_give_different_streams() {
        let a = RngService::new(1);
        let b = RngService::new(2);
        let xs: Vec<usize> = (0..32).map(|_| a.rand_int(0, 1_000_000)).collect();
        let ys: Vec<usize> = (0..32).map(|_| b.rand_int(0, 1_000_000)).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn weighted_sampling_rejects_zero_mass() {
        let service = RngService::new(5);
        assert!(service.sample_weighted_index(&[0.0, 0.0]).is_err());
    }

    #[test]
    fn weighted_sampling_hits_only_positive_weights() {
        let service = RngService::new(5);
        for _ in 0..200 {
            let index = service.sample_weighted_index(&[0.0, 3.0, 0.0]).unwrap();
            assert_eq!(index, 1);
        }
    }
}
