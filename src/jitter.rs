//! Bounded proportional jitter for retry delays.
//!
//! A jittered delay is `delay × (1 + fraction × (2u − 1))` where `u ∈ [0, 1)` comes from an
//! injected [`RandomSource`]. The result always lies in `[delay × (1 − fraction), delay × (1 +
//! fraction)]`, and `fraction` is clamped to `[0, 1]` so the result is never negative.
//!
//! RNG: [`ThreadRandom`] draws from `rand`'s thread-local RNG; tests pin values with
//! [`FixedRandom`] or reproduce sequences with [`SeededRandom`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Source of uniform samples in `[0, 1)`.
pub trait RandomSource: Send + Sync + std::fmt::Debug {
    fn next_unit(&self) -> f64;
}

/// Thread-local `rand` RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_unit(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Deterministic, reproducible sequence from a seed.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: Arc<Mutex<StdRng>>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))) }
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&self) -> f64 {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).random::<f64>()
    }
}

/// Always returns the same sample. `0.5` means "no jitter".
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_unit(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Spread the delay by up to `±fraction` of itself.
    Proportional(f64),
}

impl Jitter {
    pub fn proportional(fraction: f64) -> Self {
        if fraction <= 0.0 || fraction.is_nan() {
            Jitter::None
        } else {
            Jitter::Proportional(fraction.min(1.0))
        }
    }

    /// Apply jitter to `delay` with a sample drawn from `random`.
    pub fn apply(&self, delay: Duration, random: &dyn RandomSource) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Proportional(fraction) => {
                if delay.is_zero() {
                    return delay;
                }
                let u = random.next_unit().clamp(0.0, 1.0);
                let factor = 1.0 + fraction.clamp(0.0, 1.0) * (2.0 * u - 1.0);
                let nanos = (delay.as_nanos() as f64 * factor).round();
                if nanos >= u64::MAX as f64 {
                    return delay;
                }
                Duration::from_nanos(nanos.max(0.0) as u64)
            }
        }
    }
}
