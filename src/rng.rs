//! Seeded random-number facade for weight initialization and dropout masks.
//!
//! The engine treats randomness as a pure function of a seed and a count:
//! the same seed always produces the same weight matrix and the same dropout
//! masks, which keeps training runs reproducible and makes the tests
//! deterministic. Layers derive their own seed from the session seed and
//! their layer index so that reordering unrelated layers does not shuffle
//! every mask in the network.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// How a weight matrix is filled at first initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightInit {
    /// Uniform in `[-scale, scale]` with `scale = sqrt(2 / fan_in)`.
    ScaledUniform,
    /// Gaussian with the given standard deviation, mean zero.
    Normal { std: f32 },
}

/// Deterministic RNG owned by a layer or optimizer.
pub struct SeedRng {
    rng: StdRng,
}

impl SeedRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derive a per-layer seed from a session seed and a layer index.
    ///
    /// A fixed odd multiplier spreads consecutive indices across the seed
    /// space so neighboring layers do not draw correlated streams.
    pub fn derive(base_seed: u64, layer_index: usize) -> Self {
        Self::new(base_seed ^ (layer_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Fill `dst` with uniform values in `[-amplitude, amplitude]`.
    pub fn fill_uniform(&mut self, dst: &mut [f32], amplitude: f32) {
        for v in dst.iter_mut() {
            *v = self.rng.gen_range(-amplitude..=amplitude);
        }
    }

    /// Fill `dst` with uniform values in `[0, 1)`.
    pub fn fill_unit(&mut self, dst: &mut [f32]) {
        for v in dst.iter_mut() {
            *v = self.rng.gen::<f32>();
        }
    }

    /// Fill `dst` with normal samples, mean zero.
    pub fn fill_normal(&mut self, dst: &mut [f32], std: f32) {
        let dist = Normal::new(0.0, std as f64).expect("std must be finite and positive");
        for v in dst.iter_mut() {
            *v = dist.sample(&mut self.rng) as f32;
        }
    }

    /// One Bernoulli draw: true with probability `p`.
    pub fn chance(&mut self, p: f32) -> bool {
        self.rng.gen::<f32>() < p
    }

    /// Fill a weight matrix according to the chosen scheme.
    pub fn fill_weights(&mut self, dst: &mut [f32], scheme: WeightInit, fan_in: usize) {
        match scheme {
            WeightInit::ScaledUniform => {
                let scale = (2.0 / fan_in.max(1) as f32).sqrt();
                self.fill_uniform(dst, scale);
            }
            WeightInit::Normal { std } => self.fill_normal(dst, std),
        }
    }
}
