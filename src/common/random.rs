use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// A thread-safe randomizer that supports seeding and various random generation functions.
#[derive(Serialize, Clone)]
pub struct Randomizer {
    seed: u64, // Store the seed for serialization
    #[serde(skip)]
    rng: Arc<Mutex<StdRng>>,
}

impl Randomizer {
    /// Creates a new randomizer with a given seed.
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Time went backwards")
                .as_nanos() as u64
        });
        let rng = StdRng::seed_from_u64(seed);
        Self {
            seed,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Derives an independently seeded randomizer, e.g. for ensemble members.
    pub(crate) fn derive(&self, offset: u64) -> Self {
        Self::new(Some(self.seed.wrapping_add(offset).wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }

    /// Generates a random permutation of integers from 0 to n-1.
    pub(crate) fn perm(&self, n: usize) -> Vec<usize> {
        let mut rng = self.rng.lock().unwrap();
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut *rng);
        indices
    }

    /// Uniform random index in [0, n).
    pub(crate) fn index(&self, n: usize) -> usize {
        let mut rng = self.rng.lock().unwrap();
        rng.random_range(0..n)
    }

    /// Uniform random float in [0, 1).
    pub(crate) fn float32(&self) -> f32 {
        let mut rng = self.rng.lock().unwrap();
        rng.random::<f32>()
    }

    /// Sample from a zero-mean normal distribution with the given standard deviation.
    pub(crate) fn normal(&self, std_dev: f32) -> f32 {
        let mut rng = self.rng.lock().unwrap();
        match Normal::new(0.0, std_dev) {
            Ok(dist) => dist.sample(&mut *rng),
            Err(_) => 0.0,
        }
    }
}

// Implement custom deserialization to recreate the RNG from the seed
impl<'de> Deserialize<'de> for Randomizer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RandomizerSeed {
            seed: u64,
        }

        let RandomizerSeed { seed } = RandomizerSeed::deserialize(deserializer)?;
        let rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            seed,
            rng: Arc::new(Mutex::new(rng)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Randomizer;

    #[test]
    fn test_randomizer_with_seed() {
        let randomizer1 = Randomizer::new(Some(42));
        let randomizer2 = Randomizer::new(Some(42));

        assert_eq!(randomizer1.perm(10), randomizer2.perm(10), "Permutations should match for the same seed");
        assert_eq!(randomizer1.float32(), randomizer2.float32(), "Random floats should match for the same seed");
        assert_eq!(randomizer1.index(100), randomizer2.index(100));
        assert_eq!(randomizer1.normal(1.0), randomizer2.normal(1.0));
    }

    #[test]
    fn test_derive_is_deterministic_and_distinct() {
        let base = Randomizer::new(Some(7));
        let a = base.derive(1);
        let b = Randomizer::new(Some(7)).derive(1);
        assert_eq!(a.float32(), b.float32());
        assert_ne!(base.derive(1).perm(20), base.derive(2).perm(20));
    }

    #[test]
    fn test_normal_with_zero_std() {
        let randomizer = Randomizer::new(Some(3));
        assert_eq!(randomizer.normal(0.0), 0.0);
    }

    #[test]
    fn test_random_float32_range() {
        let randomizer = Randomizer::new(Some(42));
        let random_value = randomizer.float32();
        assert!((0.0..1.0).contains(&random_value), "Random float should be in range [0, 1), got {}", random_value);
    }

    #[test]
    fn test_randomizer_deserialization() {
        let json = r#"{"seed": 55}"#;
        let randomizer: Randomizer = serde_json::from_str(json).expect("Failed to deserialize");
        assert_eq!(randomizer.seed, 55);
    }
}
