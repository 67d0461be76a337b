use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;

/// Struct that draws the waiting times of a Poisson process.
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    /// Events per second.
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: Box::new(SmallRng::seed_from_u64(seed)),
            rate,
        }
    }

    /// Function that returns the seconds until the next event.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_secs_f64(self.time_for_next_event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_schedule() {
        let mut a = Poisson::new(2.0, 42);
        let mut b = Poisson::new(2.0, 42);
        for _ in 0..16 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn mean_follows_rate() {
        let mut poisson = Poisson::new(4.0, 7);
        let samples = 20_000;
        let total: f64 = (0..samples).map(|_| poisson.time_for_next_event()).sum();
        let mean = total / samples as f64;
        assert!((mean - 0.25).abs() < 0.02, "mean was {mean}");
    }
}
