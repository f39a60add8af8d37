use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;

/// Poisson process deciding when a peer next wants the critical section.
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    /// Mean number of events per second.
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: Box::new(SmallRng::seed_from_u64(seed)),
            rate,
        }
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    /// Seconds until the next event, drawn from the exponential distribution.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    pub fn delay_for_next_event(&mut self) -> Duration {
        Duration::from_secs_f64(self.time_for_next_event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_non_negative_and_reproducible() {
        let mut first = Poisson::new(4.0, 7);
        let mut second = Poisson::new(4.0, 7);

        for _ in 0..100 {
            let delay = first.time_for_next_event();
            assert!(delay >= 0.0 && delay.is_finite());
            assert_eq!(delay, second.time_for_next_event());
        }
    }

    #[test]
    fn mean_delay_follows_rate() {
        let mut poisson = Poisson::new(2.0, 42);
        let mean = (0..20_000)
            .map(|_| poisson.time_for_next_event())
            .sum::<f64>()
            / 20_000.0;
        assert!((mean - 0.5).abs() < 0.05, "mean was {mean}");
    }
}
