//! Background noise generator
//!
//! Sends unrelated chat requests directly to the inference backend
//! (bypassing the daemon) as a Poisson process with rate λ, creating cache
//! contention and queueing realism during the workload. Arrivals are drawn
//! from a seeded generator so otherwise-identical conditions see the same
//! arrival sequence. Noise is best-effort: request failures are logged and
//! swallowed, and in-flight requests finish naturally after shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use reqwest::Client;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::engine::backend::Backend;

/// Default seed; kept a CLI option for future replay
pub const DEFAULT_SEED: u64 = 42;

/// Generation budget per noise request; responses stay short
const NOISE_MAX_TOKENS: u32 = 20;

/// Fixed pool of short, unrelated questions
pub const NOISE_PROMPTS: [&str; 8] = [
    "What is the weather today?",
    "Explain quantum computing in simple terms.",
    "Write a haiku about programming.",
    "List 5 benefits of exercise.",
    "What is the capital of France?",
    "Describe the water cycle.",
    "Tell me a fun fact about space.",
    "What are the main components of a computer?",
];

/// Poisson-arrival request stream against the inference backend
pub struct NoiseGenerator {
    backend: Arc<dyn Backend>,
    base_url: String,
    model: String,
    rate: f64,
    // Serialized so the fire-and-forget tasks cannot race the arrival draw
    rng: Mutex<StdRng>,
    client: Client,
}

impl NoiseGenerator {
    /// A generator with rate λ > 0. Callers skip construction entirely for
    /// λ = 0.
    pub fn new(
        backend: Arc<dyn Backend>,
        base_url: String,
        model: String,
        rate: f64,
        seed: u64,
    ) -> Self {
        Self {
            backend,
            base_url,
            model,
            rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            client: Client::new(),
        }
    }

    /// Inter-arrival delay for a Poisson process with the given rate:
    /// Exp(1) / λ seconds.
    pub fn next_arrival(rng: &mut StdRng, rate: f64) -> Duration {
        let unit: f64 = rng.sample(Exp1);
        Duration::from_secs_f64(unit / rate)
    }

    /// Run until the shutdown signal fires. Each iteration fires one
    /// request asynchronously, then sleeps for the sampled inter-arrival
    /// time, so slow responses never slow the arrival process.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            rate = self.rate,
            backend = %self.base_url,
            "starting background noise generator (Poisson arrivals)"
        );

        loop {
            let (prompt, delay) = {
                let mut rng = self.rng.lock().await;
                let prompt = *NOISE_PROMPTS
                    .choose(&mut *rng)
                    .expect("prompt pool is never empty");
                (prompt, Self::next_arrival(&mut rng, self.rate))
            };

            let generator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = generator.send_one(prompt).await {
                    warn!(error = %e, "background request failed");
                }
            });

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("background noise generator stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn send_one(&self, prompt: &str) -> Result<()> {
        let url = self.backend.chat_url(&self.base_url);
        let body = self.backend.chat_body(&self.model, prompt, NOISE_MAX_TOKENS);

        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("unexpected status: {}", response.status());
        }
        // The response content is irrelevant; only the load matters.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrival_sequence_is_reproducible() {
        let mut a = StdRng::seed_from_u64(DEFAULT_SEED);
        let mut b = StdRng::seed_from_u64(DEFAULT_SEED);

        for _ in 0..1000 {
            assert_eq!(
                NoiseGenerator::next_arrival(&mut a, 2.0),
                NoiseGenerator::next_arrival(&mut b, 2.0)
            );
        }
    }

    #[test]
    fn test_different_seeds_give_different_sequences() {
        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(2);

        let seq_a: Vec<Duration> = (0..10)
            .map(|_| NoiseGenerator::next_arrival(&mut a, 1.0))
            .collect();
        let seq_b: Vec<Duration> = (0..10)
            .map(|_| NoiseGenerator::next_arrival(&mut b, 1.0))
            .collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn test_mean_inter_arrival_converges_to_inverse_rate() {
        let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
        let rate = 4.0;
        let n = 100_000;

        let total: f64 = (0..n)
            .map(|_| NoiseGenerator::next_arrival(&mut rng, rate).as_secs_f64())
            .sum();
        let mean = total / n as f64;

        // Exp mean is 1/λ; 100k samples keep the sample mean within a few percent
        assert!(
            (mean - 1.0 / rate).abs() < 0.01,
            "mean inter-arrival {mean} too far from {}",
            1.0 / rate
        );
    }
}
