//! Radio condition simulation

use std::ops::Range;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Simulates the radio between the controller and the mesh.
///
/// Provides controllable latency and message loss. All draws come from one
/// seeded generator so a run with the same seed loses the same messages.
pub struct NetworkSimulator {
    latency: Range<u64>,
    packet_loss: f64,
    seed: u64,
    rng: Mutex<ChaCha8Rng>,
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    /// Creates a lossless simulator with 1-5ms latency.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns builder for customizing network conditions.
    pub fn builder() -> NetworkSimulatorBuilder {
        NetworkSimulatorBuilder::new()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn packet_loss(&self) -> f64 {
        self.packet_loss
    }

    /// Draws a delay from the latency range.
    pub fn next_latency(&self) -> Duration {
        let millis = if self.latency.is_empty() {
            self.latency.start
        } else {
            self.rng.lock().random_range(self.latency.clone())
        };
        Duration::from_millis(millis)
    }

    /// Sleeps for one drawn latency.
    pub async fn simulate_latency(&self) {
        let delay = self.next_latency();
        tokio::time::sleep(delay).await;
    }

    /// Check if a message should be lost.
    pub fn should_drop_packet(&self) -> bool {
        if self.packet_loss <= 0.0 {
            return false;
        }
        self.rng.lock().random_bool(self.packet_loss.min(1.0))
    }
}

/// Builder for configuring network simulation parameters.
pub struct NetworkSimulatorBuilder {
    latency: Range<u64>,
    packet_loss: f64,
    seed: u64,
}

impl NetworkSimulatorBuilder {
    fn new() -> Self {
        Self {
            latency: 1..5,
            packet_loss: 0.0,
            seed: 0,
        }
    }

    /// Sets latency range in milliseconds.
    pub fn latency(mut self, range: Range<u64>) -> Self {
        self.latency = range;
        self
    }

    /// Sets loss rate as probability (0.0-1.0).
    pub fn packet_loss(mut self, rate: f64) -> Self {
        self.packet_loss = rate.clamp(0.0, 1.0);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Creates network simulator with configured settings.
    pub fn build(self) -> NetworkSimulator {
        NetworkSimulator {
            latency: self.latency,
            packet_loss: self.packet_loss,
            seed: self.seed,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(self.seed)),
        }
    }
}
