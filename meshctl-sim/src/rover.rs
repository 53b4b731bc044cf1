//! Simulated rovers answering discovery probes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meshctl_core::discovery::{ProbeRequest, RoverAddr, RoverProbe};
use meshctl_core::dispatch::DispatchError;
use parking_lot::Mutex;

/// How a simulated rover reacts to a probe.
#[derive(Debug, Clone, PartialEq)]
pub enum RoverBehavior {
    /// Answers after `delay` with the motes it hosts.
    Responsive { motes: Vec<String>, delay: Duration },
    /// Never answers.
    Unresponsive,
    /// Answers with a refusal.
    Refusing,
}

/// Set of rovers with scripted behaviour.
///
/// Unknown rovers behave as unresponsive. Tracks how many probes are in
/// flight at once so tests can check the worker bound.
#[derive(Debug, Default)]
pub struct SimulatedRovers {
    behaviors: Mutex<HashMap<RoverAddr, RoverBehavior>>,
    payloads: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedRovers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_responsive(&self, rover: RoverAddr, motes: &[&str], delay: Duration) {
        self.set_behavior(
            rover,
            RoverBehavior::Responsive {
                motes: motes.iter().map(|mote| mote.to_string()).collect(),
                delay,
            },
        );
    }

    pub fn add_unresponsive(&self, rover: RoverAddr) {
        self.set_behavior(rover, RoverBehavior::Unresponsive);
    }

    pub fn add_refusing(&self, rover: RoverAddr) {
        self.set_behavior(rover, RoverBehavior::Refusing);
    }

    pub fn set_behavior(&self, rover: RoverAddr, behavior: RoverBehavior) {
        self.behaviors.lock().insert(rover, behavior);
    }

    /// Payloads of every probe received, in arrival order.
    pub fn received_payloads(&self) -> Vec<String> {
        self.payloads.lock().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.payloads.lock().len()
    }

    /// Highest number of probes that were being answered at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoverProbe for SimulatedRovers {
    async fn probe(&self, request: &ProbeRequest) -> Result<Vec<String>, DispatchError> {
        self.payloads.lock().push(request.payload());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let behavior = self
            .behaviors
            .lock()
            .get(&request.rover)
            .cloned()
            .unwrap_or(RoverBehavior::Unresponsive);

        match behavior {
            RoverBehavior::Responsive { motes, delay } => {
                tokio::time::sleep(delay).await;
                Ok(motes)
            }
            RoverBehavior::Unresponsive => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            RoverBehavior::Refusing => Err(DispatchError::Rejected {
                reason: format!("rover {} refused probe", request.rover),
            }),
        }
    }
}
