//! meshctl simulation framework - Reproducible mesh networks for exercising the controller.
//!
//! This crate stands in for the radio side of a deployment so the control
//! plane can be driven end to end without hardware.
//!
//! # Features
//!
//! - **Seeded Radio**: Configurable latency and message loss from one seed
//! - **Simulated Mesh**: Installs cells, holds the multicast bitmap, answers route queries
//! - **Fault Injection**: Refused slots, silent network, unavailable routing layer
//! - **Simulated Rovers**: Responsive, silent and refusing rovers for discovery rounds

#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]

pub mod dispatch;
pub mod network;
pub mod rover;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

pub use dispatch::SimulatedNetwork;
use meshctl_core::config::MeshConfig;
use meshctl_core::discovery::{RoverAddr, RoverProbe};
use meshctl_core::dispatch::NetworkDispatch;
use meshctl_core::topology::{MoteId, TopologyGraph};
use meshctl_core::MeshController;
pub use network::{NetworkSimulator, NetworkSimulatorBuilder};
pub use rover::{RoverBehavior, SimulatedRovers};

/// Errors raised while assembling a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Simulation initialization failed: {reason}")]
    InitializationFailed { reason: String },

    #[error("Scenario setup failed: {reason}")]
    ScenarioFailed { reason: String },
}

/// Simulation environment for control plane development.
///
/// Combines a topology shared with the simulated mesh, the mesh itself and a
/// set of rovers.
pub struct SimulationEnvironment {
    /// Configuration handed to controllers built from this environment
    pub config: MeshConfig,
    /// Topology shared by the controller and the simulated mesh
    pub topology: Arc<TopologyGraph>,
    /// Simulated mesh answering dispatched requests
    pub network: Arc<SimulatedNetwork>,
    /// Rovers answering discovery probes
    pub rovers: Arc<SimulatedRovers>,
    next_rover: u16,
}

impl Default for SimulationEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationEnvironment {
    /// Creates an empty environment with test timings and a lossless radio.
    pub fn new() -> Self {
        Self::with_network(MeshConfig::for_testing(), NetworkSimulator::new())
    }

    /// Creates an environment whose radio loses messages at `loss` with
    /// draws seeded by `seed`.
    pub fn for_lossy_radio(seed: u64, loss: f64) -> Self {
        let network = NetworkSimulator::builder()
            .latency(1..3)
            .packet_loss(loss)
            .seed(seed)
            .build();
        let mut config = MeshConfig::for_testing();
        config.simulation.deterministic_seed = Some(seed);
        Self::with_network(config, network)
    }

    pub fn with_network(config: MeshConfig, conditions: NetworkSimulator) -> Self {
        let topology = Arc::new(TopologyGraph::new());
        let network = Arc::new(SimulatedNetwork::with_conditions(
            Arc::clone(&topology),
            conditions,
        ));
        Self {
            config,
            topology,
            network,
            rovers: Arc::new(SimulatedRovers::new()),
            next_rover: 0,
        }
    }

    /// Builds a chain of motes `1..=count` rooted at mote 1, linked in both
    /// directions with `pdr`.
    ///
    /// # Errors
    ///
    /// - `SimulationError::ScenarioFailed` - If `count` is zero or `pdr` is invalid
    pub fn add_line(&self, count: u16, pdr: f64) -> Result<Vec<MoteId>, SimulationError> {
        if count == 0 {
            return Err(SimulationError::ScenarioFailed {
                reason: "a line needs at least one mote".to_string(),
            });
        }
        let motes: Vec<MoteId> = (1..=count).map(MoteId::new).collect();
        for (index, mote) in motes.iter().enumerate() {
            self.topology.upsert_mote(*mote, 0.0, index as f64);
        }
        let scenario = |e: meshctl_core::topology::TopologyError| SimulationError::ScenarioFailed {
            reason: e.to_string(),
        };
        self.topology.set_dag_root(motes[0], true).map_err(scenario)?;
        for pair in motes.windows(2) {
            self.topology.connect(pair[0], pair[1], Some(pdr)).map_err(scenario)?;
            self.topology.connect(pair[1], pair[0], Some(pdr)).map_err(scenario)?;
        }
        Ok(motes)
    }

    /// Adds rovers answering after `delay` with `motes_each` motes apiece.
    pub fn add_responsive_rovers(
        &mut self,
        count: usize,
        motes_each: usize,
        delay: Duration,
    ) -> Vec<RoverAddr> {
        (0..count)
            .map(|_| {
                let rover = self.allocate_rover();
                let motes: Vec<String> = (0..motes_each).map(|i| format!("mote{i}")).collect();
                let refs: Vec<&str> = motes.iter().map(String::as_str).collect();
                self.rovers.add_responsive(rover, &refs, delay);
                rover
            })
            .collect()
    }

    /// Adds rovers that never answer.
    pub fn add_unresponsive_rovers(&mut self, count: usize) -> Vec<RoverAddr> {
        (0..count)
            .map(|_| {
                let rover = self.allocate_rover();
                self.rovers.add_unresponsive(rover);
                rover
            })
            .collect()
    }

    /// Adds rovers that refuse every probe.
    pub fn add_refusing_rovers(&mut self, count: usize) -> Vec<RoverAddr> {
        (0..count)
            .map(|_| {
                let rover = self.allocate_rover();
                self.rovers.add_refusing(rover);
                rover
            })
            .collect()
    }

    /// Builds a controller wired to this environment's topology, mesh and
    /// rovers.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InitializationFailed` - If the configuration is unusable
    pub fn controller(&self) -> Result<MeshController, SimulationError> {
        if self.config.discovery.max_workers == 0 {
            return Err(SimulationError::InitializationFailed {
                reason: "discovery needs at least one worker".to_string(),
            });
        }
        let controller = MeshController::with_topology(
            self.config.clone(),
            Arc::clone(&self.topology),
            Arc::clone(&self.network) as Arc<dyn NetworkDispatch>,
            Arc::clone(&self.rovers) as Arc<dyn RoverProbe>,
        );
        tracing::debug!(
            motes = self.topology.motes().len(),
            "Simulated controller ready"
        );
        Ok(controller)
    }

    fn allocate_rover(&mut self) -> RoverAddr {
        self.next_rover += 1;
        let [high, low] = self.next_rover.to_be_bytes();
        RoverAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, high, low)))
    }
}
