//! meshctl Core - Control plane for time-synchronized low-power meshes
//!
//! This crate provides the three coupled subsystems that manage a live mesh:
//! the slotframe schedule manager, the bit-indexed multicast controller, and
//! the topology graph with its propagation engine and route resolver. All
//! traffic towards motes goes through the [`dispatch::NetworkDispatch`]
//! collaborator, so the same logic drives real networks and simulations.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod dispatch;
pub mod multicast;
pub mod propagation;
pub mod routing;
pub mod schedule;
pub mod topology;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::MeshConfig;
pub use controller::{ClearTarget, MeshController, ScheduleCommand};
pub use discovery::{DiscoveryError, DiscoveryPool, DiscoveryReport, RoverAddr, RoverProbe};
pub use dispatch::{DispatchError, DispatchPolicy, NetworkDispatch};
pub use multicast::{Bitmap, MulticastController, MulticastError, PathReplication};
pub use propagation::PropagationEngine;
pub use routing::{ResolvedRoute, RouteError, RouteResolver};
pub use schedule::{Schedule, ScheduleError, ScheduleManager};
pub use topology::{MoteId, TopologyError, TopologyGraph};

/// Failure classes shared by every subsystem.
///
/// Callers decide how to react based on the class rather than on the
/// component that produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally before anything reached the network.
    Validation,
    /// Referenced link, mote, or frame does not exist.
    NotFound,
    /// Network request exceeded its timeout and retransmit budget.
    DispatchTimeout,
    /// Network answered with a refusal or could not be reached.
    Dispatch,
    /// Some changes were acknowledged by the network, others were not.
    PartialInstall,
    /// Startup configuration document missing or corrupt.
    ConfigLoad,
}

/// Core errors that can bubble up from any meshctl subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Multicast error: {0}")]
    Multicast(#[from] MulticastError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Unknown command '{input}'")]
    UnknownCommand { input: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl MeshError {
    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Topology(e) => e.kind(),
            MeshError::Schedule(e) => e.kind(),
            MeshError::Multicast(e) => e.kind(),
            MeshError::Route(e) => e.kind(),
            MeshError::Discovery(e) => e.kind(),
            MeshError::Dispatch(e) => e.kind(),
            MeshError::UnknownCommand { .. } => ErrorKind::Validation,
            MeshError::Configuration { .. } => ErrorKind::ConfigLoad,
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MeshError::Topology(TopologyError::UnknownMote { id }) => {
                format!("Mote {id} is not part of the topology")
            }
            MeshError::Topology(TopologyError::InvalidPdr { value }) => {
                format!("Delivery ratio {value} must be between 0 and 1")
            }
            MeshError::Multicast(MulticastError::InvalidBitmapFormat { .. }) => {
                "Bitmap should only contain 0 and 1".to_string()
            }
            MeshError::Route(RouteError::NoRouteAvailable { destination }) => {
                format!("No route available to mote {destination}")
            }
            _ => match self.kind() {
                ErrorKind::Validation => "Invalid request".to_string(),
                ErrorKind::NotFound => "Requested element not found".to_string(),
                ErrorKind::DispatchTimeout => "Network did not respond in time".to_string(),
                ErrorKind::Dispatch => "Network refused the request".to_string(),
                ErrorKind::PartialInstall => "Network applied only part of the change".to_string(),
                ErrorKind::ConfigLoad => "Configuration could not be loaded".to_string(),
            },
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
