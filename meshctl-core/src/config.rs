//! Centralized configuration for meshctl.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all meshctl components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    pub dispatch: DispatchConfig,
    pub discovery: DiscoveryConfig,
    pub topology: TopologyConfig,
    pub schedule: ScheduleConfig,
    pub multicast: MulticastConfig,
    pub simulation: SimulationConfig,
}

/// Bounded-wait settings for requests dispatched to the live network.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a single attempt waits for its response
    pub response_timeout: Duration,
    /// Retransmissions after the first attempt times out
    pub max_retransmit: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            max_retransmit: 1,
        }
    }
}

/// Rover discovery fan-out configuration.
///
/// Controls the size of the worker pool and the per-rover probe budget.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum probes in flight at once across all discovery calls
    pub max_workers: usize,
    /// Probe response timeout
    pub response_timeout: Duration,
    /// Probe retransmissions after a timeout
    pub max_retransmit: u32,
    /// Port the rovers should report their motes to
    pub rover_port: u16,
    /// Address of this controller as announced to rovers
    pub controller_address: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            response_timeout: Duration::from_secs(2),
            max_retransmit: 1,
            rover_port: 50000,
            controller_address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// PDR assigned to links created without an explicit value
    pub default_pdr: f64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self { default_pdr: 1.0 }
    }
}

/// Startup schedule persistence.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Document read when no startup configuration is supplied
    pub default_document: PathBuf,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_document: PathBuf::from("schedule.json"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MulticastConfig {
    /// Fixes the bitmap width up front instead of at the first set
    pub bitmap_width: Option<usize>,
}

/// Simulation mode configuration for testing and development.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Deterministic seed for reproducible propagation draws
    pub deterministic_seed: Option<u64>,
}

impl MeshConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("MESHCTL_DISPATCH_TIMEOUT_MS") {
            if let Ok(millis) = timeout.parse::<u64>() {
                config.dispatch.response_timeout = Duration::from_millis(millis);
            }
        }

        if let Ok(retransmit) = std::env::var("MESHCTL_MAX_RETRANSMIT") {
            if let Ok(count) = retransmit.parse::<u32>() {
                config.dispatch.max_retransmit = count;
            }
        }

        if let Ok(workers) = std::env::var("MESHCTL_DISCOVERY_WORKERS") {
            if let Ok(count) = workers.parse::<usize>() {
                config.discovery.max_workers = count.max(1);
            }
        }

        if let Ok(address) = std::env::var("MESHCTL_CONTROLLER_ADDRESS") {
            config.discovery.controller_address = address;
        }

        if let Ok(path) = std::env::var("MESHCTL_SCHEDULE_DOCUMENT") {
            config.schedule.default_document = PathBuf::from(path);
        }

        if let Ok(width) = std::env::var("MESHCTL_BITMAP_WIDTH") {
            if let Ok(bits) = width.parse::<usize>() {
                config.multicast.bitmap_width = Some(bits);
            }
        }

        if let Ok(seed) = std::env::var("MESHCTL_SIMULATION_SEED") {
            if let Ok(seed_value) = seed.parse::<u64>() {
                config.simulation.deterministic_seed = Some(seed_value);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short dispatch budgets keep timeout paths fast, and a fixed seed makes
    /// propagation draws reproducible.
    pub fn for_testing() -> Self {
        Self {
            dispatch: DispatchConfig {
                response_timeout: Duration::from_millis(50),
                max_retransmit: 1,
            },
            discovery: DiscoveryConfig {
                response_timeout: Duration::from_millis(50),
                max_retransmit: 1,
                ..Default::default()
            },
            simulation: SimulationConfig {
                deterministic_seed: Some(42),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = MeshConfig::default();

        assert_eq!(config.dispatch.response_timeout, Duration::from_secs(2));
        assert_eq!(config.dispatch.max_retransmit, 1);
        assert_eq!(config.discovery.max_workers, 4);
        assert_eq!(config.discovery.rover_port, 50000);
        assert_eq!(config.topology.default_pdr, 1.0);
        assert_eq!(
            config.schedule.default_document,
            PathBuf::from("schedule.json")
        );
        assert!(config.multicast.bitmap_width.is_none());
        assert!(config.simulation.deterministic_seed.is_none());
    }

    #[test]
    fn test_testing_preset() {
        let config = MeshConfig::for_testing();
        assert_eq!(config.dispatch.response_timeout, Duration::from_millis(50));
        assert_eq!(config.simulation.deterministic_seed, Some(42));
        assert_eq!(
            config.discovery.max_workers,
            DiscoveryConfig::default().max_workers
        );
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("MESHCTL_DISPATCH_TIMEOUT_MS", "750");
            std::env::set_var("MESHCTL_MAX_RETRANSMIT", "3");
            std::env::set_var("MESHCTL_DISCOVERY_WORKERS", "0");
            std::env::set_var("MESHCTL_SCHEDULE_DOCUMENT", "/tmp/startup.json");
            std::env::set_var("MESHCTL_BITMAP_WIDTH", "16");
            std::env::set_var("MESHCTL_SIMULATION_SEED", "12345");
        }

        let config = MeshConfig::from_env();

        assert_eq!(config.dispatch.response_timeout, Duration::from_millis(750));
        assert_eq!(config.dispatch.max_retransmit, 3);
        assert_eq!(config.discovery.max_workers, 1);
        assert_eq!(
            config.schedule.default_document,
            PathBuf::from("/tmp/startup.json")
        );
        assert_eq!(config.multicast.bitmap_width, Some(16));
        assert_eq!(config.simulation.deterministic_seed, Some(12345));

        // Cleanup
        unsafe {
            std::env::remove_var("MESHCTL_DISPATCH_TIMEOUT_MS");
            std::env::remove_var("MESHCTL_MAX_RETRANSMIT");
            std::env::remove_var("MESHCTL_DISCOVERY_WORKERS");
            std::env::remove_var("MESHCTL_SCHEDULE_DOCUMENT");
            std::env::remove_var("MESHCTL_BITMAP_WIDTH");
            std::env::remove_var("MESHCTL_SIMULATION_SEED");
        }
    }
}
