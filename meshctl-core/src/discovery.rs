//! Fan-out discovery of remote rovers.
//!
//! Rovers are gateways hosting motes on another machine. A discovery round
//! probes every rover concurrently through a bounded worker pool and waits
//! for all of them before reporting. One rover failing or staying silent
//! never affects the outcome recorded for another.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::ErrorKind;
use crate::config::DiscoveryConfig;
use crate::dispatch::{DispatchError, DispatchPolicy};

/// Path of the rover service that answers probes.
pub const ROVER_SERVICE_PATH: &str = "pcinfo";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid rover address '{input}'")]
    InvalidAddress { input: String },

    #[error("Unknown rover command '{input}'")]
    UnknownCommand { input: String },

    #[error("Rover {rover} is not registered")]
    UnknownRover { rover: RoverAddr },

    #[error("Rover {rover} still hosts {motes} mote(s)")]
    RoverBusy { rover: RoverAddr, motes: usize },
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiscoveryError::UnknownRover { .. } => ErrorKind::NotFound,
            DiscoveryError::InvalidAddress { .. }
            | DiscoveryError::UnknownCommand { .. }
            | DiscoveryError::RoverBusy { .. } => ErrorKind::Validation,
        }
    }
}

/// IP address of a rover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RoverAddr(IpAddr);

impl RoverAddr {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// URI of the probe service on this rover.
    pub fn service_uri(&self) -> String {
        match self.0 {
            IpAddr::V6(ip) => format!("coap://[{ip}]/{ROVER_SERVICE_PATH}"),
            IpAddr::V4(ip) => format!("coap://{ip}/{ROVER_SERVICE_PATH}"),
        }
    }
}

impl FromStr for RoverAddr {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<IpAddr>()
            .map(Self)
            .map_err(|_| DiscoveryError::InvalidAddress {
                input: s.to_string(),
            })
    }
}

impl fmt::Display for RoverAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Probe telling a rover where to report its motes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub controller_address: String,
    pub port: u16,
    pub rover: RoverAddr,
}

impl ProbeRequest {
    /// Wire payload `controller;port;rover`.
    pub fn payload(&self) -> String {
        format!("{};{};{}", self.controller_address, self.port, self.rover)
    }
}

/// Transport used to probe a single rover.
#[async_trait]
pub trait RoverProbe: Send + Sync {
    /// Sends one probe and returns the mote identifiers the rover hosts.
    ///
    /// # Errors
    ///
    /// - `DispatchError::Rejected` - If the rover refused the probe
    /// - `DispatchError::Unreachable` - If the rover cannot be contacted
    async fn probe(&self, request: &ProbeRequest) -> Result<Vec<String>, DispatchError>;
}

/// Outcome of probing one rover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerOutcome {
    /// Motes reported by the rover, each suffixed with `@rover`.
    Discovered(Vec<String>),
    TimedOut,
    Failed { reason: String },
}

/// Per-rover outcomes of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub outcomes: BTreeMap<RoverAddr, PeerOutcome>,
}

impl DiscoveryReport {
    pub fn outcome(&self, rover: &RoverAddr) -> Option<&PeerOutcome> {
        self.outcomes.get(rover)
    }

    pub fn discovered(&self) -> impl Iterator<Item = (&RoverAddr, &Vec<String>)> {
        self.outcomes.iter().filter_map(|(rover, outcome)| match outcome {
            PeerOutcome::Discovered(motes) => Some((rover, motes)),
            _ => None,
        })
    }

    pub fn success_count(&self) -> usize {
        self.discovered().count()
    }

    pub fn timeout_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| **outcome == PeerOutcome::TimedOut)
            .count()
    }
}

/// Bounded worker pool probing rovers concurrently.
///
/// Every round gets its own `max_workers` permits, so concurrent rounds
/// never queue behind each other. A round never outlives the policy's
/// `max_wait`: a rover still waiting for a worker or still unanswered at
/// that deadline is reported as timed out.
pub struct DiscoveryPool {
    probe: Arc<dyn RoverProbe>,
    workers: usize,
    policy: DispatchPolicy,
    controller_address: String,
    port: u16,
}

impl DiscoveryPool {
    pub fn new(probe: Arc<dyn RoverProbe>, config: &DiscoveryConfig) -> Self {
        Self {
            probe,
            workers: config.max_workers.max(1),
            policy: DispatchPolicy::new(config.response_timeout, config.max_retransmit),
            controller_address: config.controller_address.clone(),
            port: config.rover_port,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Probes every rover and waits for all probes to finish or expire.
    pub async fn discover(&self, rovers: &[RoverAddr]) -> DiscoveryReport {
        let deadline = tokio::time::Instant::now() + self.policy.max_wait();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = Vec::with_capacity(rovers.len());
        for rover in rovers {
            let rover = *rover;
            let probe = Arc::clone(&self.probe);
            let permits = Arc::clone(&permits);
            let policy = self.policy;
            let request = ProbeRequest {
                controller_address: self.controller_address.clone(),
                port: self.port,
                rover,
            };

            let task = tokio::spawn(async move {
                let worker = async {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return PeerOutcome::Failed {
                            reason: "worker pool closed".to_string(),
                        };
                    };
                    let result = policy
                        .run("rover_probe", || probe.probe(&request))
                        .await;
                    match result {
                        Ok(motes) => PeerOutcome::Discovered(
                            motes
                                .into_iter()
                                .map(|mote| format!("{mote}@{rover}"))
                                .collect(),
                        ),
                        Err(DispatchError::Timeout { .. }) => PeerOutcome::TimedOut,
                        Err(e) => PeerOutcome::Failed {
                            reason: e.to_string(),
                        },
                    }
                };
                tokio::time::timeout_at(deadline, worker)
                    .await
                    .unwrap_or(PeerOutcome::TimedOut)
            });
            tasks.push((rover, task));
        }

        let mut report = DiscoveryReport::default();
        for (rover, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(rover = %rover, error = %e, "Discovery worker aborted");
                    PeerOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            tracing::debug!(rover = %rover, outcome = ?outcome, "Rover probed");
            report.outcomes.insert(rover, outcome);
        }

        tracing::info!(
            rovers = rovers.len(),
            discovered = report.success_count(),
            timed_out = report.timeout_count(),
            "Discovery round finished"
        );
        report
    }
}

/// Operator commands on the rover list, written as `command@data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoverCommand {
    Add(RoverAddr),
    Remove(RoverAddr),
    /// Comma-separated list of rovers to add.
    Upload(Vec<RoverAddr>),
    Disconnect(RoverAddr),
}

impl FromStr for RoverCommand {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || DiscoveryError::UnknownCommand {
            input: s.to_string(),
        };
        let (command, data) = s.split_once('@').ok_or_else(unknown)?;
        match command {
            "add" => Ok(RoverCommand::Add(data.parse()?)),
            "del" => Ok(RoverCommand::Remove(data.parse()?)),
            "disconn" => Ok(RoverCommand::Disconnect(data.parse()?)),
            "upload" => data
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(RoverCommand::Upload),
            _ => Err(unknown()),
        }
    }
}

/// Known rovers and the motes each one last reported.
#[derive(Debug, Default)]
pub struct RoverRegistry {
    rovers: RwLock<BTreeMap<RoverAddr, Vec<String>>>,
}

impl RoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rover. Returns false if it was already known.
    pub fn add(&self, rover: RoverAddr) -> bool {
        let mut rovers = self.rovers.write();
        if rovers.contains_key(&rover) {
            return false;
        }
        rovers.insert(rover, Vec::new());
        true
    }

    /// Unregisters a rover that hosts no motes.
    ///
    /// # Errors
    ///
    /// - `DiscoveryError::UnknownRover` - If the rover is not registered
    /// - `DiscoveryError::RoverBusy` - If the rover still hosts motes
    pub fn remove(&self, rover: RoverAddr) -> Result<(), DiscoveryError> {
        let mut rovers = self.rovers.write();
        let motes = rovers
            .get(&rover)
            .ok_or(DiscoveryError::UnknownRover { rover })?;
        if !motes.is_empty() {
            return Err(DiscoveryError::RoverBusy {
                rover,
                motes: motes.len(),
            });
        }
        rovers.remove(&rover);
        Ok(())
    }

    /// Forgets the motes of a rover, keeping the rover registered.
    ///
    /// # Errors
    ///
    /// - `DiscoveryError::UnknownRover` - If the rover is not registered
    pub fn disconnect(&self, rover: RoverAddr) -> Result<Vec<String>, DiscoveryError> {
        let mut rovers = self.rovers.write();
        let motes = rovers
            .get_mut(&rover)
            .ok_or(DiscoveryError::UnknownRover { rover })?;
        Ok(std::mem::take(motes))
    }

    /// Stores the motes of every rover that answered.
    pub fn record(&self, report: &DiscoveryReport) {
        let mut rovers = self.rovers.write();
        for (rover, motes) in report.discovered() {
            rovers.insert(*rover, motes.clone());
        }
    }

    pub fn rovers(&self) -> Vec<RoverAddr> {
        self.rovers.read().keys().copied().collect()
    }

    pub fn motes_of(&self, rover: &RoverAddr) -> Option<Vec<String>> {
        self.rovers.read().get(rover).cloned()
    }

    /// Applies an operator command.
    ///
    /// # Errors
    ///
    /// Same as [`RoverRegistry::remove`] and [`RoverRegistry::disconnect`].
    pub fn apply(&self, command: RoverCommand) -> Result<(), DiscoveryError> {
        match command {
            RoverCommand::Add(rover) => {
                self.add(rover);
            }
            RoverCommand::Remove(rover) => self.remove(rover)?,
            RoverCommand::Upload(list) => {
                for rover in list {
                    self.add(rover);
                }
            }
            RoverCommand::Disconnect(rover) => {
                let motes = self.disconnect(rover)?;
                tracing::info!(rover = %rover, motes = motes.len(), "Disconnected rover motes");
            }
        }
        Ok(())
    }
}
