//! Facade assembling every component behind one call surface.
//!
//! A [`MeshController`] owns its aggregates outright. Nothing is global, so
//! several controllers can run side by side in one process.

use std::str::FromStr;
use std::sync::Arc;

use crate::config::MeshConfig;
use crate::discovery::{DiscoveryPool, DiscoveryReport, RoverCommand, RoverProbe, RoverRegistry};
use crate::dispatch::{DispatchPolicy, NetworkDispatch};
use crate::multicast::{Bitmap, MulticastCommand, MulticastController, MulticastStatus, PathReplication};
use crate::propagation::{PropagationEngine, TransmissionOutcome};
use crate::routing::{ResolvedRoute, RouteResolver};
use crate::schedule::{FrameSelector, Schedule, ScheduleError, ScheduleManager, StartupSource};
use crate::topology::{Link, MoteId, TopologyGraph, TopologySnapshot};
use crate::{MeshError, Result};

/// Schedule operations available to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleCommand {
    /// Install the startup configuration.
    Install,
    /// Clear non-shared cells from every frame.
    ClearFrames,
    ClearShared,
    ClearAll,
    ShowRunning,
    ShowStartup,
    /// Reload the startup configuration from the default document.
    LoadDefault,
}

impl FromStr for ScheduleCommand {
    type Err = MeshError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(ScheduleCommand::Install),
            "clearbier" => Ok(ScheduleCommand::ClearFrames),
            "clearshared" => Ok(ScheduleCommand::ClearShared),
            "clearall" => Ok(ScheduleCommand::ClearAll),
            "showrun" => Ok(ScheduleCommand::ShowRunning),
            "showstartup" => Ok(ScheduleCommand::ShowStartup),
            "default" => Ok(ScheduleCommand::LoadDefault),
            _ => Err(MeshError::UnknownCommand {
                input: s.to_string(),
            }),
        }
    }
}

/// What a clear request removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    Frames(FrameSelector),
    SharedSlots,
    All,
}

pub struct MeshController {
    config: MeshConfig,
    topology: Arc<TopologyGraph>,
    propagation: PropagationEngine,
    schedule: Arc<ScheduleManager>,
    multicast: MulticastController,
    routes: RouteResolver,
    discovery: DiscoveryPool,
    rovers: RoverRegistry,
}

impl MeshController {
    /// Builds every component from `config` and loads the startup schedule
    /// from the default document.
    ///
    /// # Errors
    ///
    /// - `MeshError::Configuration` - If the configured default PDR is invalid
    pub fn new(
        config: MeshConfig,
        dispatch: Arc<dyn NetworkDispatch>,
        probe: Arc<dyn RoverProbe>,
    ) -> Result<Self> {
        let topology = Arc::new(
            TopologyGraph::with_default_pdr(config.topology.default_pdr).map_err(|e| {
                MeshError::Configuration {
                    reason: e.to_string(),
                }
            })?,
        );
        Ok(Self::with_topology(config, topology, dispatch, probe))
    }

    /// Builds a controller around an existing topology graph, typically one
    /// shared with a simulated network.
    pub fn with_topology(
        config: MeshConfig,
        topology: Arc<TopologyGraph>,
        dispatch: Arc<dyn NetworkDispatch>,
        probe: Arc<dyn RoverProbe>,
    ) -> Self {
        let policy = DispatchPolicy::from_config(&config.dispatch);
        let propagation =
            PropagationEngine::from_config(Arc::clone(&topology), config.simulation.deterministic_seed);
        let schedule = Arc::new(ScheduleManager::from_config(&config, Arc::clone(&dispatch)));
        let multicast =
            MulticastController::from_config(&config, Arc::clone(&topology), Arc::clone(&dispatch));
        let routes = RouteResolver::new(
            Arc::clone(&topology),
            Arc::clone(&schedule),
            dispatch,
            policy,
            multicast.replication_setting(),
        );
        let discovery = DiscoveryPool::new(probe, &config.discovery);

        schedule.load_startup_config(None);
        tracing::info!(
            dispatch_timeout_ms = policy.response_timeout.as_millis() as u64,
            max_retransmit = policy.max_retransmit,
            discovery_workers = config.discovery.max_workers,
            "Mesh controller ready"
        );

        Self {
            config,
            topology,
            propagation,
            schedule,
            multicast,
            routes,
            discovery,
            rovers: RoverRegistry::new(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyGraph> {
        &self.topology
    }

    pub fn schedule(&self) -> &ScheduleManager {
        &self.schedule
    }

    pub fn multicast(&self) -> &MulticastController {
        &self.multicast
    }

    pub fn propagation(&self) -> &PropagationEngine {
        &self.propagation
    }

    pub fn rovers(&self) -> &RoverRegistry {
        &self.rovers
    }

    // Schedule

    /// # Errors
    ///
    /// - `MeshError::Schedule` - If the install failed in full or in part
    pub async fn install(&self, config: Schedule) -> Result<Schedule> {
        Ok(self.schedule.install(config).await?)
    }

    /// # Errors
    ///
    /// - `MeshError::Schedule` - If the frame is unknown or the network refused a removal
    pub async fn clear(&self, target: ClearTarget) -> Result<Schedule> {
        let running = match target {
            ClearTarget::Frames(selector) => self.schedule.clear_frame(selector).await?,
            ClearTarget::SharedSlots => self.schedule.clear_shared_slots().await?,
            ClearTarget::All => self.schedule.clear_all().await?,
        };
        Ok(running)
    }

    pub fn running(&self) -> Schedule {
        self.schedule.running_frames()
    }

    pub fn startup(&self) -> Schedule {
        self.schedule.startup_config()
    }

    pub fn load_startup_config(&self, supplied: Option<Schedule>) -> StartupSource {
        self.schedule.load_startup_config(supplied)
    }

    pub fn upload_startup_document(&self, text: &str) -> StartupSource {
        self.schedule.upload_startup_document(text)
    }

    /// Runs a schedule command and returns the configuration it affects.
    ///
    /// # Errors
    ///
    /// - `MeshError::Schedule` - If an install or clear failed
    pub async fn schedule_command(&self, command: ScheduleCommand) -> Result<Schedule> {
        let schedule = match command {
            ScheduleCommand::Install => self.schedule.install_startup().await?,
            ScheduleCommand::ClearFrames => self.clear(ClearTarget::Frames(FrameSelector::All)).await?,
            ScheduleCommand::ClearShared => self.clear(ClearTarget::SharedSlots).await?,
            ScheduleCommand::ClearAll => self.clear(ClearTarget::All).await?,
            ScheduleCommand::ShowRunning => self.running(),
            ScheduleCommand::ShowStartup => self.startup(),
            ScheduleCommand::LoadDefault => {
                if let StartupSource::Empty { reason } = self.schedule.load_startup_config(None) {
                    return Err(ScheduleError::ConfigLoad { reason }.into());
                }
                self.startup()
            }
        };
        Ok(schedule)
    }

    // Multicast

    /// # Errors
    ///
    /// - `MeshError::Multicast` - If the bitmap is malformed or was not accepted
    pub async fn set_bitmap(&self, bits: &str) -> Result<Bitmap> {
        Ok(self.multicast.set_bitmap(bits).await?)
    }

    /// # Errors
    ///
    /// - `MeshError::Multicast` - If the forwarding layer did not accept the change
    pub async fn set_multicast(&self, enabled: bool) -> Result<()> {
        Ok(self.multicast.set_multicast_enabled(enabled).await?)
    }

    /// # Errors
    ///
    /// - `MeshError::Multicast` - If the derived bitmap was not accepted
    pub async fn set_auto_bitmap(&self, enabled: bool) -> Result<()> {
        Ok(self.multicast.set_auto_bitmap(enabled).await?)
    }

    pub fn set_path_replication(&self, mode: PathReplication) -> Result<()> {
        Ok(self.multicast.set_path_replication(mode)?)
    }

    /// Parses and applies an operator multicast token such as `autoon`.
    ///
    /// # Errors
    ///
    /// - `MeshError::Multicast` - If the token is unknown or the switch was refused
    pub async fn multicast_command(&self, token: &str) -> Result<MulticastStatus> {
        let command: MulticastCommand = token.parse()?;
        self.multicast.apply(command).await?;
        Ok(self.multicast.status())
    }

    pub fn multicast_status(&self) -> MulticastStatus {
        self.multicast.status()
    }

    // Topology

    pub fn upsert_mote(&self, id: MoteId, lat: f64, lon: f64) -> bool {
        self.topology.upsert_mote(id, lat, lon)
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If an endpoint is unknown or the PDR invalid
    pub fn connect(&self, from: MoteId, to: MoteId, pdr: Option<f64>) -> Result<Link> {
        Ok(self.topology.connect(from, to, pdr)?)
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If the link is missing or the PDR invalid
    pub fn update_link(&self, from: MoteId, to: MoteId, pdr: f64) -> Result<Link> {
        Ok(self.topology.update_link(from, to, pdr)?)
    }

    pub fn disconnect(&self, from: MoteId, to: MoteId) -> bool {
        self.topology.disconnect(from, to)
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If the mote is unknown
    pub fn remove_mote(&self, id: MoteId) -> Result<()> {
        self.topology.remove_mote(id)?;
        Ok(())
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If the mote is unknown
    pub fn toggle_dag_root(&self, id: MoteId) -> Result<bool> {
        Ok(self.topology.toggle_dag_root(id)?)
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If the mote is unknown
    pub fn reset_mote(&self, id: MoteId) -> Result<()> {
        Ok(self.topology.reset_mote(id)?)
    }

    /// Connections as seen by the propagation engine.
    pub fn list_connections(&self) -> Vec<Link> {
        self.propagation.retrieve_connections()
    }

    pub fn export_topology(&self) -> TopologySnapshot {
        self.topology.snapshot()
    }

    /// # Errors
    ///
    /// - `MeshError::Topology` - If either mote is unknown
    pub fn simulate_transmission(&self, from: MoteId, to: MoteId) -> Result<TransmissionOutcome> {
        Ok(self.propagation.transmit(from, to)?)
    }

    // Routing

    /// # Errors
    ///
    /// - `MeshError::Route` - If the destination is unknown or no route exists
    pub async fn resolve_source_route(&self, destination: MoteId) -> Result<ResolvedRoute> {
        Ok(self.routes.resolve_source_route(destination).await?)
    }

    // Rovers

    /// Parses and applies a `command@data` rover instruction.
    ///
    /// # Errors
    ///
    /// - `MeshError::Discovery` - If the command is malformed or cannot apply
    pub fn rover_command(&self, input: &str) -> Result<Vec<crate::discovery::RoverAddr>> {
        let command: RoverCommand = input.parse()?;
        self.rovers.apply(command)?;
        Ok(self.rovers.rovers())
    }

    /// Probes every registered rover and records what they host.
    pub async fn discover_rovers(&self) -> DiscoveryReport {
        let rovers = self.rovers.rovers();
        let report = self.discovery.discover(&rovers).await;
        self.rovers.record(&report);
        report
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ErrorKind;
    use crate::discovery::{PeerOutcome, ProbeRequest};
    use crate::dispatch::DispatchError;
    use crate::dispatch::mock::RecordingDispatch;
    use crate::schedule::{Cell, FrameId, Slotframe};

    struct EchoProbe;

    #[async_trait]
    impl RoverProbe for EchoProbe {
        async fn probe(&self, _request: &ProbeRequest) -> std::result::Result<Vec<String>, DispatchError> {
            Ok(vec!["emulated1".to_string()])
        }
    }

    fn controller() -> MeshController {
        let mut config = MeshConfig::for_testing();
        config.schedule.default_document = "missing-schedule.json".into();
        MeshController::new(config, Arc::new(RecordingDispatch::new()), Arc::new(EchoProbe)).unwrap()
    }

    #[test]
    fn test_schedule_command_tokens() {
        assert_eq!("install".parse::<ScheduleCommand>().unwrap(), ScheduleCommand::Install);
        assert_eq!(
            "clearbier".parse::<ScheduleCommand>().unwrap(),
            ScheduleCommand::ClearFrames
        );
        assert_eq!(
            "default".parse::<ScheduleCommand>().unwrap(),
            ScheduleCommand::LoadDefault
        );
        let error = "reboot".parse::<ScheduleCommand>().unwrap_err();
        assert!(error.is_user_error());
    }

    #[test]
    fn test_invalid_default_pdr_rejected() {
        let mut config = MeshConfig::for_testing();
        config.topology.default_pdr = 2.0;
        let result = MeshController::new(
            config,
            Arc::new(RecordingDispatch::new()),
            Arc::new(EchoProbe),
        );
        assert!(matches!(result, Err(MeshError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_schedule_commands() {
        let controller = controller();
        assert!(controller.startup().is_empty());

        let startup = Schedule::new().with_frame(
            Slotframe::new(FrameId::new(1), 101)
                .unwrap()
                .with_cell(Cell::shared(0, 0))
                .unwrap(),
        );
        controller.load_startup_config(Some(startup.clone()));

        let running = controller
            .schedule_command(ScheduleCommand::Install)
            .await
            .unwrap();
        assert_eq!(running, startup);

        let running = controller
            .schedule_command(ScheduleCommand::ClearAll)
            .await
            .unwrap();
        assert!(running.frame(FrameId::new(1)).unwrap().is_empty());

        let error = controller
            .schedule_command(ScheduleCommand::LoadDefault)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ConfigLoad);
    }

    #[tokio::test]
    async fn test_topology_surface() {
        let controller = controller();
        controller.upsert_mote(MoteId::new(1), 0.0, 0.0);
        controller.upsert_mote(MoteId::new(2), 0.0, 0.0);
        controller
            .connect(MoteId::new(1), MoteId::new(2), Some(0.9))
            .unwrap();

        let connections = controller.list_connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].pdr.value(), 0.9);

        let error = controller
            .connect(MoteId::new(1), MoteId::new(3), None)
            .unwrap_err();
        assert!(error.is_user_error());

        assert!(controller.toggle_dag_root(MoteId::new(1)).unwrap());
        assert_eq!(controller.export_topology().dag_roots, vec![MoteId::new(1)]);
    }

    #[tokio::test]
    async fn test_multicast_tokens() {
        let controller = controller();
        let status = controller.multicast_command("fullpath").await.unwrap();
        assert_eq!(status.replication, PathReplication::Full);

        let error = controller.multicast_command("loud").await.unwrap_err();
        assert!(error.is_user_error());

        let error = controller.set_bitmap("10a").await.unwrap_err();
        assert_eq!(error.user_message(), "Bitmap should only contain 0 and 1");
    }

    #[tokio::test]
    async fn test_rover_discovery() {
        let controller = controller();
        let rovers = controller.rover_command("upload@10.0.0.1,10.0.0.2").unwrap();
        assert_eq!(rovers.len(), 2);

        let report = controller.discover_rovers().await;
        assert_eq!(report.success_count(), 2);
        assert_eq!(
            report.outcome(&"10.0.0.2".parse().unwrap()),
            Some(&PeerOutcome::Discovered(vec!["emulated1@10.0.0.2".to_string()]))
        );

        let error = controller.rover_command("del@10.0.0.1").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }
}
