//! Simulated live network answering dispatched requests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use meshctl_core::dispatch::{DispatchError, NetworkDispatch, RawHop};
use meshctl_core::multicast::{Bitmap, PathReplication};
use meshctl_core::schedule::{Cell, FrameId, SlotOffset};
use meshctl_core::topology::{Eui64, MoteId, TopologyGraph};
use parking_lot::Mutex;

use crate::network::NetworkSimulator;

#[derive(Debug, Default)]
struct NetworkState {
    cells: BTreeMap<FrameId, BTreeSet<Cell>>,
    bitmap: Option<Bitmap>,
    multicast: bool,
    last_replication: Option<PathReplication>,
    messages_lost: usize,
}

#[derive(Debug, Default)]
struct FaultPlan {
    rejected_slots: BTreeSet<(FrameId, SlotOffset)>,
    unresponsive: bool,
    routing_unavailable: bool,
}

/// Mesh network that installs cells and answers route queries.
///
/// Requests travel through a [`NetworkSimulator`]; a lost request is never
/// answered, so the caller's bounded wait decides the outcome. Source routes
/// are computed over the shared topology graph from the DAG root.
pub struct SimulatedNetwork {
    topology: Arc<TopologyGraph>,
    conditions: NetworkSimulator,
    state: Mutex<NetworkState>,
    faults: Mutex<FaultPlan>,
}

impl SimulatedNetwork {
    pub fn new(topology: Arc<TopologyGraph>) -> Self {
        Self::with_conditions(topology, NetworkSimulator::new())
    }

    pub fn with_conditions(topology: Arc<TopologyGraph>, conditions: NetworkSimulator) -> Self {
        Self {
            topology,
            conditions,
            state: Mutex::new(NetworkState::default()),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Motes refuse any cell at this slot of `frame`.
    pub fn reject_slot(&self, frame: FrameId, slot: SlotOffset) {
        self.faults.lock().rejected_slots.insert((frame, slot));
    }

    /// Stops answering every request while set.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.faults.lock().unresponsive = unresponsive;
    }

    /// The routing layer refuses route queries while unavailable.
    pub fn set_routing_available(&self, available: bool) {
        self.faults.lock().routing_unavailable = !available;
    }

    pub fn installed_cells(&self, frame: FrameId) -> Vec<Cell> {
        self.state
            .lock()
            .cells
            .get(&frame)
            .map(|cells| cells.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn installed_cell_count(&self) -> usize {
        self.state.lock().cells.values().map(BTreeSet::len).sum()
    }

    pub fn bitmap(&self) -> Option<Bitmap> {
        self.state.lock().bitmap.clone()
    }

    pub fn multicast_enabled(&self) -> bool {
        self.state.lock().multicast
    }

    pub fn last_replication(&self) -> Option<PathReplication> {
        self.state.lock().last_replication
    }

    pub fn messages_lost(&self) -> usize {
        self.state.lock().messages_lost
    }

    /// Carries one request across the radio. Never returns when the request
    /// is lost or the network is unresponsive.
    async fn exchange(&self, operation: &str) {
        let silent = self.faults.lock().unresponsive;
        if silent {
            tracing::trace!(operation, "Network unresponsive");
            std::future::pending::<()>().await;
        }

        self.conditions.simulate_latency().await;
        if self.conditions.should_drop_packet() {
            self.state.lock().messages_lost += 1;
            tracing::trace!(operation, "Message lost");
            std::future::pending::<()>().await;
        }
    }

    fn check_slot(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        if self
            .faults
            .lock()
            .rejected_slots
            .contains(&(frame, cell.slot_offset))
        {
            return Err(DispatchError::Rejected {
                reason: format!("slot {} of frame {frame} refused", cell.slot_offset),
            });
        }
        Ok(())
    }

    /// Shortest usable path from the DAG root to `destination`.
    fn route_from_root(&self, destination: MoteId) -> Result<Vec<MoteId>, DispatchError> {
        let root = self
            .topology
            .dag_root()
            .ok_or_else(|| DispatchError::Unreachable {
                reason: "no DAG root elected".to_string(),
            })?;

        let mut previous: BTreeMap<MoteId, MoteId> = BTreeMap::new();
        let mut visited = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            if current == destination {
                break;
            }
            let Ok(links) = self.topology.neighbors(current) else {
                continue;
            };
            for link in links.into_iter().filter(|link| link.pdr.is_usable()) {
                if visited.insert(link.to) {
                    previous.insert(link.to, current);
                    queue.push_back(link.to);
                }
            }
        }

        if !visited.contains(&destination) {
            return Ok(Vec::new());
        }
        let mut path = vec![destination];
        let mut current = destination;
        while let Some(hop) = previous.get(&current) {
            path.push(*hop);
            current = *hop;
        }
        path.reverse();
        Ok(path)
    }
}

#[async_trait]
impl NetworkDispatch for SimulatedNetwork {
    async fn add_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        self.exchange("add_cell").await;
        self.check_slot(frame, cell)?;
        self.state.lock().cells.entry(frame).or_default().insert(*cell);
        Ok(())
    }

    async fn remove_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        self.exchange("remove_cell").await;
        self.check_slot(frame, cell)?;
        let mut state = self.state.lock();
        if let Some(cells) = state.cells.get_mut(&frame) {
            cells.remove(cell);
            if cells.is_empty() {
                state.cells.remove(&frame);
            }
        }
        Ok(())
    }

    async fn push_bitmap(&self, bitmap: &Bitmap) -> Result<(), DispatchError> {
        self.exchange("push_bitmap").await;
        self.state.lock().bitmap = Some(bitmap.clone());
        Ok(())
    }

    async fn set_multicast(&self, enabled: bool) -> Result<(), DispatchError> {
        self.exchange("set_multicast").await;
        self.state.lock().multicast = enabled;
        Ok(())
    }

    async fn source_route(
        &self,
        destination: Eui64,
        replication: PathReplication,
    ) -> Result<Vec<RawHop>, DispatchError> {
        self.exchange("source_route").await;
        if self.faults.lock().routing_unavailable {
            return Err(DispatchError::Unreachable {
                reason: "routing layer unavailable".to_string(),
            });
        }
        self.state.lock().last_replication = Some(replication);

        let path = self.route_from_root(destination.mote_id())?;
        Ok(path
            .into_iter()
            .map(|hop| hop.eui64().as_bytes().to_vec())
            .collect())
    }
}
