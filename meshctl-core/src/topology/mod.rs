//! Connectivity model of the mesh.
//!
//! The [`TopologyGraph`] owns every mote and every directed link between
//! them. All mutations take the graph's write lock exactly once, so a reader
//! never observes a link whose endpoint has already been removed.

pub mod link;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use link::{Link, Pdr};

use crate::ErrorKind;

/// Prefix shared by the EUI-64 of every mote in the network.
pub const EUI64_PREFIX: [u8; 6] = [0x14, 0x15, 0x92, 0xcc, 0x00, 0x00];

/// 16-bit network address of a mote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoteId(u16);

impl MoteId {
    pub const fn new(address: u16) -> Self {
        Self(address)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Full hardware address used when querying the network about this mote.
    pub fn eui64(self) -> Eui64 {
        Eui64::from_mote(self)
    }
}

impl fmt::Display for MoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit extended unique identifier of a mote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Eui64([u8; 8]);

impl Eui64 {
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Builds the EUI-64 of a mote from the network prefix and its address.
    pub fn from_mote(id: MoteId) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&EUI64_PREFIX);
        bytes[6..].copy_from_slice(&id.as_u16().to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Network address carried in the two trailing bytes.
    pub fn mote_id(&self) -> MoteId {
        MoteId::new(u16::from_be_bytes([self.0[6], self.0[7]]))
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.0.iter().map(|byte| hex::encode([*byte])).collect();
        write!(f, "{}", groups.join(":"))
    }
}

/// Geographic position of a mote.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Unsynchronized,
    Synchronized,
}

/// A node of the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mote {
    pub id: MoteId,
    pub location: Location,
    pub dag_root: bool,
    pub sync: SyncStatus,
}

impl Mote {
    fn new(id: MoteId, location: Location) -> Self {
        Self {
            id,
            location,
            dag_root: false,
            sync: SyncStatus::Unsynchronized,
        }
    }
}

/// Errors raised by topology mutations and queries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("Mote {id} is not part of the topology")]
    UnknownMote { id: MoteId },

    #[error("No link from {from} to {to}")]
    LinkNotFound { from: MoteId, to: MoteId },

    #[error("PDR {value} outside [0, 1]")]
    InvalidPdr { value: f64 },

    #[error("Mote {id} cannot link to itself")]
    SelfLink { id: MoteId },
}

impl TopologyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TopologyError::LinkNotFound { .. } => ErrorKind::NotFound,
            TopologyError::UnknownMote { .. }
            | TopologyError::InvalidPdr { .. }
            | TopologyError::SelfLink { .. } => ErrorKind::Validation,
        }
    }
}

/// Serializable export of the whole graph.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub motes: Vec<Mote>,
    pub connections: Vec<Link>,
    #[serde(rename = "DAGrootList")]
    pub dag_roots: Vec<MoteId>,
    pub exported_at: DateTime<Utc>,
}

impl TopologySnapshot {
    /// Suggested file name for a downloaded export.
    pub fn download_filename(&self) -> String {
        format!(
            "topology_data_{}.json",
            self.exported_at.format("%d-%m-%y_%Hh%M")
        )
    }
}

#[derive(Debug, Default)]
struct GraphState {
    motes: BTreeMap<MoteId, Mote>,
    links: BTreeMap<(MoteId, MoteId), Link>,
    generation: u64,
}

impl GraphState {
    fn require_mote(&self, id: MoteId) -> Result<(), TopologyError> {
        if self.motes.contains_key(&id) {
            Ok(())
        } else {
            Err(TopologyError::UnknownMote { id })
        }
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Owning aggregate of all motes and links.
///
/// Links are kept in a map keyed by the ordered `(from, to)` pair, which
/// gives both the "one link per pair" invariant and the stable ordering of
/// every enumeration.
#[derive(Debug)]
pub struct TopologyGraph {
    state: RwLock<GraphState>,
    default_pdr: Pdr,
}

impl Default for TopologyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyGraph {
    /// Creates an empty graph whose default link PDR is 1.0.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            default_pdr: Pdr::PERFECT,
        }
    }

    /// Creates an empty graph with a custom default link PDR.
    ///
    /// # Errors
    ///
    /// - `TopologyError::InvalidPdr` - If the default is outside `[0, 1]`
    pub fn with_default_pdr(default_pdr: f64) -> Result<Self, TopologyError> {
        Ok(Self {
            state: RwLock::new(GraphState::default()),
            default_pdr: Pdr::new(default_pdr)?,
        })
    }

    /// Creates the mote if absent, otherwise moves it. Returns true when the
    /// mote was newly created.
    pub fn upsert_mote(&self, id: MoteId, lat: f64, lon: f64) -> bool {
        let location = Location { lat, lon };
        let mut state = self.state.write();
        match state.motes.get_mut(&id) {
            Some(mote) => {
                mote.location = location;
                false
            }
            None => {
                state.motes.insert(id, Mote::new(id, location));
                state.bump();
                tracing::debug!(mote = %id, "Mote joined topology");
                true
            }
        }
    }

    /// Removes a mote together with every link touching it.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn remove_mote(&self, id: MoteId) -> Result<Mote, TopologyError> {
        let mut state = self.state.write();
        let mote = state
            .motes
            .remove(&id)
            .ok_or(TopologyError::UnknownMote { id })?;
        let before = state.links.len();
        state.links.retain(|_, link| !link.touches(id));
        state.bump();
        tracing::debug!(
            mote = %id,
            links_removed = before - state.links.len(),
            "Mote left topology"
        );
        Ok(mote)
    }

    /// Creates the link, or refreshes its PDR if the pair already exists.
    /// `None` uses the graph's default PDR.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If either endpoint is absent
    /// - `TopologyError::InvalidPdr` - If the PDR is outside `[0, 1]`
    /// - `TopologyError::SelfLink` - If both endpoints are the same mote
    pub fn connect(&self, from: MoteId, to: MoteId, pdr: Option<f64>) -> Result<Link, TopologyError> {
        let pdr = match pdr {
            Some(value) => Pdr::new(value)?,
            None => self.default_pdr,
        };
        if from == to {
            return Err(TopologyError::SelfLink { id: from });
        }

        let mut state = self.state.write();
        state.require_mote(from)?;
        state.require_mote(to)?;

        let link = Link::new(from, to, pdr);
        if state.links.insert(link.key(), link).is_none() {
            state.bump();
        }
        Ok(link)
    }

    /// Changes the PDR of an existing link.
    ///
    /// # Errors
    ///
    /// - `TopologyError::InvalidPdr` - If the PDR is outside `[0, 1]`
    /// - `TopologyError::LinkNotFound` - If the ordered pair has no link
    pub fn update_link(&self, from: MoteId, to: MoteId, pdr: f64) -> Result<Link, TopologyError> {
        let pdr = Pdr::new(pdr)?;
        let mut state = self.state.write();
        let link = state
            .links
            .get_mut(&(from, to))
            .ok_or(TopologyError::LinkNotFound { from, to })?;
        let reachability_changed = link.pdr.is_usable() != pdr.is_usable();
        link.pdr = pdr;
        let updated = *link;
        if reachability_changed {
            state.bump();
        }
        Ok(updated)
    }

    /// Removes the link if present. Returns whether a link was removed.
    pub fn disconnect(&self, from: MoteId, to: MoteId) -> bool {
        let mut state = self.state.write();
        let removed = state.links.remove(&(from, to)).is_some();
        if removed {
            state.bump();
        }
        removed
    }

    /// Flips the DAG root flag of a mote and returns the new value.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn toggle_dag_root(&self, id: MoteId) -> Result<bool, TopologyError> {
        let mut state = self.state.write();
        let mote = state
            .motes
            .get_mut(&id)
            .ok_or(TopologyError::UnknownMote { id })?;
        mote.dag_root = !mote.dag_root;
        let is_root = mote.dag_root;
        state.bump();
        tracing::info!(mote = %id, dag_root = is_root, "Toggled DAG root");
        Ok(is_root)
    }

    /// Sets the DAG root flag of a mote.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn set_dag_root(&self, id: MoteId, dag_root: bool) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        let mote = state
            .motes
            .get_mut(&id)
            .ok_or(TopologyError::UnknownMote { id })?;
        if mote.dag_root != dag_root {
            mote.dag_root = dag_root;
            state.bump();
        }
        Ok(())
    }

    /// Records the synchronization status reported by a mote.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn set_sync_status(&self, id: MoteId, sync: SyncStatus) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        let mote = state
            .motes
            .get_mut(&id)
            .ok_or(TopologyError::UnknownMote { id })?;
        mote.sync = sync;
        Ok(())
    }

    /// Resets a mote: it rejoins unsynchronized, keeping location and role.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn reset_mote(&self, id: MoteId) -> Result<(), TopologyError> {
        self.set_sync_status(id, SyncStatus::Unsynchronized)?;
        tracing::info!(mote = %id, "Reset mote");
        Ok(())
    }

    pub fn mote(&self, id: MoteId) -> Option<Mote> {
        self.state.read().motes.get(&id).cloned()
    }

    pub fn contains_mote(&self, id: MoteId) -> bool {
        self.state.read().motes.contains_key(&id)
    }

    /// All motes in ascending address order.
    pub fn motes(&self) -> Vec<Mote> {
        self.state.read().motes.values().cloned().collect()
    }

    /// The single active DAG root, if exactly one mote is flagged as root.
    pub fn dag_root(&self) -> Option<MoteId> {
        let state = self.state.read();
        let mut roots = state.motes.values().filter(|mote| mote.dag_root);
        match (roots.next(), roots.next()) {
            (Some(root), None) => Some(root.id),
            _ => None,
        }
    }

    /// Every mote currently flagged as DAG root.
    pub fn dag_roots(&self) -> Vec<MoteId> {
        self.state
            .read()
            .motes
            .values()
            .filter(|mote| mote.dag_root)
            .map(|mote| mote.id)
            .collect()
    }

    pub fn link(&self, from: MoteId, to: MoteId) -> Option<Link> {
        self.state.read().links.get(&(from, to)).copied()
    }

    /// Outgoing links of a mote, ordered by destination.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If the mote does not exist
    pub fn neighbors(&self, id: MoteId) -> Result<Vec<Link>, TopologyError> {
        let state = self.state.read();
        state.require_mote(id)?;
        Ok(state
            .links
            .range((id, MoteId::new(u16::MIN))..=(id, MoteId::new(u16::MAX)))
            .map(|(_, link)| *link)
            .collect())
    }

    /// Every link, ordered by `(from, to)`.
    pub fn all_connections(&self) -> Vec<Link> {
        self.state.read().links.values().copied().collect()
    }

    /// Motes reachable from `origin` over links with a non-zero PDR,
    /// including `origin` itself.
    ///
    /// # Errors
    ///
    /// - `TopologyError::UnknownMote` - If `origin` does not exist
    pub fn reachable_from(&self, origin: MoteId) -> Result<BTreeSet<MoteId>, TopologyError> {
        let state = self.state.read();
        state.require_mote(origin)?;

        let mut visited = BTreeSet::from([origin]);
        let mut queue = VecDeque::from([origin]);
        while let Some(current) = queue.pop_front() {
            let outgoing = state
                .links
                .range((current, MoteId::new(u16::MIN))..=(current, MoteId::new(u16::MAX)));
            for (_, link) in outgoing {
                if link.pdr.is_usable() && visited.insert(link.to) {
                    queue.push_back(link.to);
                }
            }
        }
        Ok(visited)
    }

    /// Counter bumped on every membership or connectivity change.
    ///
    /// Location and sync-status updates do not change the generation.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Consistent export of motes, links and roots taken under one lock.
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.read();
        TopologySnapshot {
            motes: state.motes.values().cloned().collect(),
            connections: state.links.values().copied().collect(),
            dag_roots: state
                .motes
                .values()
                .filter(|mote| mote.dag_root)
                .map(|mote| mote.id)
                .collect(),
            exported_at: Utc::now(),
        }
    }
}
