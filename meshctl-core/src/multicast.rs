//! Bit-indexed multicast forwarding control.
//!
//! The controller owns the active forwarding bitmap, the multicast on/off
//! switch and the path-replication mode. Bitmaps are validated locally
//! before anything reaches the network, and the active bitmap only changes
//! after the forwarding layer acknowledged the new one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::ErrorKind;
use crate::config::MeshConfig;
use crate::dispatch::{DispatchError, DispatchPolicy, NetworkDispatch};
use crate::topology::{MoteId, TopologyGraph};

/// Errors from bitmap validation, command parsing and dispatch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MulticastError {
    #[error("Bitmap '{input}' must be a non-empty string of 0 and 1")]
    InvalidBitmapFormat { input: String },

    #[error("Bitmap width {actual} does not match established width {expected}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("Unknown multicast command '{token}'")]
    UnknownCommand { token: String },

    #[error("Forwarding layer dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl MulticastError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MulticastError::InvalidBitmapFormat { .. }
            | MulticastError::WidthMismatch { .. }
            | MulticastError::UnknownCommand { .. } => ErrorKind::Validation,
            MulticastError::Dispatch(e) => e.kind(),
        }
    }
}

/// Fixed-width forwarding bitmap, one position per subscriber branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bitmap {
    bits: Vec<bool>,
}

impl Bitmap {
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn width(&self) -> usize {
        self.bits.len()
    }

    pub fn bit(&self, position: usize) -> Option<bool> {
        self.bits.get(position).copied()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }
}

impl FromStr for Bitmap {
    type Err = MulticastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MulticastError::InvalidBitmapFormat {
            input: s.to_string(),
        };
        if s.is_empty() {
            return Err(invalid());
        }
        let bits = s
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                _ => Err(invalid()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { bits })
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in &self.bits {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// How many disjoint paths the routing layer computes per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathReplication {
    #[default]
    Single,
    Dual,
    Full,
}

impl PathReplication {
    /// Numeric mode understood by the routing layer.
    pub fn as_index(self) -> u8 {
        match self {
            PathReplication::Single => 0,
            PathReplication::Dual => 1,
            PathReplication::Full => 2,
        }
    }
}

/// Operator commands accepted by the multicast controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastCommand {
    Enable,
    Disable,
    AutoBitmapOn,
    AutoBitmapOff,
    Replication(PathReplication),
}

impl FromStr for MulticastCommand {
    type Err = MulticastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(MulticastCommand::Enable),
            "off" => Ok(MulticastCommand::Disable),
            "autoon" => Ok(MulticastCommand::AutoBitmapOn),
            "autooff" => Ok(MulticastCommand::AutoBitmapOff),
            "singlepath" => Ok(MulticastCommand::Replication(PathReplication::Single)),
            "dualpath" => Ok(MulticastCommand::Replication(PathReplication::Dual)),
            "fullpath" => Ok(MulticastCommand::Replication(PathReplication::Full)),
            _ => Err(MulticastError::UnknownCommand {
                token: s.to_string(),
            }),
        }
    }
}

/// Shared handle on the active replication mode.
///
/// The route resolver holds a clone and reads the mode on every query.
#[derive(Debug, Clone, Default)]
pub struct PathReplicationSetting(Arc<RwLock<PathReplication>>);

impl PathReplicationSetting {
    pub fn get(&self) -> PathReplication {
        *self.0.read()
    }

    pub fn set(&self, mode: PathReplication) {
        *self.0.write() = mode;
    }
}

/// Snapshot of the controller for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MulticastStatus {
    pub multicast_enabled: bool,
    pub auto_bitmap: bool,
    pub replication: PathReplication,
    pub bitmap: Option<Bitmap>,
}

#[derive(Debug, Default)]
struct BitmapState {
    active: Option<Bitmap>,
    width: Option<usize>,
    multicast_enabled: bool,
    auto_bitmap: bool,
    /// Bit position of each mote, in order of first appearance.
    positions: Vec<MoteId>,
    /// Graph generation the active bitmap reflects.
    computed_generation: Option<u64>,
}

pub struct MulticastController {
    graph: Arc<TopologyGraph>,
    dispatch: Arc<dyn NetworkDispatch>,
    policy: DispatchPolicy,
    state: RwLock<BitmapState>,
    replication: PathReplicationSetting,
    writer: tokio::sync::Mutex<()>,
}

impl MulticastController {
    pub fn new(
        graph: Arc<TopologyGraph>,
        dispatch: Arc<dyn NetworkDispatch>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            graph,
            dispatch,
            policy,
            state: RwLock::new(BitmapState::default()),
            replication: PathReplicationSetting::default(),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &MeshConfig,
        graph: Arc<TopologyGraph>,
        dispatch: Arc<dyn NetworkDispatch>,
    ) -> Self {
        let controller = Self::new(graph, dispatch, DispatchPolicy::from_config(&config.dispatch));
        controller.state.write().width = config.multicast.bitmap_width;
        controller
    }

    /// Validates and installs an explicit bitmap.
    ///
    /// # Errors
    ///
    /// - `MulticastError::InvalidBitmapFormat` - If `bits` is empty or holds anything but 0 and 1
    /// - `MulticastError::WidthMismatch` - If the width differs from the established one
    /// - `MulticastError::Dispatch` - If the forwarding layer did not accept the bitmap
    pub async fn set_bitmap(&self, bits: &str) -> Result<Bitmap, MulticastError> {
        let bitmap = bits.parse::<Bitmap>().inspect_err(|e| {
            tracing::error!(error = %e, "Rejected bitmap");
        })?;

        let _writer = self.writer.lock().await;
        self.check_width(&bitmap)?;
        self.push(&bitmap).await?;

        let generation = self.graph.generation();
        let mut state = self.state.write();
        state.width.get_or_insert(bitmap.width());
        state.active = Some(bitmap.clone());
        state.computed_generation = Some(generation);
        drop(state);

        tracing::info!(bitmap = %bitmap, "Installed multicast bitmap");
        Ok(bitmap)
    }

    /// Switches bit-indexed forwarding on or off on the network.
    ///
    /// # Errors
    ///
    /// - `MulticastError::Dispatch` - If the forwarding layer did not accept the change
    pub async fn set_multicast_enabled(&self, enabled: bool) -> Result<(), MulticastError> {
        let _writer = self.writer.lock().await;
        let dispatch = self.dispatch.as_ref();
        self.policy
            .run("set_multicast", move || dispatch.set_multicast(enabled))
            .await?;
        self.state.write().multicast_enabled = enabled;
        tracing::info!(enabled, "Multicast forwarding switched");
        Ok(())
    }

    /// Turns automatic bitmap derivation on or off.
    ///
    /// Turning it on while multicast is enabled derives and pushes the
    /// bitmap right away; otherwise the derivation waits for the next send.
    /// Auto mode stays off when the derived bitmap is not accepted.
    ///
    /// # Errors
    ///
    /// - `MulticastError::Dispatch` - If the derived bitmap was not accepted
    pub async fn set_auto_bitmap(&self, enabled: bool) -> Result<(), MulticastError> {
        let _writer = self.writer.lock().await;
        let refresh = enabled && self.state.read().multicast_enabled;
        if refresh {
            self.recompute(self.graph.generation()).await?;
        }

        let mut state = self.state.write();
        state.auto_bitmap = enabled;
        if enabled && !refresh {
            state.computed_generation = None;
        }
        drop(state);

        tracing::info!(enabled, "Automatic bitmap switched");
        Ok(())
    }

    /// Selects the replication mode sent with every route query.
    ///
    /// # Errors
    ///
    /// Never fails today; the result keeps every multicast operation uniform.
    pub fn set_path_replication(&self, mode: PathReplication) -> Result<(), MulticastError> {
        self.replication.set(mode);
        tracing::info!(mode = ?mode, "Path replication changed");
        Ok(())
    }

    pub fn path_replication(&self) -> PathReplication {
        self.replication.get()
    }

    /// Handle shared with the route resolver.
    pub fn replication_setting(&self) -> PathReplicationSetting {
        self.replication.clone()
    }

    pub fn bitmap(&self) -> Option<Bitmap> {
        self.state.read().active.clone()
    }

    pub fn status(&self) -> MulticastStatus {
        let state = self.state.read();
        MulticastStatus {
            multicast_enabled: state.multicast_enabled,
            auto_bitmap: state.auto_bitmap,
            replication: self.replication.get(),
            bitmap: state.active.clone(),
        }
    }

    /// Applies an operator command.
    ///
    /// # Errors
    ///
    /// - `MulticastError::Dispatch` - If an on/off switch or a derived bitmap was not accepted
    pub async fn apply(&self, command: MulticastCommand) -> Result<(), MulticastError> {
        match command {
            MulticastCommand::Enable => self.set_multicast_enabled(true).await,
            MulticastCommand::Disable => self.set_multicast_enabled(false).await,
            MulticastCommand::AutoBitmapOn => self.set_auto_bitmap(true).await,
            MulticastCommand::AutoBitmapOff => self.set_auto_bitmap(false).await,
            MulticastCommand::Replication(mode) => self.set_path_replication(mode),
        }
    }

    /// Bitmap to attach to the next multicast send, or `None` when
    /// multicast is off or no bitmap exists yet.
    ///
    /// With automatic bitmaps on, a topology change since the last
    /// computation triggers a recomputation and push first.
    ///
    /// Bit positions go to motes in order of first appearance, and the
    /// width is fixed by the first bitmap in use, whether configured, set
    /// explicitly or derived. A mote joining after every position is taken
    /// gets no bit and is left out of derived bitmaps.
    ///
    /// # Errors
    ///
    /// - `MulticastError::Dispatch` - If a recomputed bitmap was not accepted
    pub async fn bitmap_for_send(&self) -> Result<Option<Bitmap>, MulticastError> {
        let _writer = self.writer.lock().await;

        let generation = self.graph.generation();
        let (enabled, stale) = {
            let state = self.state.read();
            (
                state.multicast_enabled,
                state.auto_bitmap && state.computed_generation != Some(generation),
            )
        };
        if !enabled {
            return Ok(None);
        }
        if stale {
            self.recompute(generation).await?;
        }
        Ok(self.state.read().active.clone())
    }

    async fn recompute(&self, generation: u64) -> Result<(), MulticastError> {
        let (mut positions, width, active) = {
            let state = self.state.read();
            (state.positions.clone(), state.width, state.active.clone())
        };

        let root = self.graph.dag_root();
        for mote in self.graph.motes() {
            if Some(mote.id) == root || positions.contains(&mote.id) {
                continue;
            }
            if width.is_some_and(|width| positions.len() >= width) {
                tracing::warn!(mote = %mote.id, "No free bitmap position for mote");
                continue;
            }
            positions.push(mote.id);
        }

        let reachable = root
            .and_then(|root| self.graph.reachable_from(root).ok())
            .unwrap_or_default();
        let mut bits: Vec<bool> = positions
            .iter()
            .map(|id| reachable.contains(id))
            .collect();
        if let Some(width) = width {
            bits.resize(width, false);
        }

        if bits.is_empty() {
            let mut state = self.state.write();
            state.positions = positions;
            state.computed_generation = Some(generation);
            return Ok(());
        }

        let bitmap = Bitmap::from_bits(bits);
        if active.as_ref() != Some(&bitmap) {
            self.push(&bitmap).await?;
            tracing::debug!(bitmap = %bitmap, generation, "Recomputed multicast bitmap");
        }

        let mut state = self.state.write();
        state.width.get_or_insert(bitmap.width());
        state.positions = positions;
        state.active = Some(bitmap);
        state.computed_generation = Some(generation);
        Ok(())
    }

    fn check_width(&self, bitmap: &Bitmap) -> Result<(), MulticastError> {
        match self.state.read().width {
            Some(expected) if expected != bitmap.width() => Err(MulticastError::WidthMismatch {
                expected,
                actual: bitmap.width(),
            }),
            _ => Ok(()),
        }
    }

    async fn push(&self, bitmap: &Bitmap) -> Result<(), MulticastError> {
        let dispatch = self.dispatch.as_ref();
        self.policy
            .run("push_bitmap", move || dispatch.push_bitmap(bitmap))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::mock::{DispatchRequest, RecordingDispatch};

    fn controller(dispatch: Arc<RecordingDispatch>) -> (Arc<TopologyGraph>, MulticastController) {
        let graph = Arc::new(TopologyGraph::new());
        let controller = MulticastController::new(
            Arc::clone(&graph),
            dispatch,
            DispatchPolicy::new(Duration::from_millis(20), 0),
        );
        (graph, controller)
    }

    #[test]
    fn test_bitmap_parsing() {
        let bitmap: Bitmap = "101".parse().unwrap();
        assert_eq!(bitmap.width(), 3);
        assert_eq!(bitmap.to_string(), "101");
        assert_eq!(bitmap.count_ones(), 2);
        assert_eq!(bitmap.bit(1), Some(false));

        for bad in ["", "10a", "1 0", "2"] {
            assert!(matches!(
                bad.parse::<Bitmap>(),
                Err(MulticastError::InvalidBitmapFormat { .. })
            ));
        }
    }

    #[test]
    fn test_command_tokens() {
        assert_eq!("on".parse::<MulticastCommand>(), Ok(MulticastCommand::Enable));
        assert_eq!("autooff".parse::<MulticastCommand>(), Ok(MulticastCommand::AutoBitmapOff));
        assert_eq!(
            "dualpath".parse::<MulticastCommand>(),
            Ok(MulticastCommand::Replication(PathReplication::Dual))
        );
        assert!("bier".parse::<MulticastCommand>().is_err());
        assert_eq!(PathReplication::Full.as_index(), 2);
        assert_eq!(PathReplication::default(), PathReplication::Single);
    }

    #[tokio::test]
    async fn test_set_bitmap() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (_, controller) = controller(Arc::clone(&dispatch));

        let bitmap = controller.set_bitmap("101").await.unwrap();
        assert_eq!(bitmap.width(), 3);
        assert_eq!(controller.bitmap().unwrap().to_string(), "101");
        assert_eq!(
            dispatch.requests(),
            vec![DispatchRequest::PushBitmap {
                bits: "101".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_bitmap_never_dispatched() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (_, controller) = controller(Arc::clone(&dispatch));
        controller.set_bitmap("101").await.unwrap();
        dispatch.clear_requests();

        let error = controller.set_bitmap("10a").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(controller.bitmap().unwrap().to_string(), "101");

        let error = controller.set_bitmap("1011").await.unwrap_err();
        assert_eq!(
            error,
            MulticastError::WidthMismatch {
                expected: 3,
                actual: 4
            }
        );
        assert!(dispatch.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_bitmap_keeps_previous() {
        let dispatch = Arc::new(RecordingDispatch::new_with_bitmap_failure());
        let (_, controller) = controller(dispatch);

        let error = controller.set_bitmap("11").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Dispatch);
        assert!(controller.bitmap().is_none());
    }

    #[tokio::test]
    async fn test_auto_bitmap_follows_membership() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (graph, controller) = controller(Arc::clone(&dispatch));
        let root = MoteId::new(1);
        graph.upsert_mote(root, 0.0, 0.0);
        graph.set_dag_root(root, true).unwrap();
        graph.upsert_mote(MoteId::new(2), 0.0, 0.0);
        graph.upsert_mote(MoteId::new(3), 0.0, 0.0);
        graph.connect(root, MoteId::new(2), Some(0.9)).unwrap();

        controller.set_multicast_enabled(true).await.unwrap();
        controller.set_auto_bitmap(true).await.unwrap();
        assert_eq!(controller.bitmap().unwrap().to_string(), "10");

        let bitmap = controller.bitmap_for_send().await.unwrap().unwrap();
        assert_eq!(bitmap.to_string(), "10");

        // Mote 3 becomes reachable; positions do not move
        graph.connect(MoteId::new(2), MoteId::new(3), Some(0.5)).unwrap();
        let bitmap = controller.bitmap_for_send().await.unwrap().unwrap();
        assert_eq!(bitmap.to_string(), "11");

        // No change, no push
        dispatch.clear_requests();
        controller.bitmap_for_send().await.unwrap();
        assert!(dispatch.requests().is_empty());

        // Mote 2 leaves; its position is kept but cleared
        graph.remove_mote(MoteId::new(2)).unwrap();
        let bitmap = controller.bitmap_for_send().await.unwrap().unwrap();
        assert_eq!(bitmap.to_string(), "00");
    }

    #[tokio::test]
    async fn test_late_mote_gets_no_position() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (graph, controller) = controller(dispatch);
        let root = MoteId::new(1);
        graph.upsert_mote(root, 0.0, 0.0);
        graph.set_dag_root(root, true).unwrap();
        graph.upsert_mote(MoteId::new(2), 0.0, 0.0);
        graph.connect(root, MoteId::new(2), Some(1.0)).unwrap();

        controller.set_multicast_enabled(true).await.unwrap();
        controller.set_auto_bitmap(true).await.unwrap();
        assert_eq!(controller.bitmap().unwrap().to_string(), "1");

        graph.upsert_mote(MoteId::new(3), 0.0, 0.0);
        graph.connect(root, MoteId::new(3), Some(1.0)).unwrap();
        let bitmap = controller.bitmap_for_send().await.unwrap().unwrap();
        assert_eq!(bitmap.width(), 1);
        assert_eq!(bitmap.to_string(), "1");
    }

    #[tokio::test]
    async fn test_refused_auto_bitmap_stays_off() {
        let dispatch = Arc::new(RecordingDispatch::new_with_bitmap_failure());
        let (graph, controller) = controller(dispatch);
        let root = MoteId::new(1);
        graph.upsert_mote(root, 0.0, 0.0);
        graph.set_dag_root(root, true).unwrap();
        graph.upsert_mote(MoteId::new(2), 0.0, 0.0);

        // Nothing to push while multicast is off
        controller.set_auto_bitmap(true).await.unwrap();
        controller.set_auto_bitmap(false).await.unwrap();

        controller.set_multicast_enabled(true).await.unwrap();
        let error = controller.set_auto_bitmap(true).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Dispatch);
        assert!(!controller.status().auto_bitmap);
        assert!(controller.bitmap().is_none());

        assert_eq!(controller.set_path_replication(PathReplication::Dual), Ok(()));
        assert_eq!(controller.path_replication(), PathReplication::Dual);
    }

    #[tokio::test]
    async fn test_disabled_multicast_sends_no_bitmap() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (_, controller) = controller(dispatch);
        controller.set_bitmap("1").await.unwrap();
        assert_eq!(controller.bitmap_for_send().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_and_commands() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let (_, controller) = controller(Arc::clone(&dispatch));
        let setting = controller.replication_setting();

        controller.apply(MulticastCommand::Enable).await.unwrap();
        controller.apply(MulticastCommand::AutoBitmapOn).await.unwrap();
        controller
            .apply(MulticastCommand::Replication(PathReplication::Full))
            .await
            .unwrap();

        let status = controller.status();
        assert!(status.multicast_enabled);
        assert!(status.auto_bitmap);
        assert_eq!(status.replication, PathReplication::Full);
        assert_eq!(setting.get(), PathReplication::Full);
        assert_eq!(
            dispatch.requests(),
            vec![DispatchRequest::SetMulticast { enabled: true }]
        );

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["replication"], "full");
    }
}
