//! Slotframe schedule model and its lifecycle manager.
//!
//! A [`Schedule`] is a set of slotframes, each a fixed-length ring of slots
//! holding sparse cells. The [`ScheduleManager`] keeps the startup and the
//! running configuration apart and is the only place the running
//! configuration changes.

pub mod document;
pub mod manager;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use document::ScheduleDocument;
pub use manager::{
    ClearExtent, FrameSelector, FrameState, ScheduleManager, StartupSource,
};

use crate::ErrorKind;
use crate::dispatch::DispatchError;
use crate::topology::MoteId;

/// Position of a slot inside its slotframe.
pub type SlotOffset = u16;

/// Numeric slotframe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(u16);

impl FrameId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CellType {
    Off,
    Tx,
    Rx,
    /// Contention-based cell any mote may use.
    #[serde(rename = "TXRX")]
    TxRxShared,
    Serial,
}

impl CellType {
    pub fn is_shared(self) -> bool {
        self == CellType::TxRxShared
    }

    /// TX and RX cells reserved for one mote pair.
    pub fn is_dedicated(self) -> bool {
        matches!(self, CellType::Tx | CellType::Rx)
    }
}

/// Owner and neighbor of a dedicated cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MotePair {
    pub owner: MoteId,
    pub neighbor: MoteId,
}

impl MotePair {
    pub fn new(owner: MoteId, neighbor: MoteId) -> Self {
        Self { owner, neighbor }
    }

    pub fn contains(&self, id: MoteId) -> bool {
        self.owner == id || self.neighbor == id
    }

    fn shares_mote_with(&self, other: &MotePair) -> bool {
        self.contains(other.owner) || self.contains(other.neighbor)
    }
}

/// One cell of a slotframe.
///
/// Cells order by slot offset first, which keeps every frame listing in
/// slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub slot_offset: SlotOffset,
    pub channel_offset: u8,
    pub cell_type: CellType,
    pub assignment: Option<MotePair>,
}

impl Cell {
    pub fn new(slot_offset: SlotOffset, channel_offset: u8, cell_type: CellType) -> Self {
        Self {
            slot_offset,
            channel_offset,
            cell_type,
            assignment: None,
        }
    }

    pub fn shared(slot_offset: SlotOffset, channel_offset: u8) -> Self {
        Self::new(slot_offset, channel_offset, CellType::TxRxShared)
    }

    pub fn dedicated(
        slot_offset: SlotOffset,
        channel_offset: u8,
        cell_type: CellType,
        owner: MoteId,
        neighbor: MoteId,
    ) -> Self {
        Self {
            assignment: Some(MotePair::new(owner, neighbor)),
            ..Self::new(slot_offset, channel_offset, cell_type)
        }
    }

    pub fn is_shared(&self) -> bool {
        self.cell_type.is_shared()
    }

    /// Whether both cells claim the same slot for overlapping motes.
    /// An unowned cell claims its slot for every mote.
    pub fn overlaps(&self, other: &Cell) -> bool {
        if self.slot_offset != other.slot_offset {
            return false;
        }
        match (&self.assignment, &other.assignment) {
            (Some(mine), Some(theirs)) => mine.shares_mote_with(theirs),
            _ => true,
        }
    }

    pub fn involves(&self, id: MoteId) -> bool {
        self.assignment.is_some_and(|pair| pair.contains(id))
    }
}

/// Fixed-length ring of slots with a sparse, ordered set of cells.
/// Offsets without a cell are implicitly OFF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slotframe {
    id: FrameId,
    length: u16,
    cells: BTreeSet<Cell>,
}

impl Slotframe {
    /// Creates an empty slotframe.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::ZeroLengthFrame` - If `length` is zero
    pub fn new(id: FrameId, length: u16) -> Result<Self, ScheduleError> {
        if length == 0 {
            return Err(ScheduleError::ZeroLengthFrame { frame: id });
        }
        Ok(Self {
            id,
            length,
            cells: BTreeSet::new(),
        })
    }

    /// Adds a cell after checking its offset and ownership.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::SlotOutOfRange` - If the offset is not below the frame length
    /// - `ScheduleError::SlotConflict` - If the cell duplicates an existing one, or
    ///   both are non-shared and claim the same slot for overlapping motes
    pub fn insert_cell(&mut self, cell: Cell) -> Result<(), ScheduleError> {
        if cell.slot_offset >= self.length {
            return Err(ScheduleError::SlotOutOfRange {
                frame: self.id,
                slot_offset: cell.slot_offset,
                length: self.length,
            });
        }
        let conflicting = self.cells.contains(&cell)
            || (!cell.is_shared()
                && self
                    .cells
                    .iter()
                    .any(|existing| !existing.is_shared() && existing.overlaps(&cell)));
        if conflicting {
            return Err(ScheduleError::SlotConflict {
                frame: self.id,
                slot_offset: cell.slot_offset,
            });
        }
        self.cells.insert(cell);
        Ok(())
    }

    /// Builder-style variant of [`Slotframe::insert_cell`].
    ///
    /// # Errors
    ///
    /// Same as [`Slotframe::insert_cell`].
    pub fn with_cell(mut self, cell: Cell) -> Result<Self, ScheduleError> {
        self.insert_cell(cell)?;
        Ok(self)
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    pub fn contains(&self, cell: &Cell) -> bool {
        self.cells.contains(cell)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn shared_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|cell| cell.is_shared())
    }

    pub fn non_shared_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|cell| !cell.is_shared())
    }

    /// Same frame keeping only its shared cells.
    pub fn without_non_shared(&self) -> Self {
        self.retaining(|cell| cell.is_shared())
    }

    /// Same frame keeping only its non-shared cells.
    pub fn without_shared(&self) -> Self {
        self.retaining(|cell| !cell.is_shared())
    }

    fn retaining(&self, keep: impl Fn(&Cell) -> bool) -> Self {
        Self {
            id: self.id,
            length: self.length,
            cells: self.cells.iter().filter(|cell| keep(cell)).copied().collect(),
        }
    }
}

/// Full set of slotframes, keyed by frame id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleDocument", into = "ScheduleDocument")]
pub struct Schedule {
    frames: BTreeMap<FrameId, Slotframe>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a slotframe.
    pub fn insert_frame(&mut self, frame: Slotframe) -> Option<Slotframe> {
        self.frames.insert(frame.id, frame)
    }

    pub fn with_frame(mut self, frame: Slotframe) -> Self {
        self.insert_frame(frame);
        self
    }

    pub fn frame(&self, id: FrameId) -> Option<&Slotframe> {
        self.frames.get(&id)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Slotframe> {
        self.frames.values()
    }

    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.frames.values().map(|frame| frame.cells.len()).sum()
    }

    /// Whether `mote` owns or neighbors any dedicated cell.
    pub fn schedules_mote(&self, mote: MoteId) -> bool {
        self.frames
            .values()
            .flat_map(|frame| frame.cells.iter())
            .any(|cell| cell.cell_type.is_dedicated() && cell.involves(mote))
    }

    /// Parses a schedule document.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::ConfigLoad` - If the text is not a valid schedule document
    pub fn from_json_str(text: &str) -> Result<Self, ScheduleError> {
        serde_json::from_str(text).map_err(|e| ScheduleError::ConfigLoad {
            reason: e.to_string(),
        })
    }

    /// Reads and parses a schedule document from disk.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::ConfigLoad` - If the file cannot be read or parsed
    pub fn load_from_path(path: &Path) -> Result<Self, ScheduleError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScheduleError::ConfigLoad {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Serializes the schedule in the persisted document format.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::ConfigLoad` - If serialization fails
    pub fn to_json_string(&self) -> Result<String, ScheduleError> {
        serde_json::to_string_pretty(self).map_err(|e| ScheduleError::ConfigLoad {
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
}

/// One cell-level change pushed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellChange {
    pub kind: ChangeKind,
    pub frame: FrameId,
    pub cell: Cell,
}

impl fmt::Display for CellChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
        };
        write!(
            f,
            "{verb} frame {} slot {} channel {}",
            self.frame, self.cell.slot_offset, self.cell.channel_offset
        )
    }
}

/// A change the network did not acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedChange {
    pub change: CellChange,
    pub error: DispatchError,
}

/// Errors from schedule validation and lifecycle operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Slot {slot_offset} outside frame {frame} of length {length}")]
    SlotOutOfRange {
        frame: FrameId,
        slot_offset: SlotOffset,
        length: u16,
    },

    #[error("Slot {slot_offset} of frame {frame} already claimed")]
    SlotConflict {
        frame: FrameId,
        slot_offset: SlotOffset,
    },

    #[error("Frame {frame} has zero length")]
    ZeroLengthFrame { frame: FrameId },

    #[error("Slot {slot_offset} of frame {frame} names an owner without a neighbor or the reverse")]
    IncompleteAssignment {
        frame: FrameId,
        slot_offset: SlotOffset,
    },

    #[error("Frame {frame} is not in the running schedule")]
    FrameNotFound { frame: FrameId },

    #[error("Startup configuration unavailable: {reason}")]
    ConfigLoad { reason: String },

    #[error("{} change(s) acknowledged, {} failed", .acknowledged.len(), .failed.len())]
    PartialInstall {
        acknowledged: Vec<CellChange>,
        failed: Vec<FailedChange>,
    },

    #[error("Network dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Clear all stopped (frames cleared: {frames_cleared}, shared cleared: {shared_cleared}): {source}")]
    ClearAll {
        frames_cleared: bool,
        shared_cleared: bool,
        source: Box<ScheduleError>,
    },
}

impl ScheduleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::SlotOutOfRange { .. }
            | ScheduleError::SlotConflict { .. }
            | ScheduleError::ZeroLengthFrame { .. }
            | ScheduleError::IncompleteAssignment { .. } => ErrorKind::Validation,
            ScheduleError::FrameNotFound { .. } => ErrorKind::NotFound,
            ScheduleError::ConfigLoad { .. } => ErrorKind::ConfigLoad,
            ScheduleError::PartialInstall { .. } => ErrorKind::PartialInstall,
            ScheduleError::Dispatch(e) => e.kind(),
            ScheduleError::ClearAll { source, .. } => source.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mote(id: u16) -> MoteId {
        MoteId::new(id)
    }

    #[test]
    fn test_zero_length_rejected() {
        assert_eq!(
            Slotframe::new(FrameId::new(1), 0),
            Err(ScheduleError::ZeroLengthFrame {
                frame: FrameId::new(1)
            })
        );
    }

    #[test]
    fn test_slot_must_fit_frame() {
        let mut frame = Slotframe::new(FrameId::new(1), 11).unwrap();
        assert!(frame.insert_cell(Cell::shared(10, 0)).is_ok());
        assert!(matches!(
            frame.insert_cell(Cell::shared(11, 0)),
            Err(ScheduleError::SlotOutOfRange { length: 11, .. })
        ));
    }

    #[test]
    fn test_dedicated_overlap_rejected() {
        let mut frame = Slotframe::new(FrameId::new(1), 101).unwrap();
        frame
            .insert_cell(Cell::dedicated(5, 1, CellType::Tx, mote(2), mote(1)))
            .unwrap();

        // Shares mote 2
        let clash = Cell::dedicated(5, 3, CellType::Rx, mote(3), mote(2));
        assert!(matches!(
            frame.insert_cell(clash),
            Err(ScheduleError::SlotConflict { slot_offset: 5, .. })
        ));

        // Disjoint pair on the same slot is fine
        let disjoint = Cell::dedicated(5, 4, CellType::Tx, mote(4), mote(3));
        assert!(frame.insert_cell(disjoint).is_ok());

        // Unowned cell claims the slot for everyone
        assert!(frame.insert_cell(Cell::new(5, 0, CellType::Serial)).is_err());
    }

    #[test]
    fn test_shared_cells_coexist() {
        let mut frame = Slotframe::new(FrameId::new(1), 101).unwrap();
        frame
            .insert_cell(Cell::dedicated(0, 0, CellType::Tx, mote(2), mote(1)))
            .unwrap();
        assert!(frame.insert_cell(Cell::shared(0, 1)).is_ok());
        assert!(frame.insert_cell(Cell::shared(0, 2)).is_ok());
        assert!(frame.insert_cell(Cell::shared(0, 2)).is_err());
        assert_eq!(frame.shared_cells().count(), 2);
    }

    #[test]
    fn test_shared_split() {
        let frame = Slotframe::new(FrameId::new(1), 101)
            .unwrap()
            .with_cell(Cell::shared(0, 0))
            .unwrap()
            .with_cell(Cell::dedicated(5, 3, CellType::Tx, mote(2), mote(1)))
            .unwrap();

        let shared_only = frame.without_non_shared();
        assert_eq!(shared_only.cells().count(), 1);
        assert!(shared_only.cells().all(Cell::is_shared));
        assert_eq!(shared_only.length(), 101);

        let dedicated_only = frame.without_shared();
        assert_eq!(dedicated_only.cells().count(), 1);
        assert!(dedicated_only.cells().all(|cell| !cell.is_shared()));
    }

    #[test]
    fn test_schedules_mote() {
        let schedule = Schedule::new().with_frame(
            Slotframe::new(FrameId::new(1), 101)
                .unwrap()
                .with_cell(Cell::dedicated(5, 3, CellType::Tx, mote(2), mote(1)))
                .unwrap(),
        );
        assert!(schedule.schedules_mote(mote(1)));
        assert!(schedule.schedules_mote(mote(2)));
        assert!(!schedule.schedules_mote(mote(3)));
    }

    #[test]
    fn test_error_kinds() {
        let partial = ScheduleError::PartialInstall {
            acknowledged: vec![],
            failed: vec![],
        };
        assert_eq!(partial.kind(), ErrorKind::PartialInstall);

        let wrapped = ScheduleError::ClearAll {
            frames_cleared: true,
            shared_cleared: false,
            source: Box::new(ScheduleError::Dispatch(DispatchError::Timeout {
                attempts: 2,
                timeout: std::time::Duration::from_millis(10),
            })),
        };
        assert_eq!(wrapped.kind(), ErrorKind::DispatchTimeout);
        assert_eq!(
            ScheduleError::FrameNotFound {
                frame: FrameId::new(9)
            }
            .kind(),
            ErrorKind::NotFound
        );
    }
}
