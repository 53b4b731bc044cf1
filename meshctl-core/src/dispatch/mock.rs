//! Recording dispatch for unit tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DispatchError, NetworkDispatch, RawHop};
use crate::multicast::{Bitmap, PathReplication};
use crate::schedule::{Cell, FrameId, SlotOffset};
use crate::topology::{Eui64, MoteId};

/// Request observed by [`RecordingDispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRequest {
    AddCell { frame: FrameId, cell: Cell },
    RemoveCell { frame: FrameId, cell: Cell },
    PushBitmap { bits: String },
    SetMulticast { enabled: bool },
    SourceRoute {
        destination: Eui64,
        replication: PathReplication,
    },
}

/// Mock network that answers immediately and records every request.
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    requests: Mutex<Vec<DispatchRequest>>,
    rejected_slots: Mutex<BTreeSet<(FrameId, SlotOffset)>>,
    routes: Mutex<HashMap<Eui64, Vec<RawHop>>>,
    reject_bitmaps: bool,
    silent: bool,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock that never answers any request.
    pub fn new_with_silent_network() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Creates a mock whose forwarding layer refuses every bitmap.
    pub fn new_with_bitmap_failure() -> Self {
        Self {
            reject_bitmaps: true,
            ..Self::default()
        }
    }

    /// Makes every add or remove touching this slot fail with a rejection.
    pub fn reject_slot(&self, frame: FrameId, slot_offset: SlotOffset) {
        self.rejected_slots.lock().insert((frame, slot_offset));
    }

    /// Answers route queries for `destination` with the given raw hops.
    pub fn set_route(&self, destination: MoteId, hops: Vec<RawHop>) {
        self.routes.lock().insert(destination.eui64(), hops);
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    /// Number of cell installs and removals observed.
    pub fn cell_request_count(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| {
                matches!(
                    request,
                    DispatchRequest::AddCell { .. } | DispatchRequest::RemoveCell { .. }
                )
            })
            .count()
    }

    async fn answer(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        self.requests.lock().push(request);
        if self.silent {
            return std::future::pending().await;
        }
        Ok(())
    }

    fn check_slot(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        if self.rejected_slots.lock().contains(&(frame, cell.slot_offset)) {
            return Err(DispatchError::Rejected {
                reason: format!("slot {} of frame {frame} is locked", cell.slot_offset),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkDispatch for RecordingDispatch {
    async fn add_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        self.answer(DispatchRequest::AddCell { frame, cell: *cell })
            .await?;
        self.check_slot(frame, cell)
    }

    async fn remove_cell(&self, frame: FrameId, cell: &Cell) -> Result<(), DispatchError> {
        self.answer(DispatchRequest::RemoveCell { frame, cell: *cell })
            .await?;
        self.check_slot(frame, cell)
    }

    async fn push_bitmap(&self, bitmap: &Bitmap) -> Result<(), DispatchError> {
        self.answer(DispatchRequest::PushBitmap {
            bits: bitmap.to_string(),
        })
        .await?;
        if self.reject_bitmaps {
            return Err(DispatchError::Rejected {
                reason: "forwarding layer refused bitmap".to_string(),
            });
        }
        Ok(())
    }

    async fn set_multicast(&self, enabled: bool) -> Result<(), DispatchError> {
        self.answer(DispatchRequest::SetMulticast { enabled }).await
    }

    async fn source_route(
        &self,
        destination: Eui64,
        replication: PathReplication,
    ) -> Result<Vec<RawHop>, DispatchError> {
        self.answer(DispatchRequest::SourceRoute {
            destination,
            replication,
        })
        .await?;
        self.routes
            .lock()
            .get(&destination)
            .cloned()
            .ok_or_else(|| DispatchError::Unreachable {
                reason: format!("no routing entry for {destination}"),
            })
    }
}
