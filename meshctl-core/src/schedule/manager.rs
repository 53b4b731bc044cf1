//! Install/clear lifecycle of the running schedule.
//!
//! Writers serialize on an async mutex held across their dispatch awaits,
//! while readers take short synchronous read locks and always observe the
//! last committed schedule. A failed operation never commits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;

use super::{
    CellChange, ChangeKind, FailedChange, FrameId, Schedule, ScheduleError, Slotframe,
};
use crate::config::MeshConfig;
use crate::dispatch::{DispatchError, DispatchPolicy, NetworkDispatch};
use crate::topology::MoteId;

/// Where the current startup configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupSource {
    Supplied,
    DefaultDocument,
    /// Nothing usable was available; startup is empty.
    Empty { reason: String },
}

/// Frames addressed by a clear operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSelector {
    All,
    Frame(FrameId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearExtent {
    /// Some cells remain in the frame.
    Partial,
    /// The frame holds no cells.
    Full,
}

/// Lifecycle of a slotframe on the live network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Uninstalled,
    Installed,
    Cleared(ClearExtent),
}

#[derive(Debug, Default)]
struct RunningState {
    schedule: Schedule,
    frame_states: BTreeMap<FrameId, FrameState>,
}

pub struct ScheduleManager {
    dispatch: Arc<dyn NetworkDispatch>,
    policy: DispatchPolicy,
    default_document: PathBuf,
    startup: RwLock<Schedule>,
    running: RwLock<RunningState>,
    writer: tokio::sync::Mutex<()>,
}

impl ScheduleManager {
    pub fn new(
        dispatch: Arc<dyn NetworkDispatch>,
        policy: DispatchPolicy,
        default_document: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dispatch,
            policy,
            default_document: default_document.into(),
            startup: RwLock::new(Schedule::new()),
            running: RwLock::new(RunningState::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &MeshConfig, dispatch: Arc<dyn NetworkDispatch>) -> Self {
        Self::new(
            dispatch,
            DispatchPolicy::from_config(&config.dispatch),
            config.schedule.default_document.clone(),
        )
    }

    pub fn default_document(&self) -> &Path {
        &self.default_document
    }

    /// Replaces the startup configuration.
    ///
    /// A supplied schedule is taken verbatim. Without one the default
    /// document is read; if that fails the startup configuration becomes
    /// empty and the failure is only logged.
    pub fn load_startup_config(&self, supplied: Option<Schedule>) -> StartupSource {
        let (schedule, source) = match supplied {
            Some(schedule) => (schedule, StartupSource::Supplied),
            None => match Schedule::load_from_path(&self.default_document) {
                Ok(schedule) => (schedule, StartupSource::DefaultDocument),
                Err(e) => {
                    tracing::warn!(
                        document = %self.default_document.display(),
                        error = %e,
                        "No default schedule available, starting empty"
                    );
                    (
                        Schedule::new(),
                        StartupSource::Empty {
                            reason: e.to_string(),
                        },
                    )
                }
            },
        };

        tracing::info!(
            source = ?source,
            frames = schedule.frame_ids().len(),
            "Loaded startup schedule"
        );
        *self.startup.write() = schedule;
        source
    }

    /// Replaces the startup configuration with an operator-uploaded
    /// document. A malformed upload leaves the startup configuration empty.
    pub fn upload_startup_document(&self, text: &str) -> StartupSource {
        match Schedule::from_json_str(text) {
            Ok(schedule) => self.load_startup_config(Some(schedule)),
            Err(e) => {
                tracing::error!(error = %e, "Rejected uploaded schedule document");
                *self.startup.write() = Schedule::new();
                StartupSource::Empty {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Declared configuration that has not necessarily been installed.
    pub fn startup_config(&self) -> Schedule {
        self.startup.read().clone()
    }

    /// Copy of the configuration currently installed on the network.
    pub fn running_frames(&self) -> Schedule {
        self.running.read().schedule.clone()
    }

    pub fn frame_state(&self, frame: FrameId) -> FrameState {
        self.running
            .read()
            .frame_states
            .get(&frame)
            .copied()
            .unwrap_or(FrameState::Uninstalled)
    }

    /// Whether `mote` owns or neighbors a dedicated cell in the running schedule.
    pub fn is_scheduled(&self, mote: MoteId) -> bool {
        self.running.read().schedule.schedules_mote(mote)
    }

    /// Pushes `config` to the network and makes it the running configuration.
    ///
    /// Only the difference to the running configuration is dispatched:
    /// stale cells are removed first, then new cells are added.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::PartialInstall` - If some changes were acknowledged and others not
    /// - `ScheduleError::Dispatch` - If no change was acknowledged
    pub async fn install(&self, config: Schedule) -> Result<Schedule, ScheduleError> {
        let _writer = self.writer.lock().await;

        let current = self.running_frames();
        let changes = plan_install(&current, &config);
        tracing::debug!(changes = changes.len(), "Planned schedule install");
        self.apply(changes).await?;

        let mut running = self.running.write();
        for id in current.frame_ids() {
            if config.frame(id).is_none() {
                running.frame_states.insert(id, FrameState::Uninstalled);
            }
        }
        for id in config.frame_ids() {
            running.frame_states.insert(id, FrameState::Installed);
        }
        running.schedule = config.clone();
        drop(running);

        tracing::info!(
            frames = config.frame_ids().len(),
            cells = config.cell_count(),
            "Installed schedule"
        );
        Ok(config)
    }

    /// Installs the current startup configuration.
    ///
    /// # Errors
    ///
    /// Same as [`ScheduleManager::install`].
    pub async fn install_startup(&self) -> Result<Schedule, ScheduleError> {
        let startup = self.startup_config();
        self.install(startup).await
    }

    /// Removes every non-shared cell from the selected frames.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::FrameNotFound` - If a single selected frame is not running
    /// - `ScheduleError::PartialInstall` - If only some removals were acknowledged
    /// - `ScheduleError::Dispatch` - If no removal was acknowledged
    pub async fn clear_frame(&self, selector: FrameSelector) -> Result<Schedule, ScheduleError> {
        let _writer = self.writer.lock().await;
        self.clear_frames_locked(selector).await?;
        Ok(self.running_frames())
    }

    /// Removes every shared cell, leaving dedicated cells untouched.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::PartialInstall` - If only some removals were acknowledged
    /// - `ScheduleError::Dispatch` - If no removal was acknowledged
    pub async fn clear_shared_slots(&self) -> Result<Schedule, ScheduleError> {
        let _writer = self.writer.lock().await;
        self.clear_shared_locked().await?;
        Ok(self.running_frames())
    }

    /// Clears all frames and then all shared slots without letting another
    /// writer in between.
    ///
    /// # Errors
    ///
    /// - `ScheduleError::ClearAll` - Names the steps that completed and wraps the failure
    pub async fn clear_all(&self) -> Result<Schedule, ScheduleError> {
        let _writer = self.writer.lock().await;

        if let Err(e) = self.clear_frames_locked(FrameSelector::All).await {
            return Err(ScheduleError::ClearAll {
                frames_cleared: false,
                shared_cleared: false,
                source: Box::new(e),
            });
        }
        if let Err(e) = self.clear_shared_locked().await {
            return Err(ScheduleError::ClearAll {
                frames_cleared: true,
                shared_cleared: false,
                source: Box::new(e),
            });
        }
        Ok(self.running_frames())
    }

    async fn clear_frames_locked(&self, selector: FrameSelector) -> Result<(), ScheduleError> {
        let current = self.running_frames();
        let targets: Vec<&Slotframe> = match selector {
            FrameSelector::All => current.frames().collect(),
            FrameSelector::Frame(id) => {
                vec![current.frame(id).ok_or(ScheduleError::FrameNotFound { frame: id })?]
            }
        };

        let changes = targets
            .iter()
            .flat_map(|frame| removals(frame, frame.non_shared_cells()))
            .collect();
        self.apply(changes).await?;

        let cleared: Vec<Slotframe> = targets.iter().map(|frame| frame.without_non_shared()).collect();
        self.commit_cleared(cleared);
        tracing::info!(selector = ?selector, "Cleared non-shared cells");
        Ok(())
    }

    async fn clear_shared_locked(&self) -> Result<(), ScheduleError> {
        let current = self.running_frames();
        let targets: Vec<&Slotframe> = current
            .frames()
            .filter(|frame| frame.shared_cells().next().is_some())
            .collect();

        let changes = targets
            .iter()
            .flat_map(|frame| removals(frame, frame.shared_cells()))
            .collect();
        self.apply(changes).await?;

        let cleared: Vec<Slotframe> = targets.iter().map(|frame| frame.without_shared()).collect();
        self.commit_cleared(cleared);
        tracing::info!("Cleared shared cells");
        Ok(())
    }

    fn commit_cleared(&self, frames: Vec<Slotframe>) {
        let mut running = self.running.write();
        for frame in frames {
            let extent = if frame.is_empty() {
                ClearExtent::Full
            } else {
                ClearExtent::Partial
            };
            running
                .frame_states
                .insert(frame.id(), FrameState::Cleared(extent));
            running.schedule.insert_frame(frame);
        }
    }

    /// Dispatches removals, then additions, and sorts the results into
    /// acknowledged and failed changes.
    async fn apply(&self, changes: Vec<CellChange>) -> Result<(), ScheduleError> {
        if changes.is_empty() {
            return Ok(());
        }

        let (removals, additions): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .partition(|change| change.kind == ChangeKind::Remove);

        let mut acknowledged = Vec::new();
        let mut failed = Vec::new();
        for phase in [removals, additions] {
            let results = join_all(phase.iter().map(|change| self.dispatch_change(change))).await;
            for (change, result) in phase.into_iter().zip(results) {
                match result {
                    Ok(()) => acknowledged.push(change),
                    Err(error) => {
                        tracing::debug!(change = %change, error = %error, "Cell change failed");
                        failed.push(FailedChange { change, error });
                    }
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        if acknowledged.is_empty() {
            tracing::warn!(failed = failed.len(), "Network acknowledged no cell change");
            return Err(ScheduleError::Dispatch(failed.swap_remove(0).error));
        }
        tracing::warn!(
            acknowledged = acknowledged.len(),
            failed = failed.len(),
            "Network acknowledged only part of the schedule change"
        );
        Err(ScheduleError::PartialInstall {
            acknowledged,
            failed,
        })
    }

    async fn dispatch_change(&self, change: &CellChange) -> Result<(), DispatchError> {
        let dispatch = self.dispatch.as_ref();
        let frame = change.frame;
        let cell = &change.cell;
        match change.kind {
            ChangeKind::Add => {
                self.policy
                    .run("add_cell", move || dispatch.add_cell(frame, cell))
                    .await
            }
            ChangeKind::Remove => {
                self.policy
                    .run("remove_cell", move || dispatch.remove_cell(frame, cell))
                    .await
            }
        }
    }
}

fn removals<'a>(
    frame: &'a Slotframe,
    cells: impl Iterator<Item = &'a super::Cell> + 'a,
) -> impl Iterator<Item = CellChange> + 'a {
    cells.map(move |cell| CellChange {
        kind: ChangeKind::Remove,
        frame: frame.id(),
        cell: *cell,
    })
}

/// Cell changes turning `current` into `target`.
///
/// A frame whose length changes is torn down and rebuilt.
fn plan_install(current: &Schedule, target: &Schedule) -> Vec<CellChange> {
    let mut changes = Vec::new();

    for frame in current.frames() {
        let kept = target
            .frame(frame.id())
            .filter(|next| next.length() == frame.length());
        for cell in frame.cells() {
            if !kept.is_some_and(|next| next.contains(cell)) {
                changes.push(CellChange {
                    kind: ChangeKind::Remove,
                    frame: frame.id(),
                    cell: *cell,
                });
            }
        }
    }

    for frame in target.frames() {
        let existing = current
            .frame(frame.id())
            .filter(|previous| previous.length() == frame.length());
        for cell in frame.cells() {
            if !existing.is_some_and(|previous| previous.contains(cell)) {
                changes.push(CellChange {
                    kind: ChangeKind::Add,
                    frame: frame.id(),
                    cell: *cell,
                });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::mock::{DispatchRequest, RecordingDispatch};
    use crate::schedule::{Cell, CellType};

    fn frame_id() -> FrameId {
        FrameId::new(1)
    }

    fn sample_schedule() -> Schedule {
        Schedule::new().with_frame(
            Slotframe::new(frame_id(), 101)
                .unwrap()
                .with_cell(Cell::shared(0, 0))
                .unwrap()
                .with_cell(Cell::dedicated(
                    5,
                    3,
                    CellType::Tx,
                    MoteId::new(2),
                    MoteId::new(1),
                ))
                .unwrap()
                .with_cell(Cell::dedicated(
                    6,
                    3,
                    CellType::Rx,
                    MoteId::new(1),
                    MoteId::new(2),
                ))
                .unwrap(),
        )
    }

    fn manager(dispatch: Arc<RecordingDispatch>) -> ScheduleManager {
        ScheduleManager::new(
            dispatch,
            DispatchPolicy::new(Duration::from_millis(20), 0),
            "does-not-exist.json",
        )
    }

    #[tokio::test]
    async fn test_install_round_trip() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let manager = manager(Arc::clone(&dispatch));
        assert_eq!(manager.frame_state(frame_id()), FrameState::Uninstalled);

        let installed = manager.install(sample_schedule()).await.unwrap();

        assert_eq!(installed, sample_schedule());
        assert_eq!(manager.running_frames(), sample_schedule());
        assert_eq!(manager.frame_state(frame_id()), FrameState::Installed);
        assert_eq!(dispatch.cell_request_count(), 3);
        assert!(manager.is_scheduled(MoteId::new(2)));
    }

    #[tokio::test]
    async fn test_install_dispatches_only_the_difference() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let manager = manager(Arc::clone(&dispatch));
        manager.install(sample_schedule()).await.unwrap();
        dispatch.clear_requests();

        let next = Schedule::new().with_frame(
            Slotframe::new(frame_id(), 101)
                .unwrap()
                .with_cell(Cell::shared(0, 0))
                .unwrap()
                .with_cell(Cell::shared(1, 0))
                .unwrap(),
        );
        manager.install(next.clone()).await.unwrap();

        let requests = dispatch.requests();
        assert_eq!(requests.len(), 3);
        // Removals go out before additions
        assert!(matches!(requests[0], DispatchRequest::RemoveCell { .. }));
        assert!(matches!(requests[1], DispatchRequest::RemoveCell { .. }));
        assert_eq!(
            requests[2],
            DispatchRequest::AddCell {
                frame: frame_id(),
                cell: Cell::shared(1, 0)
            }
        );
        assert_eq!(manager.running_frames(), next);
    }

    #[tokio::test]
    async fn test_partial_install_keeps_prior_running() {
        let dispatch = Arc::new(RecordingDispatch::new());
        dispatch.reject_slot(frame_id(), 5);
        let manager = manager(Arc::clone(&dispatch));

        let error = manager.install(sample_schedule()).await.unwrap_err();

        match error {
            ScheduleError::PartialInstall {
                acknowledged,
                failed,
            } => {
                assert_eq!(acknowledged.len(), 2);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].change.cell.slot_offset, 5);
                assert!(matches!(failed[0].error, DispatchError::Rejected { .. }));
            }
            other => panic!("expected partial install, got {other:?}"),
        }
        assert!(manager.running_frames().is_empty());
        assert_eq!(manager.frame_state(frame_id()), FrameState::Uninstalled);
    }

    #[tokio::test]
    async fn test_silent_network_is_total_failure() {
        let dispatch = Arc::new(RecordingDispatch::new_with_silent_network());
        let manager = manager(dispatch);

        let error = manager.install(sample_schedule()).await.unwrap_err();

        assert!(matches!(
            error,
            ScheduleError::Dispatch(DispatchError::Timeout { attempts: 1, .. })
        ));
        assert!(manager.running_frames().is_empty());
    }

    #[tokio::test]
    async fn test_clear_lifecycle() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let manager = manager(Arc::clone(&dispatch));
        manager.install(sample_schedule()).await.unwrap();

        let running = manager
            .clear_frame(FrameSelector::Frame(frame_id()))
            .await
            .unwrap();
        let frame = running.frame(frame_id()).unwrap();
        assert_eq!(frame.non_shared_cells().count(), 0);
        assert_eq!(frame.shared_cells().count(), 1);
        assert_eq!(
            manager.frame_state(frame_id()),
            FrameState::Cleared(ClearExtent::Partial)
        );

        let running = manager.clear_shared_slots().await.unwrap();
        assert!(running.frame(frame_id()).unwrap().is_empty());
        assert_eq!(
            manager.frame_state(frame_id()),
            FrameState::Cleared(ClearExtent::Full)
        );
    }

    #[tokio::test]
    async fn test_clear_unknown_frame() {
        let manager = manager(Arc::new(RecordingDispatch::new()));
        assert_eq!(
            manager
                .clear_frame(FrameSelector::Frame(FrameId::new(9)))
                .await,
            Err(ScheduleError::FrameNotFound {
                frame: FrameId::new(9)
            })
        );
    }

    #[tokio::test]
    async fn test_clear_all_reports_failed_step() {
        let dispatch = Arc::new(RecordingDispatch::new());
        let manager = manager(Arc::clone(&dispatch));
        manager.install(sample_schedule()).await.unwrap();
        dispatch.reject_slot(frame_id(), 0);

        let error = manager.clear_all().await.unwrap_err();

        match error {
            ScheduleError::ClearAll {
                frames_cleared,
                shared_cleared,
                source,
            } => {
                assert!(frames_cleared);
                assert!(!shared_cleared);
                assert!(matches!(*source, ScheduleError::Dispatch(_)));
            }
            other => panic!("expected clear all failure, got {other:?}"),
        }
        let running = manager.running_frames();
        let frame = running.frame(frame_id()).unwrap();
        assert_eq!(frame.non_shared_cells().count(), 0);
        assert_eq!(frame.shared_cells().count(), 1);
    }

    #[test]
    fn test_startup_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, sample_schedule().to_json_string().unwrap()).unwrap();

        let dispatch = Arc::new(RecordingDispatch::new());
        let manager = ScheduleManager::new(dispatch, DispatchPolicy::default(), &path);

        assert_eq!(manager.load_startup_config(None), StartupSource::DefaultDocument);
        assert_eq!(manager.startup_config(), sample_schedule());

        assert_eq!(
            manager.load_startup_config(Some(Schedule::new())),
            StartupSource::Supplied
        );
        assert!(manager.startup_config().is_empty());

        std::fs::write(&path, "{ broken").unwrap();
        assert!(matches!(
            manager.load_startup_config(None),
            StartupSource::Empty { .. }
        ));
        assert!(manager.startup_config().is_empty());
    }

    #[test]
    fn test_missing_default_document_is_not_an_error() {
        let manager = manager(Arc::new(RecordingDispatch::new()));
        assert!(matches!(
            manager.load_startup_config(None),
            StartupSource::Empty { .. }
        ));
    }

    #[tokio::test]
    async fn test_startup_independent_of_running() {
        let manager = manager(Arc::new(RecordingDispatch::new()));
        manager.load_startup_config(Some(sample_schedule()));
        manager.install_startup().await.unwrap();

        assert!(matches!(
            manager.upload_startup_document("[1, 2"),
            StartupSource::Empty { .. }
        ));
        assert!(manager.startup_config().is_empty());
        assert_eq!(manager.running_frames(), sample_schedule());
    }

    #[test]
    fn test_plan_rebuilds_resized_frame() {
        let current = sample_schedule();
        let resized = Schedule::new().with_frame(
            Slotframe::new(frame_id(), 11)
                .unwrap()
                .with_cell(Cell::shared(0, 0))
                .unwrap(),
        );
        let changes = plan_install(&current, &resized);
        let removals = changes
            .iter()
            .filter(|change| change.kind == ChangeKind::Remove)
            .count();
        assert_eq!(removals, 3);
        assert_eq!(changes.len(), 4);
    }
}
