//! Schedule lifecycle against the simulated mesh: load, install, clear.

use meshctl_core::schedule::{
    CellType, ClearExtent, FrameId, FrameSelector, FrameState, Schedule, StartupSource,
};
use meshctl_core::{ClearTarget, ErrorKind, ScheduleCommand, ScheduleError, MeshError};
use tempfile::TempDir;

use crate::common::{TWO_CELL_DOCUMENT, environment_in, two_cell_schedule};

#[tokio::test]
async fn test_install_startup_from_default_document() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("schedule.json"), TWO_CELL_DOCUMENT)?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    assert_eq!(controller.startup(), two_cell_schedule());
    assert!(controller.running().is_empty());

    let running = controller.schedule_command(ScheduleCommand::Install).await?;
    assert_eq!(running, two_cell_schedule());
    assert_eq!(controller.running(), controller.startup());
    assert_eq!(env.network.installed_cell_count(), 2);
    assert_eq!(
        controller.schedule().frame_state(FrameId::new(1)),
        FrameState::Installed
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_document_starts_empty() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    assert!(controller.startup().is_empty());

    let error = controller
        .schedule_command(ScheduleCommand::LoadDefault)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ConfigLoad);

    // Writing the document afterwards makes it loadable
    std::fs::write(dir.path().join("schedule.json"), TWO_CELL_DOCUMENT)?;
    let startup = controller.schedule_command(ScheduleCommand::LoadDefault).await?;
    assert_eq!(startup, two_cell_schedule());
    Ok(())
}

#[tokio::test]
async fn test_uploaded_document_replaces_startup() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    assert_eq!(
        controller.upload_startup_document(TWO_CELL_DOCUMENT),
        StartupSource::Supplied
    );
    assert_eq!(controller.startup(), two_cell_schedule());

    let source = controller.upload_startup_document("{not json");
    assert!(matches!(source, StartupSource::Empty { .. }));
    assert!(controller.startup().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reinstall_is_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    controller.install(two_cell_schedule()).await?;
    controller.install(two_cell_schedule()).await?;

    assert_eq!(controller.running(), two_cell_schedule());
    assert_eq!(env.network.installed_cell_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_install_replaces_stale_cells() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;
    controller.install(two_cell_schedule()).await?;

    let next = Schedule::from_json_str(
        r#"{"1": {"length": 101, "slots": [
            {"slotOffset": 7, "channelOffset": 1, "cellType": "RX", "owner": 1, "neighbor": 2}
        ]}}"#,
    )?;
    controller.install(next.clone()).await?;

    assert_eq!(controller.running(), next);
    let installed = env.network.installed_cells(FrameId::new(1));
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].slot_offset, 7);
    assert_eq!(installed[0].cell_type, CellType::Rx);
    Ok(())
}

#[tokio::test]
async fn test_partial_install_keeps_running_config() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.network.reject_slot(FrameId::new(1), 5);
    let controller = env.controller()?;

    let error = controller.install(two_cell_schedule()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::PartialInstall);
    match error {
        MeshError::Schedule(ScheduleError::PartialInstall {
            acknowledged,
            failed,
        }) => {
            assert_eq!(acknowledged.len(), 1);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].change.cell.slot_offset, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(controller.running().is_empty());
    assert_eq!(
        controller.schedule().frame_state(FrameId::new(1)),
        FrameState::Uninstalled
    );
    Ok(())
}

#[tokio::test]
async fn test_silent_network_install_times_out() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.network.set_unresponsive(true);
    let controller = env.controller()?;

    let error = controller.install(two_cell_schedule()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    assert!(controller.running().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_clear_frames_then_shared() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;
    controller.install(two_cell_schedule()).await?;

    let running = controller.schedule_command(ScheduleCommand::ClearFrames).await?;
    let frame = running.frame(FrameId::new(1)).expect("frame kept");
    assert!(frame.cells().all(|cell| cell.cell_type.is_shared()));
    assert_eq!(env.network.installed_cell_count(), 1);
    assert_eq!(
        controller.schedule().frame_state(FrameId::new(1)),
        FrameState::Cleared(ClearExtent::Partial)
    );

    controller.clear(ClearTarget::SharedSlots).await?;
    assert_eq!(env.network.installed_cell_count(), 0);
    assert_eq!(
        controller.schedule().frame_state(FrameId::new(1)),
        FrameState::Cleared(ClearExtent::Full)
    );
    Ok(())
}

#[tokio::test]
async fn test_clear_unknown_frame() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    let error = controller
        .clear(ClearTarget::Frames(FrameSelector::Frame(FrameId::new(9))))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_clear_all_reports_failed_step() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;
    controller.install(two_cell_schedule()).await?;

    env.network.set_unresponsive(true);
    let error = controller.schedule_command(ScheduleCommand::ClearAll).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    assert!(matches!(
        error,
        MeshError::Schedule(ScheduleError::ClearAll {
            frames_cleared: false,
            shared_cleared: false,
            ..
        })
    ));
    assert_eq!(controller.running(), two_cell_schedule());

    env.network.set_unresponsive(false);
    controller.schedule_command(ScheduleCommand::ClearAll).await?;
    assert_eq!(env.network.installed_cell_count(), 0);
    assert_eq!(controller.running().cell_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_installs_serialize() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    let other = Schedule::from_json_str(
        r#"{"2": {"length": 11, "slots": [
            {"slotOffset": 1, "channelOffset": 0, "cellType": "TX", "owner": 3, "neighbor": 1},
            {"slotOffset": 2, "channelOffset": 0, "cellType": "RX", "owner": 1, "neighbor": 3}
        ]}}"#,
    )?;
    let (first, second) = tokio::join!(
        controller.install(two_cell_schedule()),
        controller.install(other.clone())
    );
    first?;
    second?;

    // Whichever install ran last, the network matches the running schedule
    let running = controller.running();
    assert!(running == two_cell_schedule() || running == other);
    let installed: usize = running
        .frame_ids()
        .into_iter()
        .map(|id| env.network.installed_cells(id).len())
        .sum();
    assert_eq!(installed, running.cell_count());
    assert_eq!(env.network.installed_cell_count(), running.cell_count());
    Ok(())
}

#[test]
fn test_unknown_schedule_command() {
    let error = "reboot".parse::<ScheduleCommand>().unwrap_err();
    assert!(error.is_user_error());
    assert_eq!(
        "clearbier".parse::<ScheduleCommand>().unwrap(),
        ScheduleCommand::ClearFrames
    );
}
