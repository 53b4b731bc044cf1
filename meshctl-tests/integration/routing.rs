//! Source-route resolution through the simulated routing layer.

use meshctl_core::topology::MoteId;
use meshctl_core::{ErrorKind, PathReplication};
use tempfile::TempDir;

use crate::common::{environment_in, two_cell_schedule};

fn motes(ids: &[u16]) -> Vec<MoteId> {
    ids.iter().copied().map(MoteId::new).collect()
}

#[tokio::test]
async fn test_route_along_line() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 0.9)?;
    let controller = env.controller()?;

    let route = controller.resolve_source_route(MoteId::new(3)).await?;
    assert_eq!(route.destination, MoteId::new(3));
    assert_eq!(route.hops, motes(&[1, 2, 3]));
    assert_eq!(route.unscheduled, motes(&[1, 2, 3]));
    assert_eq!(route.replication, PathReplication::Single);
    Ok(())
}

#[tokio::test]
async fn test_route_reports_unscheduled_hops() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 1.0)?;
    let controller = env.controller()?;
    controller.install(two_cell_schedule()).await?;

    let route = controller.resolve_source_route(MoteId::new(3)).await?;
    assert_eq!(route.unscheduled, motes(&[3]));
    Ok(())
}

#[tokio::test]
async fn test_replication_mode_sent_with_query() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(2, 1.0)?;
    let controller = env.controller()?;

    controller.multicast_command("dualpath").await?;
    let route = controller.resolve_source_route(MoteId::new(2)).await?;
    assert_eq!(route.replication, PathReplication::Dual);
    assert_eq!(env.network.last_replication(), Some(PathReplication::Dual));
    Ok(())
}

#[tokio::test]
async fn test_no_route_cases() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 1.0)?;
    let controller = env.controller()?;

    // Known but isolated mote
    controller.upsert_mote(MoteId::new(9), 1.0, 1.0);
    let error = controller.resolve_source_route(MoteId::new(9)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(error.user_message(), "No route available to mote 9");

    // Routing layer refuses the query
    env.network.set_routing_available(false);
    let error = controller.resolve_source_route(MoteId::new(3)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    env.network.set_routing_available(true);

    // No DAG root elected
    assert!(!controller.toggle_dag_root(MoteId::new(1))?);
    let error = controller.resolve_source_route(MoteId::new(3)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_unknown_destination_rejected_locally() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(2, 1.0)?;
    env.network.set_unresponsive(true);
    let controller = env.controller()?;

    // Rejected before the silent network could time it out
    let started = tokio::time::Instant::now();
    let error = controller.resolve_source_route(MoteId::new(42)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);

    controller.upsert_mote(MoteId::new(9), 1.0, 1.0);
    let error = controller.resolve_source_route(MoteId::new(9)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    controller.connect(MoteId::new(1), MoteId::new(9), Some(0.0))?;
    let error = controller.resolve_source_route(MoteId::new(9)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    assert!(started.elapsed() < controller.config().dispatch.response_timeout);
    Ok(())
}

#[tokio::test]
async fn test_silent_routing_layer_times_out() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(2, 1.0)?;
    env.network.set_unresponsive(true);
    let controller = env.controller()?;

    let error = controller.resolve_source_route(MoteId::new(2)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    Ok(())
}
