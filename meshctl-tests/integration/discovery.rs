//! Rover discovery rounds against simulated rovers.

use std::time::Duration;

use meshctl_core::discovery::{PeerOutcome, RoverAddr};
use meshctl_core::config::DiscoveryConfig;
use meshctl_core::{DispatchPolicy, ErrorKind};
use meshctl_sim::SimulationEnvironment;
use tempfile::TempDir;

use crate::common::environment_in;

fn upload_command(rovers: &[RoverAddr]) -> String {
    let list: Vec<String> = rovers.iter().map(ToString::to_string).collect();
    format!("upload@{}", list.join(","))
}

#[tokio::test]
async fn test_concurrent_rounds_stay_bounded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut env = environment_in(dir.path());
    env.config.discovery.max_workers = DiscoveryConfig::default().max_workers;
    let silent = env.add_unresponsive_rovers(3);
    let answering = env.add_responsive_rovers(1, 2, Duration::from_millis(5));
    let controller = env.controller()?;

    let mut all = silent.clone();
    all.extend(&answering);
    controller.rover_command(&upload_command(&all))?;

    let discovery = &controller.config().discovery;
    let max_wait =
        DispatchPolicy::new(discovery.response_timeout, discovery.max_retransmit).max_wait();

    let started = tokio::time::Instant::now();
    let (first, second) =
        futures::future::join(controller.discover_rovers(), controller.discover_rovers()).await;
    let elapsed = started.elapsed();

    for report in [&first, &second] {
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.timeout_count(), 3);
    }
    assert!(
        elapsed < max_wait + Duration::from_millis(50),
        "discovery took {elapsed:?}, budget {max_wait:?}"
    );
    assert!(env.rovers.peak_in_flight() <= 2 * discovery.max_workers);

    let motes = controller.rovers().motes_of(&answering[0]).unwrap();
    assert_eq!(
        motes,
        vec![
            format!("mote0@{}", answering[0]),
            format!("mote1@{}", answering[0]),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_worker_pool_limits_in_flight_probes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut env = environment_in(dir.path());
    env.config.discovery.max_workers = 2;
    env.config.discovery.max_retransmit = 0;
    let silent = env.add_unresponsive_rovers(4);
    let controller = env.controller()?;
    controller.rover_command(&upload_command(&silent))?;

    let timeout = controller.config().discovery.response_timeout;
    let started = tokio::time::Instant::now();
    let report = controller.discover_rovers().await;
    let elapsed = started.elapsed();

    assert_eq!(report.timeout_count(), 4);
    assert_eq!(env.rovers.peak_in_flight(), 2);
    assert!(env.rovers.probe_count() >= 2);
    // Rovers still waiting for a worker expire with the round
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout * 2, "discovery took {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn test_probe_payload_and_failures() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut env = environment_in(dir.path());
    env.config.discovery.controller_address = "fd00::1".to_string();
    env.config.discovery.rover_port = 5683;
    let refusing = env.add_refusing_rovers(1);
    let controller = env.controller()?;
    controller.rover_command(&format!("add@{}", refusing[0]))?;

    let report = controller.discover_rovers().await;
    assert!(matches!(
        report.outcome(&refusing[0]),
        Some(PeerOutcome::Failed { .. })
    ));
    assert_eq!(
        env.rovers.received_payloads(),
        vec![format!("fd00::1;5683;{}", refusing[0])]
    );
    // Refusals are not retried
    assert_eq!(env.rovers.probe_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_registry_commands() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut env = environment_in(dir.path());
    let answering = env.add_responsive_rovers(1, 1, Duration::ZERO);
    let rover = answering[0];
    let controller = env.controller()?;

    let listed = tokio_test::assert_ok!(controller.rover_command(&format!("add@{rover}")));
    assert_eq!(listed, vec![rover]);
    controller.discover_rovers().await;

    // Still hosting motes
    let error = controller.rover_command(&format!("del@{rover}")).unwrap_err();
    assert!(error.to_string().contains(&rover.to_string()));

    controller.rover_command(&format!("disconn@{rover}"))?;
    let listed = controller.rover_command(&format!("del@{rover}"))?;
    assert!(listed.is_empty());

    let error = controller.rover_command(&format!("del@{rover}")).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);

    let error = controller.rover_command("reboot@10.0.0.1").unwrap_err();
    assert!(error.is_user_error());
    Ok(())
}

#[test]
fn test_default_environment_has_no_rovers() {
    let env = SimulationEnvironment::new();
    assert_eq!(env.rovers.probe_count(), 0);
    assert!(env.topology.motes().is_empty());
}
