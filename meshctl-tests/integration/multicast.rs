//! Multicast bitmap control against the simulated forwarding layer.

use meshctl_core::multicast::Bitmap;
use meshctl_core::topology::MoteId;
use meshctl_core::{ErrorKind, PathReplication};
use tempfile::TempDir;

use crate::common::environment_in;

fn bitmap(bits: &str) -> Bitmap {
    bits.parse().unwrap()
}

#[tokio::test]
async fn test_auto_bitmap_follows_topology() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(4, 1.0)?;
    let controller = env.controller()?;

    controller.multicast_command("on").await?;
    let status = controller.multicast_command("autoon").await?;
    assert!(status.multicast_enabled && status.auto_bitmap);
    assert!(env.network.multicast_enabled());

    let sent = controller.multicast().bitmap_for_send().await?;
    assert_eq!(sent, Some(bitmap("111")));
    assert_eq!(env.network.bitmap(), Some(bitmap("111")));

    // Cutting 2->3 leaves only mote 2 reachable from the root
    assert!(controller.disconnect(MoteId::new(2), MoteId::new(3)));
    let sent = controller.multicast().bitmap_for_send().await?;
    assert_eq!(sent, Some(bitmap("100")));
    assert_eq!(env.network.bitmap(), Some(bitmap("100")));

    // A dead link counts as a cut as well
    controller.connect(MoteId::new(2), MoteId::new(3), None)?;
    controller.update_link(MoteId::new(1), MoteId::new(2), 0.0)?;
    let sent = controller.multicast().bitmap_for_send().await?;
    assert_eq!(sent, Some(bitmap("000")));
    Ok(())
}

#[tokio::test]
async fn test_disabled_multicast_sends_no_bitmap() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 1.0)?;
    let controller = env.controller()?;

    controller.set_bitmap("10").await?;
    assert_eq!(controller.multicast().bitmap_for_send().await?, None);

    controller.set_multicast(true).await?;
    assert_eq!(
        controller.multicast().bitmap_for_send().await?,
        Some(bitmap("10"))
    );
    Ok(())
}

#[tokio::test]
async fn test_explicit_bitmap_validation() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    let error = controller.set_bitmap("10a1").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(error.user_message(), "Bitmap should only contain 0 and 1");
    assert_eq!(env.network.bitmap(), None);

    controller.set_bitmap("1011").await?;
    let error = controller.set_bitmap("10").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(env.network.bitmap(), Some(bitmap("1011")));
    assert_eq!(controller.multicast_status().bitmap, Some(bitmap("1011")));
    Ok(())
}

#[tokio::test]
async fn test_silent_forwarding_layer() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.network.set_unresponsive(true);
    let controller = env.controller()?;

    let error = controller.multicast_command("on").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    assert!(!controller.multicast_status().multicast_enabled);

    let error = controller.set_bitmap("01").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    assert_eq!(controller.multicast_status().bitmap, None);
    Ok(())
}

#[tokio::test]
async fn test_auto_bitmap_refused_when_layer_goes_silent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 1.0)?;
    let controller = env.controller()?;

    controller.set_multicast(true).await?;
    env.network.set_unresponsive(true);
    let error = controller.set_auto_bitmap(true).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
    assert!(!controller.multicast_status().auto_bitmap);

    env.network.set_unresponsive(false);
    controller.set_auto_bitmap(true).await?;
    assert_eq!(env.network.bitmap(), Some(bitmap("11")));
    Ok(())
}

#[tokio::test]
async fn test_replication_commands() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    let controller = env.controller()?;

    assert_eq!(
        controller.multicast_status().replication,
        PathReplication::Single
    );
    controller.set_path_replication(PathReplication::Dual)?;
    assert_eq!(
        controller.multicast_status().replication,
        PathReplication::Dual
    );
    let status = controller.multicast_command("fullpath").await?;
    assert_eq!(status.replication, PathReplication::Full);

    let error = controller.multicast_command("triplepath").await.unwrap_err();
    assert!(error.is_user_error());
    assert_eq!(
        controller.multicast_status().replication,
        PathReplication::Full
    );
    Ok(())
}
