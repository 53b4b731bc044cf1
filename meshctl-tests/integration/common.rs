//! Shared fixtures for integration tests.

use std::path::Path;

use meshctl_core::schedule::{Cell, CellType, FrameId, Schedule, Slotframe};
use meshctl_core::topology::MoteId;
use meshctl_sim::SimulationEnvironment;

/// Routes test logs through the libtest writer. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("meshctl_core=debug")
        .with_test_writer()
        .try_init();
}

/// Environment whose default schedule document lives under `dir`.
pub fn environment_in(dir: &Path) -> SimulationEnvironment {
    init_test_tracing();
    let mut env = SimulationEnvironment::new();
    env.config.schedule.default_document = dir.join("schedule.json");
    env
}

/// Frame 1 of length 101 with a shared cell at slot 0 and a dedicated
/// 2->1 cell at slot 5.
pub fn two_cell_schedule() -> Schedule {
    Schedule::new().with_frame(
        Slotframe::new(FrameId::new(1), 101)
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
            .unwrap(),
    )
}

pub const TWO_CELL_DOCUMENT: &str = r#"{
    "1": {"length": 101, "slots": [
        {"slotOffset": 0, "channelOffset": 0, "cellType": "TXRX"},
        {"slotOffset": 5, "channelOffset": 3, "cellType": "TX", "owner": 2, "neighbor": 1}
    ]}
}"#;
