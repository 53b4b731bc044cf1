//! Property checks on the topology graph and propagation engine under
//! arbitrary edit sequences.

use std::sync::Arc;

use meshctl_core::propagation::{PropagationEngine, TransmissionOutcome};
use meshctl_core::topology::{MoteId, TopologyGraph};
use proptest::prelude::*;
use tempfile::TempDir;

use crate::common::environment_in;

#[derive(Debug, Clone)]
enum Edit {
    Upsert(u16),
    Remove(u16),
    Connect(u16, u16, f64),
    Update(u16, u16, f64),
    Disconnect(u16, u16),
    ToggleRoot(u16),
}

fn edit() -> impl Strategy<Value = Edit> {
    let id = 0u16..8;
    let pdr = prop_oneof![Just(0.0), Just(1.0), 0.0f64..=1.0];
    prop_oneof![
        id.clone().prop_map(Edit::Upsert),
        id.clone().prop_map(Edit::Remove),
        (id.clone(), id.clone(), pdr.clone()).prop_map(|(a, b, p)| Edit::Connect(a, b, p)),
        (id.clone(), id.clone(), pdr).prop_map(|(a, b, p)| Edit::Update(a, b, p)),
        (id.clone(), id.clone()).prop_map(|(a, b)| Edit::Disconnect(a, b)),
        id.prop_map(Edit::ToggleRoot),
    ]
}

fn apply(graph: &TopologyGraph, edit: &Edit) {
    // Failed edits are expected and must leave the graph consistent
    match *edit {
        Edit::Upsert(id) => {
            graph.upsert_mote(MoteId::new(id), 0.0, 0.0);
        }
        Edit::Remove(id) => {
            let _ = graph.remove_mote(MoteId::new(id));
        }
        Edit::Connect(a, b, pdr) => {
            let _ = graph.connect(MoteId::new(a), MoteId::new(b), Some(pdr));
        }
        Edit::Update(a, b, pdr) => {
            let _ = graph.update_link(MoteId::new(a), MoteId::new(b), pdr);
        }
        Edit::Disconnect(a, b) => {
            graph.disconnect(MoteId::new(a), MoteId::new(b));
        }
        Edit::ToggleRoot(id) => {
            let _ = graph.toggle_dag_root(MoteId::new(id));
        }
    }
}

proptest! {
    #[test]
    fn links_always_join_existing_motes(edits in prop::collection::vec(edit(), 0..64)) {
        let graph = TopologyGraph::new();
        let mut generation = graph.generation();
        for edit in &edits {
            apply(&graph, edit);
            prop_assert!(graph.generation() >= generation);
            generation = graph.generation();

            for link in graph.all_connections() {
                prop_assert_ne!(link.from, link.to);
                prop_assert!(graph.contains_mote(link.from));
                prop_assert!(graph.contains_mote(link.to));
            }
        }
    }

    #[test]
    fn reachability_stays_inside_the_graph(edits in prop::collection::vec(edit(), 0..64)) {
        let graph = TopologyGraph::new();
        for edit in &edits {
            apply(&graph, edit);
        }
        for mote in graph.motes() {
            let reachable = graph.reachable_from(mote.id).unwrap();
            prop_assert!(reachable.contains(&mote.id));
            for id in reachable {
                prop_assert!(graph.contains_mote(id));
            }
        }
    }

    #[test]
    fn certain_links_are_deterministic(seed in any::<u64>(), usable in any::<bool>()) {
        let graph = Arc::new(TopologyGraph::new());
        graph.upsert_mote(MoteId::new(1), 0.0, 0.0);
        graph.upsert_mote(MoteId::new(2), 0.0, 0.0);
        let pdr = if usable { 1.0 } else { 0.0 };
        graph.connect(MoteId::new(1), MoteId::new(2), Some(pdr)).unwrap();

        let engine = PropagationEngine::seeded(Arc::clone(&graph), seed);
        let expected = if usable {
            TransmissionOutcome::Delivered
        } else {
            TransmissionOutcome::Lost
        };
        for _ in 0..16 {
            prop_assert_eq!(engine.transmit(MoteId::new(1), MoteId::new(2)).unwrap(), expected);
        }
        prop_assert_eq!(
            engine.transmit(MoteId::new(2), MoteId::new(1)).unwrap(),
            TransmissionOutcome::NoLink
        );
    }
}

#[test]
fn test_same_seed_same_transmissions() {
    let graph = Arc::new(TopologyGraph::new());
    for id in 1..=3 {
        graph.upsert_mote(MoteId::new(id), 0.0, 0.0);
    }
    graph.connect(MoteId::new(1), MoteId::new(2), Some(0.5)).unwrap();
    graph.connect(MoteId::new(1), MoteId::new(3), Some(0.3)).unwrap();

    let run = || {
        let engine = PropagationEngine::seeded(Arc::clone(&graph), 99);
        (0..32)
            .map(|_| engine.broadcast(MoteId::new(1)).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[tokio::test]
async fn test_topology_export_through_controller() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let env = environment_in(dir.path());
    env.add_line(3, 0.75)?;
    let controller = env.controller()?;

    controller.remove_mote(MoteId::new(3))?;
    let connections = controller.list_connections();
    assert_eq!(connections.len(), 2);
    assert!(connections.iter().all(|link| !link.touches(MoteId::new(3))));

    let snapshot = controller.export_topology();
    let json = serde_json::to_value(&snapshot)?;
    assert_eq!(json["DAGrootList"], serde_json::json!([1]));
    assert_eq!(json["motes"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["connections"][0]["pdr"], serde_json::json!(0.75));
    assert!(snapshot.download_filename().ends_with(".json"));

    let error = controller.remove_mote(MoteId::new(3)).unwrap_err();
    assert_eq!(error.kind(), meshctl_core::ErrorKind::Validation);
    Ok(())
}
