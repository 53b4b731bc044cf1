//! Source-route queries against the live network's routing table.

use std::sync::Arc;

use serde::Serialize;

use crate::ErrorKind;
use crate::dispatch::{DispatchError, DispatchPolicy, NetworkDispatch, RawHop};
use crate::multicast::{PathReplication, PathReplicationSetting};
use crate::schedule::ScheduleManager;
use crate::topology::{MoteId, TopologyGraph};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("Mote {id} is not part of the topology")]
    UnknownMote { id: MoteId },

    #[error("No route available to mote {destination}")]
    NoRouteAvailable { destination: MoteId },

    #[error("Route query failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl RouteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::UnknownMote { .. } => ErrorKind::Validation,
            RouteError::NoRouteAvailable { .. } => ErrorKind::NotFound,
            RouteError::Dispatch(e) => e.kind(),
        }
    }
}

/// Path from the DAG root to a destination, one mote per hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRoute {
    pub destination: MoteId,
    pub hops: Vec<MoteId>,
    /// Hops owning no dedicated cell in the running schedule.
    pub unscheduled: Vec<MoteId>,
    pub replication: PathReplication,
}

pub struct RouteResolver {
    graph: Arc<TopologyGraph>,
    schedule: Arc<ScheduleManager>,
    dispatch: Arc<dyn NetworkDispatch>,
    policy: DispatchPolicy,
    replication: PathReplicationSetting,
}

impl RouteResolver {
    pub fn new(
        graph: Arc<TopologyGraph>,
        schedule: Arc<ScheduleManager>,
        dispatch: Arc<dyn NetworkDispatch>,
        policy: DispatchPolicy,
        replication: PathReplicationSetting,
    ) -> Self {
        Self {
            graph,
            schedule,
            dispatch,
            policy,
            replication,
        }
    }

    /// Asks the network for the current path to `destination`.
    ///
    /// The query is only dispatched when the topology has a single DAG root
    /// and the destination is reachable from it over usable links. The
    /// destination is addressed by its EUI-64 and the active replication
    /// mode travels with the query. A response that does not run from the
    /// root to the destination is treated as no route.
    ///
    /// # Errors
    ///
    /// - `RouteError::UnknownMote` - If the destination is not in the topology
    /// - `RouteError::NoRouteAvailable` - If there is no root, the destination is unreachable, or the network returns no usable path
    /// - `RouteError::Dispatch` - If the routing query timed out
    pub async fn resolve_source_route(&self, destination: MoteId) -> Result<ResolvedRoute, RouteError> {
        if !self.graph.contains_mote(destination) {
            return Err(RouteError::UnknownMote { id: destination });
        }
        let no_route = RouteError::NoRouteAvailable { destination };
        let root = self.graph.dag_root().ok_or_else(|| no_route.clone())?;
        let reachable = self
            .graph
            .reachable_from(root)
            .map_err(|_| no_route.clone())?;
        if !reachable.contains(&destination) {
            tracing::debug!(destination = %destination, root = %root, "Destination unreachable from root");
            return Err(no_route);
        }

        let replication = self.replication.get();
        let eui64 = destination.eui64();
        let dispatch = self.dispatch.as_ref();
        let raw = match self
            .policy
            .run("source_route", move || dispatch.source_route(eui64, replication))
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.is_timeout() => return Err(RouteError::Dispatch(e)),
            Err(e) => {
                tracing::debug!(destination = %destination, error = %e, "Routing layer refused query");
                return Err(no_route);
            }
        };

        let hops = simplify_hops(&raw).ok_or_else(|| no_route.clone())?;
        if hops.first() != Some(&root) || hops.last() != Some(&destination) {
            tracing::debug!(destination = %destination, hops = ?hops, "Route does not run from root to destination");
            return Err(no_route);
        }

        let unscheduled = hops
            .iter()
            .copied()
            .filter(|hop| !self.schedule.is_scheduled(*hop))
            .collect();

        tracing::debug!(destination = %destination, hops = ?hops, "Resolved source route");
        Ok(ResolvedRoute {
            destination,
            hops,
            unscheduled,
            replication,
        })
    }
}

/// Converts raw hops into one mote id per hop.
///
/// A single-byte hop is the address itself; longer hops carry the 16-bit
/// address in their last two bytes. Repeated consecutive hops collapse.
/// Returns `None` for an empty route or an empty hop.
pub fn simplify_hops(raw: &[RawHop]) -> Option<Vec<MoteId>> {
    if raw.is_empty() {
        return None;
    }
    let mut hops = raw
        .iter()
        .map(|hop| match hop.as_slice() {
            [] => None,
            [address] => Some(MoteId::new(u16::from(*address))),
            [.., high, low] => Some(MoteId::new(u16::from_be_bytes([*high, *low]))),
        })
        .collect::<Option<Vec<_>>>()?;
    hops.dedup();
    Some(hops)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::mock::{DispatchRequest, RecordingDispatch};
    use crate::schedule::{Cell, CellType, FrameId, Schedule, Slotframe};

    struct Fixture {
        graph: Arc<TopologyGraph>,
        dispatch: Arc<RecordingDispatch>,
        schedule: Arc<ScheduleManager>,
        resolver: RouteResolver,
        replication: PathReplicationSetting,
    }

    fn fixture(dispatch: RecordingDispatch) -> Fixture {
        let graph = Arc::new(TopologyGraph::new());
        let dispatch = Arc::new(dispatch);
        let policy = DispatchPolicy::new(Duration::from_millis(20), 1);
        let schedule = Arc::new(ScheduleManager::new(
            Arc::clone(&dispatch) as Arc<dyn NetworkDispatch>,
            policy,
            "unused.json",
        ));
        let replication = PathReplicationSetting::default();
        let resolver = RouteResolver::new(
            Arc::clone(&graph),
            Arc::clone(&schedule),
            Arc::clone(&dispatch) as Arc<dyn NetworkDispatch>,
            policy,
            replication.clone(),
        );
        for id in [1, 2, 3, 4] {
            graph.upsert_mote(MoteId::new(id), 0.0, 0.0);
        }
        graph.set_dag_root(MoteId::new(1), true).unwrap();
        graph.connect(MoteId::new(1), MoteId::new(2), Some(0.9)).unwrap();
        graph.connect(MoteId::new(2), MoteId::new(3), Some(0.9)).unwrap();
        Fixture {
            graph,
            dispatch,
            schedule,
            resolver,
            replication,
        }
    }

    fn eui_hop(id: u16) -> RawHop {
        MoteId::new(id).eui64().as_bytes().to_vec()
    }

    #[test]
    fn test_simplify_hops() {
        assert_eq!(simplify_hops(&[]), None);
        assert_eq!(simplify_hops(&[vec![]]), None);
        assert_eq!(
            simplify_hops(&[vec![1], eui_hop(0x0102), eui_hop(0x0102), vec![0, 3]]),
            Some(vec![MoteId::new(1), MoteId::new(0x0102), MoteId::new(3)])
        );
    }

    #[tokio::test]
    async fn test_route_to_neighbor() {
        let fixture = fixture(RecordingDispatch::new());
        fixture
            .dispatch
            .set_route(MoteId::new(2), vec![eui_hop(1), eui_hop(2)]);

        let route = fixture
            .resolver
            .resolve_source_route(MoteId::new(2))
            .await
            .unwrap();

        assert_eq!(route.hops, vec![MoteId::new(1), MoteId::new(2)]);
        assert_eq!(route.unscheduled, route.hops);
        assert_eq!(
            fixture.dispatch.requests(),
            vec![DispatchRequest::SourceRoute {
                destination: MoteId::new(2).eui64(),
                replication: PathReplication::Single,
            }]
        );
    }

    #[tokio::test]
    async fn test_replication_travels_with_query() {
        let fixture = fixture(RecordingDispatch::new());
        fixture.dispatch.set_route(MoteId::new(2), vec![vec![1], vec![2]]);
        fixture.replication.set(PathReplication::Dual);

        let route = fixture
            .resolver
            .resolve_source_route(MoteId::new(2))
            .await
            .unwrap();
        assert_eq!(route.replication, PathReplication::Dual);
    }

    #[tokio::test]
    async fn test_unscheduled_hops_reported() {
        let fixture = fixture(RecordingDispatch::new());
        fixture.dispatch.set_route(MoteId::new(2), vec![vec![1], vec![2]]);
        let schedule = Schedule::new().with_frame(
            Slotframe::new(FrameId::new(1), 101)
                .unwrap()
                .with_cell(Cell::dedicated(
                    3,
                    0,
                    CellType::Tx,
                    MoteId::new(2),
                    MoteId::new(1),
                ))
                .unwrap(),
        );
        fixture.schedule.install(schedule).await.unwrap();

        let route = fixture
            .resolver
            .resolve_source_route(MoteId::new(2))
            .await
            .unwrap();
        assert!(route.unscheduled.is_empty());
    }

    #[tokio::test]
    async fn test_no_route() {
        let fixture = fixture(RecordingDispatch::new());

        // Routing layer has no entry for mote 3
        assert_eq!(
            fixture.resolver.resolve_source_route(MoteId::new(3)).await,
            Err(RouteError::NoRouteAvailable {
                destination: MoteId::new(3)
            })
        );

        // Empty answer
        fixture.dispatch.set_route(MoteId::new(3), vec![]);
        assert!(matches!(
            fixture.resolver.resolve_source_route(MoteId::new(3)).await,
            Err(RouteError::NoRouteAvailable { .. })
        ));

        // Path that stops short of the destination is never returned
        fixture.dispatch.set_route(MoteId::new(3), vec![vec![1], vec![2]]);
        assert!(matches!(
            fixture.resolver.resolve_source_route(MoteId::new(3)).await,
            Err(RouteError::NoRouteAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_route_must_start_at_root() {
        let fixture = fixture(RecordingDispatch::new());
        fixture
            .dispatch
            .set_route(MoteId::new(3), vec![vec![2], vec![3]]);
        assert_eq!(
            fixture.resolver.resolve_source_route(MoteId::new(3)).await,
            Err(RouteError::NoRouteAvailable {
                destination: MoteId::new(3)
            })
        );

        fixture
            .dispatch
            .set_route(MoteId::new(3), vec![vec![1], vec![2], vec![3]]);
        let route = fixture
            .resolver
            .resolve_source_route(MoteId::new(3))
            .await
            .unwrap();
        assert_eq!(route.hops, vec![MoteId::new(1), MoteId::new(2), MoteId::new(3)]);
    }

    #[tokio::test]
    async fn test_unreachable_destination_not_dispatched() {
        let fixture = fixture(RecordingDispatch::new());
        // Answer the network would give if asked
        fixture
            .dispatch
            .set_route(MoteId::new(4), vec![vec![1], vec![4]]);

        // Mote 4 has no link from the root
        assert_eq!(
            fixture.resolver.resolve_source_route(MoteId::new(4)).await,
            Err(RouteError::NoRouteAvailable {
                destination: MoteId::new(4)
            })
        );

        // A dead link does not count
        fixture
            .graph
            .connect(MoteId::new(1), MoteId::new(4), Some(0.0))
            .unwrap();
        assert!(fixture.resolver.resolve_source_route(MoteId::new(4)).await.is_err());

        // Neither does a topology without a root
        fixture.graph.set_dag_root(MoteId::new(1), false).unwrap();
        let error = fixture
            .resolver
            .resolve_source_route(MoteId::new(2))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        assert!(fixture.dispatch.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_destination_not_dispatched() {
        let fixture = fixture(RecordingDispatch::new());
        let error = fixture
            .resolver
            .resolve_source_route(MoteId::new(42))
            .await
            .unwrap_err();
        assert_eq!(error, RouteError::UnknownMote { id: MoteId::new(42) });
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(fixture.dispatch.requests().is_empty());
    }

    #[tokio::test]
    async fn test_silent_routing_layer_times_out() {
        let fixture = fixture(RecordingDispatch::new_with_silent_network());
        let error = fixture
            .resolver
            .resolve_source_route(MoteId::new(2))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DispatchTimeout);
        assert_eq!(fixture.dispatch.requests().len(), 2);
    }
}
