//! Integration tests for meshctl
//!
//! These tests drive a full controller against the simulated mesh and
//! rovers. They check how the schedule, multicast, topology and discovery
//! subsystems behave together rather than each one in isolation.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/discovery.rs"]
mod discovery;
#[path = "integration/multicast.rs"]
mod multicast;
#[path = "integration/routing.rs"]
mod routing;
#[path = "integration/schedule_lifecycle.rs"]
mod schedule_lifecycle;
#[path = "integration/topology_properties.rs"]
mod topology_properties;
