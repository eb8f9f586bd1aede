//! Network model for simnet fleets.
//!
//! Describes the intended network between the nodes of a simulation
//! (per-link latency, jitter, loss and bandwidth caps, or a scheduling
//! placement constraint) and translates link parameters into `tc`
//! command lines. Nothing in this crate touches the host: backends decide
//! where and how the generated commands run.

pub mod shaping;
pub mod topology;

pub use topology::{CloudTopology, LinkParams, Placement, SimpleTopology, Topology, TopologyError};
