//! Network simulation harness.
//!
//! Deploys a fleet of identical containers on a pluggable backend, imposes
//! an emulated network between them, drives a user [`Round`] through a
//! fixed lifecycle and turns the per-node resource logs into a [`Stats`]
//! report.
//!
//! - **Options**: image, ports, topology, output directory, file mappers
//! - **Strategies**: Docker (single host) and Kubernetes (cluster) backends
//! - **Remote I/O**: exec, streaming read and write against live nodes
//! - **Metrics**: shaping raw sidecar logs into aligned time series
//! - **Simulation**: the deploy → round → collect → clean state machine

pub mod error;
pub mod files;
pub mod io;
pub mod metrics;
pub mod node;
pub mod options;
pub mod sim;
pub mod strategy;

pub mod test_util;

pub use error::{Result, SimError};
pub use files::{FileMapper, FileValues, FilesKey};
pub use metrics::{NodeStats, Stats, TagRecorder, Window};
pub use node::{Identifier, NodeInfo};
pub use options::{Options, OptionsBuilder, Port, Protocol, Resources, TmpFs, GB, KB, MB};
pub use sim::{Phase, Round, Simulation};
pub use strategy::docker::DockerStrategy;
pub use strategy::kubernetes::KubernetesStrategy;
pub use strategy::{SimIo, Strategy};

pub use simnet_network as network;
