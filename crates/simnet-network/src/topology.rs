use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("topology has no nodes")]
    Empty,
    #[error("placement key must not be empty")]
    EmptyPlacementKey,
    #[error("placement on {key} lists no values")]
    EmptyPlacementValues { key: String },
    #[error("loss must be within 0-100%, got {0}%")]
    InvalidLoss(f32),
    #[error("bandwidth cap must be positive")]
    ZeroRate,
}

/// Characteristics of the one-way link from a node to one of its peers.
///
/// A zero latency and jitter with no loss and no cap means the link is left
/// untouched by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkParams {
    pub latency: Duration,
    pub jitter: Duration,
    pub loss_percent: Option<f32>,
    pub rate_kbit: Option<u64>,
}

impl LinkParams {
    pub fn is_unshaped(&self) -> bool {
        self.latency.is_zero()
            && self.jitter.is_zero()
            && self.loss_percent.is_none()
            && self.rate_kbit.is_none()
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if let Some(loss) = self.loss_percent {
            if !(0.0..=100.0).contains(&loss) {
                return Err(TopologyError::InvalidLoss(loss));
            }
        }
        if self.rate_kbit == Some(0) {
            return Err(TopologyError::ZeroRate);
        }
        Ok(())
    }
}

/// Scheduling constraint: nodes may only land on hosts whose label `key`
/// holds one of `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub key: String,
    pub values: Vec<String>,
}

/// Declarative network intent for a fleet.
///
/// Backends size the deployment from [`Topology::len`] and translate the
/// remaining accessors into their own primitives: traffic shaping rules for
/// [`Topology::link`], scheduler constraints for [`Topology::placement`].
pub trait Topology: fmt::Debug + Send + Sync {
    /// Number of nodes the fleet must have.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parameters of the link from node `from` to node `to`, or `None` when
    /// the link is not shaped (including `from == to` and out-of-range
    /// indices).
    fn link(&self, from: usize, to: usize) -> Option<LinkParams>;

    fn placement(&self) -> Option<&Placement> {
        None
    }

    /// Checks that the topology can be realized at all.
    fn validate(&self) -> Result<(), TopologyError> {
        if self.is_empty() {
            return Err(TopologyError::Empty);
        }
        if let Some(placement) = self.placement() {
            if placement.key.is_empty() {
                return Err(TopologyError::EmptyPlacementKey);
            }
            if placement.values.is_empty() {
                return Err(TopologyError::EmptyPlacementValues {
                    key: placement.key.clone(),
                });
            }
        }
        Ok(())
    }
}

// ── Simple topology ─────────────────────────────────────────────────

/// Uniform private network: every pair of distinct nodes is joined by the
/// same symmetric link.
///
/// Meant for single-host deployments where the harness itself shapes the
/// traffic of each node.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTopology {
    nodes: usize,
    link: LinkParams,
}

impl SimpleTopology {
    pub fn new(nodes: usize, latency: Duration) -> Self {
        Self {
            nodes,
            link: LinkParams {
                latency,
                ..Default::default()
            },
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.link.jitter = jitter;
        self
    }

    pub fn with_loss(mut self, percent: f32) -> Self {
        self.link.loss_percent = Some(percent);
        self
    }

    pub fn with_bandwidth(mut self, rate_kbit: u64) -> Self {
        self.link.rate_kbit = Some(rate_kbit);
        self
    }

    pub fn latency(&self) -> Duration {
        self.link.latency
    }
}

impl Topology for SimpleTopology {
    fn len(&self) -> usize {
        self.nodes
    }

    fn link(&self, from: usize, to: usize) -> Option<LinkParams> {
        if from == to || from >= self.nodes || to >= self.nodes || self.link.is_unshaped() {
            return None;
        }
        Some(self.link)
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.nodes == 0 {
            return Err(TopologyError::Empty);
        }
        self.link.validate()
    }
}

// ── Cloud topology ──────────────────────────────────────────────────

/// Placement-only topology for cluster backends.
///
/// Carries no synthetic delay: the network between nodes is whatever the
/// cluster provides between the hosts matching the placement constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudTopology {
    nodes: usize,
    placement: Placement,
}

impl CloudTopology {
    pub fn new<I, S>(nodes: usize, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes,
            placement: Placement {
                key: key.into(),
                values: values.into_iter().map(Into::into).collect(),
            },
        }
    }
}

impl Topology for CloudTopology {
    fn len(&self) -> usize {
        self.nodes
    }

    fn link(&self, _from: usize, _to: usize) -> Option<LinkParams> {
        None
    }

    fn placement(&self) -> Option<&Placement> {
        Some(&self.placement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_topology_links_every_distinct_pair() {
        let topo = SimpleTopology::new(3, Duration::from_millis(25))
            .with_jitter(Duration::from_millis(5));

        assert_eq!(topo.len(), 3);
        assert!(topo.link(0, 0).is_none());
        assert!(topo.link(0, 3).is_none());

        let link = topo.link(2, 1).expect("link between distinct nodes");
        assert_eq!(link.latency, Duration::from_millis(25));
        assert_eq!(link.jitter, Duration::from_millis(5));
        assert_eq!(topo.link(1, 2), Some(link));
    }

    #[test]
    fn zero_latency_leaves_links_unshaped() {
        let topo = SimpleTopology::new(4, Duration::ZERO);
        assert!(topo.link(0, 1).is_none());
        assert!(topo.validate().is_ok());
    }

    #[test]
    fn simple_topology_rejects_invalid_links() {
        assert_eq!(
            SimpleTopology::new(0, Duration::ZERO).validate(),
            Err(TopologyError::Empty)
        );
        assert_eq!(
            SimpleTopology::new(2, Duration::ZERO).with_loss(120.0).validate(),
            Err(TopologyError::InvalidLoss(120.0))
        );
        assert_eq!(
            SimpleTopology::new(2, Duration::ZERO).with_bandwidth(0).validate(),
            Err(TopologyError::ZeroRate)
        );
    }

    #[test]
    fn cloud_topology_only_places() {
        let topo = CloudTopology::new(2, "kubernetes.io/arch", ["amd64"]);
        assert_eq!(topo.len(), 2);
        assert!(topo.link(0, 1).is_none());

        let placement = topo.placement().expect("placement");
        assert_eq!(placement.key, "kubernetes.io/arch");
        assert_eq!(placement.values, vec!["amd64".to_string()]);
        assert!(topo.validate().is_ok());
    }

    #[test]
    fn cloud_topology_requires_values() {
        let topo = CloudTopology::new(2, "zone", Vec::<String>::new());
        assert_eq!(
            topo.validate(),
            Err(TopologyError::EmptyPlacementValues { key: "zone".into() })
        );
    }
}
