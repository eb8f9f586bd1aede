//! Deployment backends.
//!
//! A [`Strategy`] owns the lifecycle of a fleet on one backend (deploy,
//! log retrieval, teardown) and doubles as the [`SimIo`] handle rounds use
//! to talk to live nodes.

pub mod docker;
pub mod kubernetes;

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use simnet_network::{shaping, Topology};

use crate::error::{Result, SimError};
use crate::io::{Completion, ExecOptions, PipeReader, PipeWriter, RemoteIo};
use crate::node::NodeInfo;
use crate::options::Options;

/// Label carrying the run id on every backend resource.
pub const RUN_LABEL: &str = "simnet.run";
/// Label carrying the node index on every node.
pub const INDEX_LABEL: &str = "simnet.index";
/// Name of the metrics and shaping sidecar of every node.
pub const MONITOR: &str = "monitor";
/// Interface shaped inside each node's network namespace.
pub const INTERFACE: &str = "eth0";

/// Remote I/O against the nodes of a deployed fleet.
///
/// Nodes are addressed by [`NodeInfo::name`]. Every method may be called
/// concurrently, for the same node or different ones.
#[async_trait]
pub trait SimIo: Send + Sync {
    /// Runs `args` in the node's main container and waits for it to exit,
    /// streaming its output into the given sinks.
    async fn exec(&self, node: &str, args: &[String], options: ExecOptions<'_>) -> Result<()>;

    /// Streams the content of the file at `path` in the node.
    fn read(&self, node: &str, path: &str) -> Result<PipeReader>;

    /// Starts `cmd` in the node, in its main container when `container` is
    /// `None`, fed by the returned writer.
    fn write(
        &self,
        node: &str,
        container: Option<&str>,
        cmd: &[String],
    ) -> Result<(PipeWriter, Completion)>;

    /// Records a marker naming `node` at the current instant.
    fn tag(&self, node: &str);
}

#[async_trait]
pub trait Strategy: SimIo {
    fn name(&self) -> &str;

    fn options(&self) -> &Options;

    fn io(&self) -> &dyn SimIo;

    /// Creates `options().topology.len()` nodes, shapes their network and
    /// waits until they are ready. Nodes are returned in request order.
    async fn deploy(&self) -> Result<Vec<NodeInfo>>;

    fn tags(&self) -> BTreeMap<i64, String>;

    /// Raw monitor logs by node name. Nodes whose log cannot be retrieved
    /// are left out.
    async fn collect_logs(&self) -> Result<HashMap<String, Bytes>>;

    /// Removes every resource of the run. Safe to call repeatedly and after
    /// a partial deploy.
    async fn clean(&self) -> Result<()>;
}

// ── Helpers shared by the backends ──────────────────────────────────

/// Fresh run id, short enough for container and pod names.
pub fn new_run_id() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    format!("simnet-{}", &id[id.len() - 8..])
}

pub(crate) fn node_name(run: &str, index: usize) -> String {
    format!("{run}-node-{index}")
}

pub(crate) fn run_selector(run: &str) -> String {
    format!("{RUN_LABEL}={run}")
}

pub(crate) fn command<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Nodes of the current deployment.
#[derive(Debug, Default)]
pub(crate) struct NodeTable(Mutex<Vec<NodeInfo>>);

impl NodeTable {
    pub(crate) fn set(&self, nodes: Vec<NodeInfo>) {
        *self.lock() = nodes;
    }

    pub(crate) fn find(&self, name: &str) -> Result<NodeInfo> {
        self.lock()
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| SimError::UnknownNode(name.to_string()))
    }

    pub(crate) fn all(&self) -> Vec<NodeInfo> {
        self.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NodeInfo>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Installs the shaping plan of every node through its monitor sidecar.
///
/// `in_monitor` turns a `tc` command line into the backend command running
/// it inside the sidecar of the given node.
pub(crate) async fn apply_topology<F>(
    remote: &RemoteIo,
    topology: &dyn Topology,
    nodes: &[NodeInfo],
    in_monitor: F,
) -> Result<()>
where
    F: Fn(&NodeInfo, Vec<String>) -> Vec<String> + Sync,
{
    let addresses = nodes
        .iter()
        .map(|n| {
            n.address.parse::<Ipv4Addr>().map_err(|e| {
                SimError::deployment(format!("node {} has no IPv4 address ({}): {e}", n.name, n.address))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let jobs = nodes.iter().map(|node| {
        let peers: Vec<_> = nodes
            .iter()
            .zip(&addresses)
            .filter_map(|(peer, &address)| {
                let link = topology.link(node.index, peer.index)?;
                Some((address, link))
            })
            .collect();
        let plan = shaping::plan(INTERFACE, &peers);
        let in_monitor = &in_monitor;

        async move {
            if plan.is_empty() {
                return Ok(());
            }
            if let Err(e) = remote.invoke(&in_monitor(node, shaping::reset(INTERFACE)), None).await {
                tracing::debug!(node = %node.name, error = %e, "no previous qdisc to remove");
            }
            for tc in plan {
                remote.invoke(&in_monitor(node, tc), None).await?;
            }
            tracing::info!(node = %node.name, peers = peers.len(), "network shaped");
            Ok::<_, SimError>(())
        }
    });

    futures::future::try_join_all(jobs).await?;
    Ok(())
}

/// Attempts a TCP connection with a timeout.
pub(crate) async fn check_tcp_reachable(address: &str, port: u16, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, tokio::net::TcpStream::connect((address, port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Polls until every node accepts connections on every port in `ports`.
pub(crate) async fn wait_for_ports(nodes: &[NodeInfo], ports: &[u16], poll: Duration) {
    for node in nodes {
        for &port in ports {
            while !check_tcp_reachable(&node.address, port, poll).await {
                tracing::debug!(node = %node.name, port, "port not ready yet");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RetryPolicy;
    use crate::test_util::{Reply, ScriptedExecutor};
    use simnet_network::SimpleTopology;
    use std::sync::Arc;

    fn nodes(n: usize) -> Vec<NodeInfo> {
        (0..n)
            .map(|i| NodeInfo {
                name: node_name("run", i),
                address: format!("10.185.0.{}", i + 2),
                index: i,
            })
            .collect()
    }

    #[test]
    fn run_ids_are_short_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("simnet-"));
        assert_eq!(a.len(), "simnet-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn node_table_lookup() {
        let table = NodeTable::default();
        table.set(nodes(2));
        assert_eq!(table.find("run-node-1").expect("node").index, 1);
        assert!(matches!(
            table.find("run-node-9"),
            Err(SimError::UnknownNode(name)) if name == "run-node-9"
        ));
        table.clear();
        assert!(table.all().is_empty());
    }

    #[tokio::test]
    async fn topology_is_shaped_through_the_monitor() {
        let executor = ScriptedExecutor::succeeding().shared();
        let remote = RemoteIo::new(executor.clone(), RetryPolicy::none());
        let topology = SimpleTopology::new(3, Duration::from_millis(50));

        apply_topology(&remote, &topology, &nodes(3), |node, tc| {
            let mut cmd = command(["exec", node.name.as_str()]);
            cmd.extend(tc);
            cmd
        })
        .await
        .expect("shaping");

        let filters = executor.matching(&["exec", "run-node-0", "tc", "filter"]);
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().any(|c| c.contains(&"10.185.0.3/32".to_string())));
        assert_eq!(executor.matching(&["tc", "qdisc", "del"]).len(), 3);
    }

    #[tokio::test]
    async fn unshaped_topology_runs_nothing() {
        let executor = ScriptedExecutor::succeeding().shared();
        let remote = RemoteIo::new(executor.clone(), RetryPolicy::none());
        let topology = SimpleTopology::new(2, Duration::ZERO);

        apply_topology(&remote, &topology, &nodes(2), |_, tc| tc)
            .await
            .expect("shaping");
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn failing_tc_command_fails_shaping() {
        let executor = Arc::new(ScriptedExecutor::new(|command, _| {
            if command.iter().any(|p| p == "class") {
                Reply::exit(2, "RTNETLINK answers: Operation not permitted")
            } else {
                Reply::ok("")
            }
        }));
        let remote = RemoteIo::new(executor, RetryPolicy::none());
        let topology = SimpleTopology::new(2, Duration::from_millis(10));

        let err = apply_topology(&remote, &topology, &nodes(2), |_, tc| tc)
            .await
            .expect_err("tc fails");
        assert!(err.to_string().contains("Operation not permitted"));
    }
}
