//! Single-host backend driving the `docker` CLI.
//!
//! Every run gets its own bridge network with a fixed subnet, so node
//! addresses are known before the containers start. Node `i` is the
//! container `<run>-node-<i>` at `base + 2 + i`, paired with a monitor
//! sidecar `<run>-node-<i>-monitor` joined to its network and PID
//! namespaces. All resources carry the `simnet.run=<run>` label, which
//! `clean` uses to find them again.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    apply_topology, command, new_run_id, node_name, run_selector, wait_for_ports, NodeTable,
    SimIo, Strategy, INDEX_LABEL, MONITOR,
};
use crate::error::{Result, SimError};
use crate::io::{
    backend_exit, Completion, ExecOptions, Executor, PipeReader, PipeWriter, ProcessExecutor,
    RemoteIo, RetryPolicy, StreamError,
};
use crate::metrics::TagRecorder;
use crate::node::NodeInfo;
use crate::options::Options;

pub const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(10, 185, 0, 0);
pub const DEFAULT_PREFIX: u8 = 16;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Status `docker` itself exits with when it could not run the command.
const DOCKER_FAILURE: i32 = 125;

const DAEMON_ERRORS: [&str; 2] = [
    "Error response from daemon",
    "Cannot connect to the Docker daemon",
];

/// Attributes a non-zero `docker` exit to the daemon or to the command run
/// in the container.
pub fn classify_exit(code: i32, stderr: &str) -> StreamError {
    let stderr = stderr.trim_start();
    if code == DOCKER_FAILURE || DAEMON_ERRORS.iter().any(|p| stderr.starts_with(p)) {
        backend_exit(code)
    } else {
        StreamError::Exit(code)
    }
}

pub struct DockerStrategy {
    options: Options,
    run: String,
    subnet: Ipv4Addr,
    prefix: u8,
    remote: RemoteIo,
    nodes: NodeTable,
    tags: TagRecorder,
    poll: Duration,
}

impl DockerStrategy {
    pub fn new(options: Options) -> Self {
        Self::with_executor(options, Arc::new(ProcessExecutor))
    }

    pub fn with_executor(options: Options, executor: Arc<dyn Executor>) -> Self {
        Self {
            options,
            run: new_run_id(),
            subnet: DEFAULT_SUBNET,
            prefix: DEFAULT_PREFIX,
            remote: RemoteIo::new(executor, RetryPolicy::default()).with_classifier(classify_exit),
            nodes: NodeTable::default(),
            tags: TagRecorder::new(),
            poll: POLL_INTERVAL,
        }
    }

    pub fn with_run_id(mut self, run: impl Into<String>) -> Self {
        self.run = run.into();
        self
    }

    pub fn with_subnet(mut self, base: Ipv4Addr, prefix: u8) -> Self {
        self.subnet = base;
        self.prefix = prefix;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.remote = self.remote.with_retry(retry);
        self
    }

    /// Interval between readiness checks.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run
    }

    /// Address of node `index`: the gateway takes `base + 1`.
    fn address(&self, index: usize) -> Result<Ipv4Addr> {
        let host_bits = 32 - u32::from(self.prefix.min(32));
        let capacity = (1u64 << host_bits).saturating_sub(3);
        let address = (index as u64)
            .checked_add(2)
            .filter(|_| (index as u64) < capacity)
            .and_then(|offset| u32::try_from(offset).ok())
            .and_then(|offset| u32::from(self.subnet).checked_add(offset));
        address.map(Ipv4Addr::from).ok_or_else(|| {
            SimError::deployment(format!(
                "subnet {}/{} has no room for node {index}",
                self.subnet, self.prefix
            ))
        })
    }

    fn monitor_name(name: &str) -> String {
        format!("{name}-{MONITOR}")
    }

    fn run_labels(&self) -> [String; 2] {
        ["--label".to_string(), run_selector(&self.run)]
    }

    /// `docker run` line of the main container of a node.
    fn node_command(&self, index: usize, name: &str, address: Ipv4Addr) -> Vec<String> {
        let options = self.options.for_node(name, &address.to_string());

        let mut cmd = command(["docker", "run", "-d", "--name", name, "--hostname", name]);
        cmd.extend(self.run_labels());
        cmd.extend(command(["--label".to_string(), format!("{INDEX_LABEL}={index}")]));
        cmd.extend(command([
            "--network".to_string(),
            self.run.clone(),
            "--ip".to_string(),
            address.to_string(),
        ]));
        for port in &options.ports {
            cmd.extend(command(["--expose".to_string(), port.to_string()]));
        }
        for tmpfs in &options.tmpfs {
            cmd.extend(command([
                "--tmpfs".to_string(),
                format!("{}:size={}", tmpfs.destination, tmpfs.size),
            ]));
        }
        if let Some(resources) = options.resources {
            cmd.extend(command([
                "--cpu-shares".to_string(),
                resources.cpu_shares().to_string(),
                "--memory-reservation".to_string(),
                resources.memory_bytes.to_string(),
            ]));
        }

        let (entrypoint, rest) = match options.cmd.split_first() {
            Some((entrypoint, rest)) => (Some(entrypoint), rest),
            None => (None, &[][..]),
        };
        if let Some(entrypoint) = entrypoint {
            cmd.extend(command(["--entrypoint", entrypoint.as_str()]));
        }
        cmd.push(options.image.clone());
        cmd.extend(rest.iter().cloned());
        cmd.extend(options.args.iter().cloned());
        cmd
    }

    fn monitor_command(&self, name: &str) -> Vec<String> {
        let monitor = Self::monitor_name(name);
        let joined = format!("container:{name}");
        let mut cmd = command(["docker", "run", "-d", "--name", monitor.as_str()]);
        cmd.extend(self.run_labels());
        cmd.extend(command([
            "--network",
            joined.as_str(),
            "--pid",
            joined.as_str(),
            "--cap-add",
            "NET_ADMIN",
            self.options.monitor_image.as_str(),
        ]));
        cmd
    }

    fn in_monitor(node: &NodeInfo, tc: Vec<String>) -> Vec<String> {
        let mut cmd = command(["docker".to_string(), "exec".to_string(), Self::monitor_name(&node.name)]);
        cmd.extend(tc);
        cmd
    }

    async fn create_network(&self) -> Result<()> {
        let subnet = format!("{}/{}", self.subnet, self.prefix);
        let mut cmd = command(["docker", "network", "create", "--driver", "bridge", "--subnet", subnet.as_str()]);
        cmd.extend(self.run_labels());
        cmd.push(self.run.clone());
        self.remote.invoke(&cmd, None).await?;
        tracing::debug!(run = %self.run, subnet = %subnet, "network created");
        Ok(())
    }

    async fn start_node(&self, index: usize) -> Result<NodeInfo> {
        let name = node_name(&self.run, index);
        let address = self.address(index)?;

        self.remote.invoke(&self.node_command(index, &name, address), None).await?;
        self.remote.invoke(&self.monitor_command(&name), None).await?;

        tracing::debug!(node = %name, address = %address, "containers started");
        Ok(NodeInfo {
            name,
            address: address.to_string(),
            index,
        })
    }

    /// Polls container states until every container runs. A container that
    /// stopped fails the deployment at once.
    async fn wait_running(&self, nodes: &[NodeInfo]) -> Result<()> {
        let mut cmd = command(["docker", "inspect", "--format", "{{.Name}} {{.State.Status}}"]);
        for node in nodes {
            cmd.push(node.name.clone());
            cmd.push(Self::monitor_name(&node.name));
        }

        let expected = nodes.len() * 2;
        loop {
            let states = self.remote.query(&cmd).await?;
            let mut running = 0;
            for line in states.lines() {
                let Some((name, state)) = line.trim().split_once(' ') else {
                    continue;
                };
                let name = name.trim_start_matches('/');
                match state {
                    "running" => running += 1,
                    "exited" | "dead" => {
                        return Err(SimError::deployment(format!("container {name} is {state}")));
                    }
                    _ => {}
                }
            }
            if running >= expected {
                return Ok(());
            }
            let pending = expected - running;
            tracing::debug!(run = %self.run, pending, "waiting for containers");
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Removes labelled resources of one kind (`container` or `network`).
    async fn remove_labelled(&self, list: &[&str], remove: &[&str]) -> Result<usize> {
        let filter = format!("label={}", run_selector(&self.run));
        let mut cmd = command(list.iter().copied());
        cmd.extend(command(["--filter", filter.as_str()]));

        let listed = self.remote.query(&cmd).await?;
        let ids: Vec<&str> = listed.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = command(remove.iter().copied());
        cmd.extend(command(ids.iter().copied()));
        self.remote.invoke(&cmd, None).await?;
        Ok(ids.len())
    }
}

impl std::fmt::Debug for DockerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerStrategy")
            .field("run", &self.run)
            .field("subnet", &format_args!("{}/{}", self.subnet, self.prefix))
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SimIo for DockerStrategy {
    async fn exec(&self, node: &str, args: &[String], options: ExecOptions<'_>) -> Result<()> {
        let node = self.nodes.find(node)?;
        let mut cmd = command(["docker".to_string(), "exec".to_string(), node.name.clone()]);
        cmd.extend(args.iter().cloned());
        self.remote.exec(&node.name, &cmd, options).await
    }

    fn read(&self, node: &str, path: &str) -> Result<PipeReader> {
        let node = self.nodes.find(node)?;
        let cmd = command(["docker", "exec", node.name.as_str(), "cat", path]);
        Ok(self.remote.read(&node.name, cmd))
    }

    fn write(
        &self,
        node: &str,
        container: Option<&str>,
        cmd: &[String],
    ) -> Result<(PipeWriter, Completion)> {
        let node = self.nodes.find(node)?;
        let target = match container {
            Some(sidecar) => format!("{}-{sidecar}", node.name),
            None => node.name.clone(),
        };
        let mut line = command(["docker".to_string(), "exec".to_string(), "-i".to_string(), target]);
        line.extend(cmd.iter().cloned());
        Ok(self.remote.write(&node.name, line))
    }

    fn tag(&self, node: &str) {
        self.tags.record(node);
    }
}

#[async_trait]
impl Strategy for DockerStrategy {
    fn name(&self) -> &str {
        "docker"
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn io(&self) -> &dyn SimIo {
        self
    }

    async fn deploy(&self) -> Result<Vec<NodeInfo>> {
        let topology = self.options.topology.clone();
        topology.validate()?;
        if let Some(placement) = topology.placement() {
            tracing::warn!(key = %placement.key, "placement constraints are not supported on docker, ignoring");
        }

        let count = topology.len();
        tracing::info!(run = %self.run, nodes = count, image = %self.options.image, "deploying on docker");

        self.create_network().await?;
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            nodes.push(self.start_node(index).await?);
        }
        self.nodes.set(nodes.clone());

        let ports: Vec<u16> = self.options.tcp_ports().collect();
        let ready = async {
            self.wait_running(&nodes).await?;
            apply_topology(&self.remote, topology.as_ref(), &nodes, Self::in_monitor).await?;
            wait_for_ports(&nodes, &ports, self.poll).await;
            Ok::<_, SimError>(())
        };
        let timeout = self.options.deploy_timeout;
        tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| SimError::deployment(format!("nodes not ready after {timeout:?}")))??;

        tracing::info!(run = %self.run, nodes = count, "fleet ready");
        Ok(nodes)
    }

    fn tags(&self) -> BTreeMap<i64, String> {
        self.tags.snapshot()
    }

    async fn collect_logs(&self) -> Result<HashMap<String, Bytes>> {
        let nodes = self.nodes.all();
        let fetches = nodes.iter().map(|node| async move {
            let cmd = command(["docker".to_string(), "logs".to_string(), Self::monitor_name(&node.name)]);
            (node, self.remote.query(&cmd).await)
        });

        let mut logs = HashMap::new();
        for (node, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(log) => {
                    logs.insert(node.name.clone(), Bytes::from(log));
                }
                Err(e) => tracing::warn!(node = %node.name, error = %e, "monitor log unavailable"),
            }
        }
        Ok(logs)
    }

    async fn clean(&self) -> Result<()> {
        let mut failures = Vec::new();

        match self
            .remove_labelled(&["docker", "ps", "-aq"], &["docker", "rm", "-f"])
            .await
        {
            Ok(removed) => tracing::debug!(run = %self.run, removed, "containers removed"),
            Err(e) => failures.push(e.to_string()),
        }
        match self
            .remove_labelled(&["docker", "network", "ls", "-q"], &["docker", "network", "rm"])
            .await
        {
            Ok(removed) => tracing::debug!(run = %self.run, removed, "networks removed"),
            Err(e) => failures.push(e.to_string()),
        }
        self.nodes.clear();

        if failures.is_empty() {
            tracing::info!(run = %self.run, "docker resources cleaned");
            Ok(())
        } else {
            Err(SimError::Teardown(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Port;
    use crate::test_util::ScriptedExecutor;

    fn strategy(options: Options) -> DockerStrategy {
        DockerStrategy::with_executor(options, ScriptedExecutor::succeeding().shared())
            .with_run_id("run")
    }

    #[test]
    fn addresses_skip_network_and_gateway() {
        let docker = strategy(Options::builder().build());
        assert_eq!(docker.address(0).expect("addr"), Ipv4Addr::new(10, 185, 0, 2));
        assert_eq!(docker.address(300).expect("addr"), Ipv4Addr::new(10, 185, 1, 46));

        let small = strategy(Options::builder().build()).with_subnet(Ipv4Addr::new(10, 0, 0, 0), 30);
        assert!(small.address(0).is_ok());
        assert!(matches!(small.address(1), Err(SimError::Deployment { .. })));

        let top = strategy(Options::builder().build())
            .with_subnet(Ipv4Addr::new(255, 255, 255, 250), 16);
        assert_eq!(top.address(3).expect("addr"), Ipv4Addr::new(255, 255, 255, 255));
        let err = top.address(4).expect_err("past the last address");
        assert!(err.to_string().contains("has no room for node 4"));
    }

    #[test]
    fn daemon_failures_are_transport() {
        let daemon = classify_exit(1, "Error response from daemon: container abc is not running");
        assert!(matches!(daemon, StreamError::Transport(_)));
        assert!(matches!(
            classify_exit(1, "Cannot connect to the Docker daemon at unix:///var/run/docker.sock."),
            StreamError::Transport(_)
        ));
        assert!(matches!(classify_exit(125, ""), StreamError::Transport(_)));
        assert!(matches!(classify_exit(1, "cat: /x: No such file"), StreamError::Exit(1)));
        assert!(matches!(classify_exit(127, "sh: foo: not found"), StreamError::Exit(127)));
    }

    #[test]
    fn node_command_carries_options() {
        let options = Options::builder()
            .image(
                "dedis/conode:latest",
                vec!["/bin/sh".into(), "-c".into()],
                vec!["run".into()],
                [Port::tcp(7770), Port::udp(7771)],
            )
            .tmpfs("/storage", 1024)
            .resources(250, 1024)
            .update(|opts, _, ip| opts.args.push(format!("--ip={ip}")))
            .build();
        let docker = strategy(options);

        let cmd = docker.node_command(1, "run-node-1", Ipv4Addr::new(10, 185, 0, 3));
        let line = cmd.join(" ");

        assert!(line.starts_with("docker run -d --name run-node-1"));
        assert!(line.contains("--label simnet.run=run --label simnet.index=1"));
        assert!(line.contains("--network run --ip 10.185.0.3"));
        assert!(line.contains("--expose 7770/tcp --expose 7771/udp"));
        assert!(line.contains("--tmpfs /storage:size=1024"));
        assert!(line.contains("--cpu-shares 256 --memory-reservation 1024"));
        assert!(line.ends_with("--entrypoint /bin/sh dedis/conode:latest -c run --ip=10.185.0.3"));
    }

    #[test]
    fn monitor_shares_node_namespaces() {
        let docker = strategy(Options::builder().monitor_image("mon:1").build());
        let line = docker.monitor_command("run-node-0").join(" ");
        assert_eq!(
            line,
            "docker run -d --name run-node-0-monitor --label simnet.run=run \
             --network container:run-node-0 --pid container:run-node-0 --cap-add NET_ADMIN mon:1"
        );
    }

    #[tokio::test]
    async fn io_requires_a_deployed_node() {
        let docker = strategy(Options::builder().build());
        let err = docker.read("run-node-0", "/etc/hostname").expect_err("no fleet");
        assert!(matches!(err, SimError::UnknownNode(_)));
    }
}
