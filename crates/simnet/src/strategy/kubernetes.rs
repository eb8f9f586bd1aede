//! Cluster backend driving `kubectl`.
//!
//! Node `i` is the pod `<run>-node-<i>` with two containers: `node` running
//! the image and `monitor` sampling resources and shaping traffic. Pods are
//! labelled with the run id and their index, so addresses are read back in
//! request order and `clean` can select them without in-memory state.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    apply_topology, command, new_run_id, node_name, run_selector, NodeTable, SimIo, Strategy,
    INDEX_LABEL, MONITOR, RUN_LABEL,
};
use crate::error::{Result, SimError};
use crate::io::{
    backend_exit, Completion, ExecOptions, Executor, PipeReader, PipeWriter, ProcessExecutor,
    RemoteIo, RetryPolicy, StreamError,
};
use crate::metrics::TagRecorder;
use crate::node::NodeInfo;
use crate::options::{Options, Protocol};

/// Container running the image in every pod.
pub const NODE_CONTAINER: &str = "node";

/// Placeholder handed to the update hook instead of the node address, which
/// is unknown before scheduling. Kubernetes expands it in `command`/`args`.
pub const POD_IP: &str = "$(POD_IP)";

/// Slack given to `kubectl wait` on top of its own timeout.
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// Line `kubectl exec` prints when the command in the container failed.
const REMOTE_EXIT: &str = "command terminated with exit code ";

/// Attributes a non-zero `kubectl` exit: only a command that terminated in
/// the container is a remote exit, anything else failed on the way there.
pub fn classify_exit(code: i32, stderr: &str) -> StreamError {
    let remote = stderr
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(REMOTE_EXIT)?.trim().parse().ok());
    match remote {
        Some(status) => StreamError::Exit(status),
        None => backend_exit(code),
    }
}

pub struct KubernetesStrategy {
    options: Options,
    run: String,
    kubeconfig: PathBuf,
    remote: RemoteIo,
    nodes: NodeTable,
    tags: TagRecorder,
}

impl KubernetesStrategy {
    pub fn new(options: Options, kubeconfig: impl Into<PathBuf>) -> Result<Self> {
        Self::with_executor(options, kubeconfig, Arc::new(ProcessExecutor))
    }

    /// Fails when the kubeconfig file does not exist.
    pub fn with_executor(
        options: Options,
        kubeconfig: impl Into<PathBuf>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let kubeconfig = kubeconfig.into();
        std::fs::metadata(&kubeconfig).map_err(|e| {
            io::Error::new(e.kind(), format!("kubeconfig {}: {e}", kubeconfig.display()))
        })?;

        Ok(Self {
            options,
            run: new_run_id(),
            kubeconfig,
            remote: RemoteIo::new(executor, RetryPolicy::default()).with_classifier(classify_exit),
            nodes: NodeTable::default(),
            tags: TagRecorder::new(),
        })
    }

    pub fn with_run_id(mut self, run: impl Into<String>) -> Self {
        self.run = run.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.remote = self.remote.with_retry(retry);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    fn kubectl<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = command([
            "kubectl".to_string(),
            "--kubeconfig".to_string(),
            self.kubeconfig.to_string_lossy().into_owned(),
        ]);
        cmd.extend(args.into_iter().map(Into::into));
        cmd
    }

    fn exec_in(&self, pod: &str, container: &str, stdin: bool, args: &[String]) -> Vec<String> {
        let mut cmd = self.kubectl(["exec"]);
        if stdin {
            cmd.push("-i".to_string());
        }
        cmd.extend(command([pod, "-c", container, "--"]));
        cmd.extend(args.iter().cloned());
        cmd
    }

    // ── Manifests ───────────────────────────────────────────────────

    fn manifest(&self, count: usize) -> Value {
        let items: Vec<Value> = (0..count).map(|index| self.pod_manifest(index)).collect();
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": items,
        })
    }

    fn pod_manifest(&self, index: usize) -> Value {
        let name = node_name(&self.run, index);
        let options = self.options.for_node(&name, POD_IP);

        let ports: Vec<Value> = options
            .ports
            .iter()
            .map(|p| {
                let protocol = match p.protocol() {
                    Protocol::Tcp => "TCP",
                    Protocol::Udp => "UDP",
                };
                json!({ "containerPort": p.value(), "protocol": protocol })
            })
            .collect();

        let mut node = json!({
            "name": NODE_CONTAINER,
            "image": options.image,
            "args": options.args,
            "ports": ports,
            "env": [{
                "name": "POD_IP",
                "valueFrom": { "fieldRef": { "fieldPath": "status.podIP" } },
            }],
        });
        if !options.cmd.is_empty() {
            node["command"] = json!(options.cmd);
        }
        if let Some(resources) = options.resources {
            node["resources"] = json!({
                "requests": {
                    "cpu": resources.cpu_quantity(),
                    "memory": resources.memory_quantity(),
                },
            });
        }
        if let Some(port) = options.tcp_ports().next() {
            node["readinessProbe"] = json!({
                "tcpSocket": { "port": port },
                "periodSeconds": 1,
            });
        }

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (i, tmpfs) in options.tmpfs.iter().enumerate() {
            let volume = format!("tmpfs-{i}");
            mounts.push(json!({ "name": volume, "mountPath": tmpfs.destination }));
            volumes.push(json!({
                "name": volume,
                "emptyDir": { "medium": "Memory", "sizeLimit": tmpfs.size.to_string() },
            }));
        }
        if !mounts.is_empty() {
            node["volumeMounts"] = json!(mounts);
        }

        let monitor = json!({
            "name": MONITOR,
            "image": options.monitor_image,
            "securityContext": { "capabilities": { "add": ["NET_ADMIN"] } },
        });

        let mut spec = json!({
            "shareProcessNamespace": true,
            "restartPolicy": "Never",
            "containers": [node, monitor],
        });
        if !volumes.is_empty() {
            spec["volumes"] = json!(volumes);
        }
        if let Some(placement) = options.topology.placement() {
            spec["affinity"] = json!({
                "nodeAffinity": {
                    "requiredDuringSchedulingIgnoredDuringExecution": {
                        "nodeSelectorTerms": [{
                            "matchExpressions": [{
                                "key": placement.key,
                                "operator": "In",
                                "values": placement.values,
                            }],
                        }],
                    },
                },
            });
        }

        let labels = BTreeMap::from([
            (RUN_LABEL, self.run.clone()),
            (INDEX_LABEL, index.to_string()),
        ]);
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "labels": labels },
            "spec": spec,
        })
    }

    // ── Cluster state ───────────────────────────────────────────────

    async fn wait_ready(&self) -> Result<()> {
        let timeout = self.options.deploy_timeout;
        let selector = run_selector(&self.run);
        let cmd = self.kubectl([
            "wait".to_string(),
            "--for=condition=Ready".to_string(),
            "pod".to_string(),
            "-l".to_string(),
            selector,
            format!("--timeout={}s", timeout.as_secs().max(1)),
        ]);

        tokio::time::timeout(timeout + WAIT_GRACE, self.remote.invoke(&cmd, None))
            .await
            .map_err(|_| SimError::deployment(format!("pods not ready after {timeout:?}")))?
            .map_err(|e| SimError::deployment(format!("pods not ready: {e}")))?;
        Ok(())
    }

    /// Reads back the pods of the run, ordered by index.
    async fn fetch_nodes(&self, count: usize) -> Result<Vec<NodeInfo>> {
        let selector = run_selector(&self.run);
        let out = self
            .remote
            .query(&self.kubectl(["get", "pods", "-l", selector.as_str(), "-o", "json"]))
            .await?;
        let pods: PodList = serde_json::from_str(&out)?;

        let mut nodes = Vec::with_capacity(pods.items.len());
        for pod in pods.items {
            let name = pod.metadata.name;
            let index = pod
                .metadata
                .labels
                .get(INDEX_LABEL)
                .and_then(|v| v.parse::<usize>().ok())
                .ok_or_else(|| SimError::deployment(format!("pod {name} has no {INDEX_LABEL} label")))?;
            let address = pod
                .status
                .pod_ip
                .filter(|ip| !ip.is_empty())
                .ok_or_else(|| SimError::deployment(format!("pod {name} has no address")))?;
            nodes.push(NodeInfo {
                name,
                address,
                index,
            });
        }
        nodes.sort_by_key(|n| n.index);

        if nodes.len() != count {
            return Err(SimError::deployment(format!(
                "expected {count} pods, found {}",
                nodes.len()
            )));
        }
        if let Some((expected, node)) = nodes.iter().enumerate().find(|(i, n)| n.index != *i) {
            let reason = if node.index < expected {
                format!("pod {} repeats {INDEX_LABEL} {}", node.name, node.index)
            } else {
                format!("no pod has {INDEX_LABEL} {expected}")
            };
            return Err(SimError::deployment(reason));
        }
        Ok(nodes)
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
}

impl std::fmt::Debug for KubernetesStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesStrategy")
            .field("run", &self.run)
            .field("kubeconfig", &self.kubeconfig)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SimIo for KubernetesStrategy {
    async fn exec(&self, node: &str, args: &[String], options: ExecOptions<'_>) -> Result<()> {
        let node = self.nodes.find(node)?;
        let cmd = self.exec_in(&node.name, NODE_CONTAINER, false, args);
        self.remote.exec(&node.name, &cmd, options).await
    }

    fn read(&self, node: &str, path: &str) -> Result<PipeReader> {
        let node = self.nodes.find(node)?;
        let cmd = self.exec_in(&node.name, NODE_CONTAINER, false, &command(["cat", path]));
        Ok(self.remote.read(&node.name, cmd))
    }

    fn write(
        &self,
        node: &str,
        container: Option<&str>,
        cmd: &[String],
    ) -> Result<(PipeWriter, Completion)> {
        let node = self.nodes.find(node)?;
        let line = self.exec_in(&node.name, container.unwrap_or(NODE_CONTAINER), true, cmd);
        Ok(self.remote.write(&node.name, line))
    }

    fn tag(&self, node: &str) {
        self.tags.record(node);
    }
}

#[async_trait]
impl Strategy for KubernetesStrategy {
    fn name(&self) -> &str {
        "kubernetes"
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

        let count = topology.len();
        tracing::info!(run = %self.run, nodes = count, image = %self.options.image, "deploying on kubernetes");

        let manifest = serde_json::to_vec(&self.manifest(count))?;
        self.remote
            .invoke(&self.kubectl(["apply", "-f", "-"]), Some(&manifest))
            .await?;

        self.wait_ready().await?;
        let nodes = self.fetch_nodes(count).await?;
        self.nodes.set(nodes.clone());

        apply_topology(&self.remote, topology.as_ref(), &nodes, |node, tc| {
            self.exec_in(&node.name, MONITOR, false, &tc)
        })
        .await?;

        tracing::info!(run = %self.run, nodes = count, "fleet ready");
        Ok(nodes)
    }

    fn tags(&self) -> BTreeMap<i64, String> {
        self.tags.snapshot()
    }

    async fn collect_logs(&self) -> Result<HashMap<String, Bytes>> {
        let nodes = self.nodes.all();
        let fetches = nodes.iter().map(|node| async move {
            let cmd = self.kubectl(["logs", node.name.as_str(), "-c", MONITOR]);
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
        let selector = run_selector(&self.run);
        let cmd = self.kubectl(["delete", "pods", "-l", selector.as_str(), "--ignore-not-found"]);
        self.nodes.clear();
        self.remote
            .invoke(&cmd, None)
            .await
            .map_err(|e| SimError::Teardown(e.to_string()))?;
        tracing::info!(run = %self.run, "kubernetes resources cleaned");
        Ok(())
    }
}
