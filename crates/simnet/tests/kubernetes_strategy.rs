//! Kubernetes backend against a scripted `kubectl`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use simnet::io::{ExecOptions, RetryPolicy};
use simnet::network::{CloudTopology, SimpleTopology};
use simnet::test_util::{Reply, ScriptedExecutor};
use simnet::{KubernetesStrategy, Options, Port, SimError, SimIo, Strategy};
use tokio::io::AsyncReadExt;

/// Pods as `kubectl get pods -o json` lists them: out of order.
fn pod_list(run: &str, count: usize) -> String {
    let indices: Vec<usize> = (0..count).rev().collect();
    pods_with_indices(run, &indices)
}

fn pods_with_indices(run: &str, indices: &[usize]) -> String {
    let items: Vec<Value> = indices
        .iter()
        .map(|&i| {
            json!({
                "metadata": {
                    "name": format!("{run}-node-{i}"),
                    "labels": { "simnet.run": run, "simnet.index": i.to_string() },
                },
                "status": { "podIP": format!("192.168.7.{}", 10 + i) },
            })
        })
        .collect();
    json!({ "apiVersion": "v1", "kind": "List", "items": items }).to_string()
}

fn fake_kubectl(pods: String) -> Arc<ScriptedExecutor> {
    ScriptedExecutor::new(move |command, _| {
        let words: Vec<&str> = command.iter().map(String::as_str).collect();
        match &words[3..] {
            ["get", "pods", ..] => Reply::ok(pods.clone()),
            ["logs", pod, "-c", "monitor"] => Reply::ok(format!("100,1,1,1,1 {pod}\n")),
            ["exec", pod, "-c", "node", "--", "cat", path] => Reply::ok(format!("{pod}:{path}")),
            ["exec", _, "-c", "node", "--", "fail"] => {
                Reply::exit(2, "fail: bad input\ncommand terminated with exit code 2\n")
            }
            ["exec", _, "-c", "node", "--", "unreachable"] => {
                Reply::exit(1, "error: unable to upgrade connection: container not found (\"node\")")
            }
            _ => Reply::ok(""),
        }
    })
    .shared()
}

fn kubernetes(
    options: Options,
    executor: Arc<ScriptedExecutor>,
) -> (KubernetesStrategy, tempfile::NamedTempFile) {
    let kubeconfig = tempfile::NamedTempFile::new().expect("kubeconfig");
    let strategy = KubernetesStrategy::with_executor(options, kubeconfig.path(), executor)
        .expect("strategy")
        .with_run_id("k8s")
        .with_retry(RetryPolicy::none());
    (strategy, kubeconfig)
}

#[tokio::test]
async fn deploy_applies_waits_and_orders_pods() {
    let executor = fake_kubectl(pod_list("k8s", 3));
    let options = Options::builder()
        .image("nginx:1", vec![], vec![], [Port::tcp(80)])
        .topology(SimpleTopology::new(3, Duration::from_millis(10)).with_loss(1.0))
        .build();
    let (strategy, _kubeconfig) = kubernetes(options, executor.clone());

    let nodes = strategy.deploy().await.expect("deploy");

    let indices: Vec<usize> = nodes.iter().map(|n| n.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(nodes[0].name, "k8s-node-0");
    assert_eq!(nodes[2].address, "192.168.7.12");

    let calls = executor.recorded();
    let apply = calls
        .iter()
        .find(|c| c.command.contains(&"apply".to_string()))
        .expect("apply");
    let manifest: Value = serde_json::from_slice(&apply.stdin).expect("manifest is json");
    assert_eq!(manifest["items"].as_array().map(Vec::len), Some(3));

    assert_eq!(
        executor
            .matching(&["wait", "--for=condition=Ready", "pod", "-l", "simnet.run=k8s", "--timeout=60s"])
            .len(),
        1
    );
    assert_eq!(
        executor
            .matching(&["exec", "k8s-node-1", "-c", "monitor", "--", "tc", "filter"])
            .len(),
        2
    );
}

#[tokio::test]
async fn missing_pods_fail_deploy() {
    let executor = fake_kubectl(pod_list("k8s", 2));
    let options = Options::builder()
        .topology(CloudTopology::new(3, "zone", ["a"]))
        .build();
    let (strategy, _kubeconfig) = kubernetes(options, executor);

    let err = strategy.deploy().await.expect_err("one pod missing");
    assert!(matches!(err, SimError::Deployment { .. }));
    assert!(err.to_string().contains("expected 3 pods, found 2"));
}

#[tokio::test]
async fn gaps_and_repeats_in_pod_indices_are_named() {
    let options = || {
        Options::builder()
            .topology(SimpleTopology::new(3, Duration::ZERO))
            .build()
    };

    let (strategy, _kubeconfig) = kubernetes(options(), fake_kubectl(pods_with_indices("k8s", &[2, 0, 3])));
    let err = strategy.deploy().await.expect_err("index 1 missing");
    assert!(matches!(err, SimError::Deployment { .. }));
    assert!(err.to_string().contains("no pod has simnet.index 1"), "{err}");

    let (strategy, _kubeconfig) = kubernetes(options(), fake_kubectl(pods_with_indices("k8s", &[1, 0, 1])));
    let err = strategy.deploy().await.expect_err("index 1 repeated");
    assert!(err.to_string().contains("pod k8s-node-1 repeats simnet.index 1"), "{err}");
}

#[tokio::test]
async fn exec_separates_remote_exits_from_connection_failures() {
    let executor = fake_kubectl(pod_list("k8s", 1));
    let options = Options::builder()
        .topology(SimpleTopology::new(1, Duration::ZERO))
        .build();
    let (strategy, _kubeconfig) = kubernetes(options, executor);
    strategy.deploy().await.expect("deploy");

    let err = strategy
        .exec("k8s-node-0", &["fail".to_string()], ExecOptions::default())
        .await
        .expect_err("command fails");
    assert!(matches!(err, SimError::RemoteExit { code: 2, .. }), "{err}");
    assert!(err.to_string().contains("fail: bad input"));

    let err = strategy
        .exec("k8s-node-0", &["unreachable".to_string()], ExecOptions::default())
        .await
        .expect_err("connection fails");
    assert!(err.is_transport(), "{err}");
    assert!(err.to_string().contains("unable to upgrade connection"));
}

#[tokio::test]
async fn failed_wait_is_a_deployment_error() {
    let executor = ScriptedExecutor::new(|command, _| {
        if command.iter().any(|w| w == "wait") {
            Reply::exit(1, "error: timed out waiting for the condition on pods/k8s-node-0")
        } else {
            Reply::ok("")
        }
    })
    .shared();
    let (strategy, _kubeconfig) = kubernetes(Options::builder().build(), executor);

    let err = strategy.deploy().await.expect_err("wait fails");
    assert!(matches!(err, SimError::Deployment { .. }));
    assert!(err.to_string().contains("timed out waiting"));
}

#[tokio::test]
async fn round_io_and_logs_use_pod_containers() {
    let executor = fake_kubectl(pod_list("k8s", 2));
    let options = Options::builder()
        .topology(SimpleTopology::new(2, Duration::ZERO))
        .build();
    let (strategy, _kubeconfig) = kubernetes(options, executor.clone());
    strategy.deploy().await.expect("deploy");

    let mut content = String::new();
    strategy
        .read("k8s-node-1", "/etc/hostname")
        .expect("node")
        .read_to_string(&mut content)
        .await
        .expect("read");
    assert_eq!(content, "k8s-node-1:/etc/hostname");

    let logs = strategy.collect_logs().await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(&logs["k8s-node-0"][..], b"100,1,1,1,1 k8s-node-0\n");

    let (writer, done) = strategy
        .write("k8s-node-0", None, &["true".to_string()])
        .expect("node");
    drop(writer);
    done.await.expect("completion");
    assert_eq!(
        executor
            .matching(&["exec", "-i", "k8s-node-0", "-c", "node", "--", "true"])
            .len(),
        1
    );
}

#[tokio::test]
async fn clean_deletes_by_label() {
    let executor = fake_kubectl(pod_list("k8s", 0));
    let (strategy, _kubeconfig) = kubernetes(Options::builder().build(), executor.clone());

    strategy.clean().await.expect("clean");
    strategy.clean().await.expect("clean again");

    assert_eq!(
        executor
            .matching(&["delete", "pods", "-l", "simnet.run=k8s", "--ignore-not-found"])
            .len(),
        2
    );
}
