//! simnet demo
//!
//! Deploys a small fleet on Docker or Kubernetes and runs one of the
//! example rounds against it:
//!
//! - `nginx`: fetches the index page of every node over HTTP
//! - `hostname`: checks every node's identity through exec, write and read

mod rounds;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use simnet::network::{CloudTopology, SimpleTopology};
use simnet::{
    DockerStrategy, FileMapper, FilesKey, KubernetesStrategy, Options, OptionsBuilder, Port,
    Round, Simulation, Strategy, MB,
};
use tracing_subscriber::EnvFilter;

use rounds::{HostnameRound, NginxRound, HOSTNAME_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Nginx,
    Hostname,
}

/// Run an example simnet round.
#[derive(Parser, Debug)]
#[command(name = "simnet-demo", about = "Run an example simnet round")]
struct Cli {
    /// Where the fleet is deployed.
    #[arg(long, value_enum, default_value_t = Backend::Docker)]
    backend: Backend,

    /// Round to run.
    #[arg(long, value_enum, default_value_t = Scenario::Nginx)]
    round: Scenario,

    /// Kubeconfig used by the kubernetes backend (default ~/.kube/config).
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Number of nodes.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// One-way latency between nodes, in milliseconds.
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,

    /// Restrict kubernetes pods to hosts whose label KEY=VALUE matches.
    #[arg(long, value_name = "KEY=VALUE")]
    placement: Option<String>,

    /// Report directory (default ~/.config/simnet).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Readiness deadline in seconds.
    #[arg(long, default_value_t = 60)]
    deploy_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(
        backend = ?cli.backend,
        round = ?cli.round,
        nodes = cli.nodes,
        latency_ms = cli.latency_ms,
        "simnet-demo starting"
    );

    let options = options(&cli)?;
    match cli.round {
        Scenario::Nginx => run(&cli, NginxRound::default(), options).await,
        Scenario::Hostname => run(&cli, HostnameRound::default(), options).await,
    }
}

fn options(cli: &Cli) -> anyhow::Result<Options> {
    let mut builder = match cli.round {
        Scenario::Nginx => Options::builder()
            .image("nginx:alpine", vec![], vec![], [Port::tcp(80)])
            .tmpfs("/storage", 64 * MB),
        Scenario::Hostname => Options::builder()
            .image(
                "alpine:3",
                vec![],
                vec!["sleep".into(), "infinity".into()],
                [],
            )
            .file_mapper(
                FilesKey::new(HOSTNAME_KEY),
                FileMapper::new("/etc/hostname", |bytes| {
                    Ok(String::from_utf8_lossy(bytes).trim().to_string())
                }),
            ),
    };

    builder = match &cli.placement {
        Some(placement) => {
            let (key, value) = placement
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("placement must be KEY=VALUE, got {placement}"))?;
            builder.topology(CloudTopology::new(cli.nodes, key, [value]))
        }
        None => builder.topology(SimpleTopology::new(
            cli.nodes,
            Duration::from_millis(cli.latency_ms),
        )),
    };

    Ok(with_output(builder, cli.output.clone())
        .deploy_timeout(Duration::from_secs(cli.deploy_timeout))
        .resources(20, 64 * MB)
        .build())
}

fn with_output(builder: OptionsBuilder, output: Option<PathBuf>) -> OptionsBuilder {
    match output {
        Some(dir) => builder.output(dir),
        None => builder,
    }
}

async fn run(cli: &Cli, round: impl Round + 'static, options: Options) -> anyhow::Result<()> {
    match cli.backend {
        Backend::Docker => simulate(round, DockerStrategy::new(options)).await,
        Backend::Kubernetes => {
            let kubeconfig = cli
                .kubeconfig
                .clone()
                .or_else(|| dirs::home_dir().map(|home| home.join(".kube").join("config")))
                .ok_or_else(|| anyhow::anyhow!("no kubeconfig given and no home directory"))?;
            simulate(round, KubernetesStrategy::new(options, kubeconfig)?).await
        }
    }
}

async fn simulate(round: impl Round + 'static, strategy: impl Strategy + 'static) -> anyhow::Result<()> {
    let output = strategy.options().output_dir.clone();
    let mut sim = Simulation::new(round, strategy);
    let result = sim.run().await;

    if let Some(stats) = sim.stats() {
        for (node, series) in &stats.nodes {
            tracing::info!(node = %node, samples = series.len(), "metrics");
        }
        tracing::info!(dir = %output.display(), tags = stats.tags.len(), "report written");
    }
    for (node, hostname) in sim.files().all::<String>(&FilesKey::new(HOSTNAME_KEY)) {
        tracing::info!(node = %node, hostname = %hostname, "hostname file");
    }

    result?;
    tracing::info!("simulation done");
    Ok(())
}
