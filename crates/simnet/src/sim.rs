//! Simulation engine.
//!
//! Drives one [`Round`] against a fleet deployed by a [`Strategy`]:
//!
//! ```text
//! Idle ─► Deployed ─► BeforeRun ─► Executing ─► AfterRun ─► Collecting ─► CleanedUp
//!            │            │            │            │            ▲
//!            └────────────┴────────────┴────────────┴────────────┘  (on failure)
//! ```
//!
//! Collection and cleanup always run once a deploy was attempted, and
//! never replace the error that ended the round.

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::error::{Result, SimError};
use crate::files::FileValues;
use crate::metrics::{self, Stats, Window};
use crate::node::NodeInfo;
use crate::strategy::{SimIo, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Deployed,
    BeforeRun,
    Executing,
    AfterRun,
    Collecting,
    CleanedUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Deployed => "deployed",
            Phase::BeforeRun => "before",
            Phase::Executing => "executing",
            Phase::AfterRun => "after",
            Phase::Collecting => "collecting",
            Phase::CleanedUp => "cleaned up",
        };
        f.write_str(name)
    }
}

/// User test logic run against a live fleet.
///
/// `before` and `after` are optional. The first callback to fail ends the
/// round; the remaining ones are skipped.
#[async_trait]
pub trait Round: Send {
    async fn before(&mut self, _io: &dyn SimIo, _nodes: &[NodeInfo]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&mut self, io: &dyn SimIo, nodes: &[NodeInfo]) -> anyhow::Result<()>;

    async fn after(&mut self, _io: &dyn SimIo, _nodes: &[NodeInfo]) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Simulation {
    round: Box<dyn Round>,
    strategy: Box<dyn Strategy>,
    phase: Phase,
    files: FileValues,
    stats: Option<Stats>,
}

impl Simulation {
    pub fn new(round: impl Round + 'static, strategy: impl Strategy + 'static) -> Self {
        Self {
            round: Box::new(round),
            strategy: Box::new(strategy),
            phase: Phase::Idle,
            files: FileValues::default(),
            stats: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Values decoded by the file mappers during the last run.
    pub fn files(&self) -> &FileValues {
        &self.files
    }

    /// Report of the last run, when one was produced.
    pub fn stats(&self) -> Option<&Stats> {
        self.stats.as_ref()
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    /// Deploys, runs the round, collects results and cleans up.
    ///
    /// Returns the first failure among deploy and the round callbacks.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(strategy = self.strategy.name(), "starting simulation");

        let nodes = match self.strategy.deploy().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(error = %e, "deployment failed");
                self.clean().await;
                return Err(match e {
                    SimError::Deployment { .. } => e,
                    other => SimError::deployment(other.to_string()),
                });
            }
        };
        self.enter(Phase::Deployed);
        tracing::info!(nodes = nodes.len(), "fleet deployed");

        let start = unix_now();
        let outcome = self.play(&nodes).await;
        let window = Window::new(start, unix_now());
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "round failed");
        }

        self.enter(Phase::Collecting);
        self.map_files(&nodes).await;
        self.collect_stats(window).await;

        self.clean().await;
        outcome
    }

    async fn play(&mut self, nodes: &[NodeInfo]) -> Result<()> {
        let io = self.strategy.io();

        self.phase = Phase::BeforeRun;
        tracing::info!(phase = %self.phase, "phase");
        self.round
            .before(io, nodes)
            .await
            .map_err(|source| SimError::Round {
                phase: Phase::BeforeRun,
                source,
            })?;

        self.phase = Phase::Executing;
        tracing::info!(phase = %self.phase, "phase");
        self.round
            .execute(io, nodes)
            .await
            .map_err(|source| SimError::Round {
                phase: Phase::Executing,
                source,
            })?;

        self.phase = Phase::AfterRun;
        tracing::info!(phase = %self.phase, "phase");
        self.round
            .after(io, nodes)
            .await
            .map_err(|source| SimError::Round {
                phase: Phase::AfterRun,
                source,
            })
    }

    /// Runs every file mapper once per node. Failures are logged.
    async fn map_files(&mut self, nodes: &[NodeInfo]) {
        let mappers = self.strategy.options().files.clone();
        for (key, mapper) in mappers {
            for node in nodes {
                let mut content = Vec::new();
                let read = match self.strategy.read(&node.name, &mapper.path) {
                    Ok(mut reader) => reader.read_to_end(&mut content).await.map_err(SimError::from),
                    Err(e) => Err(e),
                };
                let decoded = read.map_err(anyhow::Error::from).and_then(|_| mapper.decode(&content));
                match decoded {
                    Ok(value) => self.files.insert(key.clone(), node.name.clone(), value),
                    Err(e) => tracing::warn!(
                        key = %key,
                        node = %node.name,
                        path = %mapper.path,
                        error = %e,
                        "file mapping failed"
                    ),
                }
            }
        }
    }

    /// Shapes the monitor logs into the report and writes it. Failures are
    /// logged.
    async fn collect_stats(&mut self, window: Window) {
        let logs = match self.strategy.collect_logs().await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(error = %e, "collecting monitor logs failed");
                Default::default()
            }
        };

        let stats = metrics::shape(&logs, window, self.strategy.tags());
        let dir = self.strategy.options().output_dir.clone();
        if let Err(e) = stats.write_report(&dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "writing stats report failed");
        }
        self.stats = Some(stats);
    }

    async fn clean(&mut self) {
        if let Err(e) = self.strategy.clean().await {
            tracing::error!(error = %e, "teardown failed");
        }
        self.enter(Phase::CleanedUp);
    }

    fn enter(&mut self, phase: Phase) {
        tracing::info!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("strategy", &self.strategy.name())
            .field("phase", &self.phase)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
