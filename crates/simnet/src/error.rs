//! Error taxonomy of the harness.

use thiserror::Error;

use crate::io::StreamError;
use crate::sim::Phase;
use simnet_network::TopologyError;

pub type Result<T, E = SimError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SimError {
    /// The fleet never reached a ready state.
    #[error("deployment failed: {reason}")]
    Deployment { reason: String },

    /// A round callback returned a failure.
    #[error("round failed during {phase}: {source:#}")]
    Round {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    /// The node could not be reached or the stream broke.
    #[error("transport failure on {node}: {source}")]
    Transport {
        node: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote command ran but exited with a non-zero status.
    #[error("command on {node} exited with status {code}{}", detail(.output))]
    RemoteExit {
        node: String,
        code: i32,
        output: String,
    },

    /// A control-plane command of the backend (docker, kubectl) failed.
    #[error("backend command `{command}` failed: {detail}")]
    Backend { command: String, detail: String },

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    /// The stats report could not be stored or loaded.
    #[error("metrics collection failed: {0}")]
    Metrics(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn deployment(reason: impl Into<String>) -> Self {
        SimError::Deployment {
            reason: reason.into(),
        }
    }

    /// Attaches node context and captured output to an executor failure.
    pub(crate) fn from_stream(node: &str, err: StreamError, output: String) -> Self {
        match err {
            StreamError::Exit(code) => SimError::RemoteExit {
                node: node.to_string(),
                code,
                output,
            },
            StreamError::Transport(source) if output.is_empty() => SimError::Transport {
                node: node.to_string(),
                source,
            },
            StreamError::Transport(source) => SimError::Transport {
                node: node.to_string(),
                source: std::io::Error::new(source.kind(), format!("{source}: {output}")),
            },
        }
    }

    /// True for failures of the remote command itself, as opposed to the
    /// path used to reach it.
    pub fn is_remote_exit(&self) -> bool {
        matches!(self, SimError::RemoteExit { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, SimError::Transport { .. })
    }
}

fn detail(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(": {output}")
    }
}
