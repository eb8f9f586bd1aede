//! Simulation options.
//!
//! [`Options`] is composed once through [`OptionsBuilder`] and then only
//! read by the simulation and its strategy. Each builder setter touches a
//! single field.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use simnet_network::{SimpleTopology, Topology};

use crate::files::{FileMapper, FilesKey};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

const DEFAULT_NODES: usize = 3;
const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MONITOR_IMAGE: &str = "dedis/simnet-monitor:latest";

// ── Ports ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A port exposed by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    protocol: Protocol,
    value: u16,
}

impl Port {
    pub fn tcp(value: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            value,
        }
    }

    pub fn udp(value: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            value,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn value(&self) -> u16 {
        self.value
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.protocol)
    }
}

// ── Mounts and resources ────────────────────────────────────────────

/// In-memory filesystem mounted in every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmpFs {
    pub destination: String,
    pub size: u64,
}

/// Minimum resources requested for every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpu_millis: u32,
    pub memory_bytes: u64,
}

impl Resources {
    /// CPU as a Kubernetes quantity (`"20m"`).
    pub fn cpu_quantity(&self) -> String {
        format!("{}m", self.cpu_millis)
    }

    /// Memory as a Kubernetes quantity, in bytes.
    pub fn memory_quantity(&self) -> String {
        self.memory_bytes.to_string()
    }

    /// CPU as relative Docker shares, 1024 per core.
    pub fn cpu_shares(&self) -> u64 {
        (u64::from(self.cpu_millis) * 1024 / 1000).max(2)
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Per-node hook rewriting a node-local copy of the options before the node
/// starts. Receives the node id and its address.
pub type UpdateFn = Arc<dyn Fn(&mut Options, &str, &str) + Send + Sync>;

type HomeResolver = Box<dyn Fn() -> Option<PathBuf>>;

#[derive(Clone)]
pub struct Options {
    pub image: String,
    pub cmd: Vec<String>,
    pub args: Vec<String>,
    pub ports: Vec<Port>,
    pub topology: Arc<dyn Topology>,
    pub output_dir: PathBuf,
    pub files: HashMap<FilesKey, FileMapper>,
    pub tmpfs: Vec<TmpFs>,
    pub resources: Option<Resources>,
    pub update: Option<UpdateFn>,
    pub deploy_timeout: Duration,
    pub monitor_image: String,
}

impl Options {
    /// Builder resolving the default output directory from the user's home.
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::with_home_resolver(dirs::home_dir)
    }

    /// Options as seen by one node, after the update hook ran.
    pub fn for_node(&self, id: &str, address: &str) -> Options {
        let mut options = self.clone();
        if let Some(update) = &self.update {
            update(&mut options, id, address);
        }
        options
    }

    pub fn tcp_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .filter(|p| p.protocol() == Protocol::Tcp)
            .map(Port::value)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("image", &self.image)
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .field("ports", &self.ports)
            .field("topology", &self.topology)
            .field("output_dir", &self.output_dir)
            .field("files", &self.files)
            .field("tmpfs", &self.tmpfs)
            .field("resources", &self.resources)
            .field("update", &self.update.is_some())
            .field("deploy_timeout", &self.deploy_timeout)
            .field("monitor_image", &self.monitor_image)
            .finish()
    }
}

pub struct OptionsBuilder {
    options: Options,
    output: Option<PathBuf>,
    home: HomeResolver,
}

impl OptionsBuilder {
    /// Builder with an explicit home directory lookup, used when no output
    /// directory is given.
    pub fn with_home_resolver(home: impl Fn() -> Option<PathBuf> + 'static) -> Self {
        Self {
            options: Options {
                image: String::new(),
                cmd: Vec::new(),
                args: Vec::new(),
                ports: Vec::new(),
                topology: Arc::new(SimpleTopology::new(DEFAULT_NODES, Duration::ZERO)),
                output_dir: PathBuf::new(),
                files: HashMap::new(),
                tmpfs: Vec::new(),
                resources: None,
                update: None,
                deploy_timeout: DEFAULT_DEPLOY_TIMEOUT,
                monitor_image: DEFAULT_MONITOR_IMAGE.to_string(),
            },
            output: None,
            home: Box::new(home),
        }
    }

    /// Sets the image, its entrypoint override, arguments and exposed ports.
    pub fn image<I>(mut self, image: impl Into<String>, cmd: Vec<String>, args: Vec<String>, ports: I) -> Self
    where
        I: IntoIterator<Item = Port>,
    {
        self.options.image = image.into();
        self.options.cmd = cmd;
        self.options.args = args;
        self.options.ports = ports.into_iter().collect();
        self
    }

    pub fn topology(mut self, topology: impl Topology + 'static) -> Self {
        self.options.topology = Arc::new(topology);
        self
    }

    /// Output directory of the report. An empty path selects the default.
    pub fn output(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.output = (!dir.as_os_str().is_empty()).then_some(dir);
        self
    }

    pub fn file_mapper(mut self, key: FilesKey, mapper: FileMapper) -> Self {
        self.options.files.insert(key, mapper);
        self
    }

    pub fn tmpfs(mut self, destination: impl Into<String>, size: u64) -> Self {
        self.options.tmpfs.push(TmpFs {
            destination: destination.into(),
            size,
        });
        self
    }

    pub fn resources(mut self, cpu_millis: u32, memory_bytes: u64) -> Self {
        self.options.resources = Some(Resources {
            cpu_millis,
            memory_bytes,
        });
        self
    }

    pub fn update(mut self, update: impl Fn(&mut Options, &str, &str) + Send + Sync + 'static) -> Self {
        self.options.update = Some(Arc::new(update));
        self
    }

    pub fn deploy_timeout(mut self, timeout: Duration) -> Self {
        self.options.deploy_timeout = timeout;
        self
    }

    pub fn monitor_image(mut self, image: impl Into<String>) -> Self {
        self.options.monitor_image = image.into();
        self
    }

    pub fn build(self) -> Options {
        let mut options = self.options;
        options.output_dir = match self.output {
            Some(dir) => dir,
            None => {
                let base = (self.home)().unwrap_or_default();
                base.join(".config").join("simnet")
            }
        };
        options
    }
}

impl fmt::Debug for OptionsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsBuilder")
            .field("options", &self.options)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}
