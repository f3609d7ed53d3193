use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::{Result, bail};
use clap::Parser;
use serde::Deserialize;

/// Master identity configuration.
///
/// Present iff this node IS the Master of the fabric: the local node id
/// and the master id are both set to `nodeid`, and the node asserts the
/// listed realms.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Master {
    pub nodeid: String,
    ///
    /// realms owned by the Master
    ///
    /// administrative scope names qualifying protocols. only the Master
    /// asserts realms originally, every other node learns them during
    /// upstream establishment.
    ///
    #[serde(default)]
    pub realms: Vec<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    ///
    /// local node id
    ///
    /// opaque string identifying this node, globally unique within the
    /// fabric. required for every non-master node.
    ///
    #[serde(default)]
    pub nodeid: Option<String>,
    ///
    /// upstream url
    ///
    /// websocket url of the parent node to hold the single upstream
    /// session toward, e.g. "ws://parent.example.com:2323". the Master
    /// has no upstream.
    ///
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ws {
    ///
    /// websocket listen address
    ///
    /// where downstream sessions from child nodes are accepted. omit on
    /// leaf nodes that accept no children.
    ///
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// Maximum number of worker threads dispatching inbound RPCs.
    ///
    #[serde(default = "Runtime::max_threads")]
    pub max_threads: usize,
    ///
    /// Per-request deadline in seconds; requests without a response by
    /// then report a timeout to their callback.
    ///
    #[serde(default = "Runtime::request_timeout")]
    pub request_timeout: u64,
}

impl Runtime {
    fn max_threads() -> usize {
        std::thread::available_parallelism()
            .map(|threads| threads.get())
            .unwrap_or(1)
    }

    fn request_timeout() -> u64 {
        service::DEFAULT_REQUEST_TIMEOUT
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            max_threads: Self::max_threads(),
            request_timeout: Self::request_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub master: Option<Master>,
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub ws: Ws,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: blade-server --config /etc/blade/config.json5
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    pub fn load() -> Result<Self> {
        Self::parse_str(&read_to_string(&Cli::parse().config)?)
    }

    fn parse_str(source: &str) -> Result<Self> {
        let config: Self = serde_json5::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.master.is_some() && self.node.upstream.is_some() {
            bail!("a master node holds no upstream session");
        }

        if self.master.is_none() && self.node.nodeid.is_none() {
            bail!("node.nodeid is required for a non-master node");
        }

        Ok(())
    }

    /// The node id this process runs under.
    pub fn local_nodeid(&self) -> &str {
        match &self.master {
            Some(master) => &master.nodeid,
            None => self.node.nodeid.as_deref().unwrap_or_default(),
        }
    }
}
