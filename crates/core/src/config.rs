//! Node configuration: file format, defaults and command line overrides.
//!
//! A node reads an optional TOML file; every field has a default so an empty
//! file (or none at all) yields a runnable loopback node. Command line flags
//! given through [`ConfigArgs`] win over file values.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Default gap after which the event loop services its timers.
pub const DEFAULT_EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);
/// Default signalling port (GTPv2-C).
pub const DEFAULT_SIGNALLING_PORT: u16 = 2123;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Label used in logs and thread names.
    pub name: String,
    /// Signalling endpoints. The first one is the default source of
    /// outgoing requests.
    pub listen: Vec<SocketAddr>,
    /// Peers the node talks to on its own initiative.
    pub peers: Vec<SocketAddr>,
    pub event_wait_timeout_ms: u64,
    pub queue_capacity: usize,
    pub queue_post_timeout_ms: u64,
    pub timer_capacity: usize,
    pub echo_interval_ms: u64,
    pub xact: XactConfig,
    pub sbi: SbiConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "nf".into(),
            listen: vec![default_listen_address()],
            peers: Vec::new(),
            event_wait_timeout_ms: DEFAULT_EVENT_WAIT_TIMEOUT.as_millis() as u64,
            queue_capacity: 1024,
            queue_post_timeout_ms: 100,
            // one retry or hold timer per transaction, plus application timers
            timer_capacity: 8192 + 1024,
            echo_interval_ms: 60_000,
            xact: XactConfig::default(),
            sbi: SbiConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: NodeConfig = toml::from_str(&raw)?;
        tracing::debug!(?path, "loaded node configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "event-wait-timeout-ms must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue-capacity must be greater than zero".into()));
        }
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("at least one listen address is required".into()));
        }
        if self.timer_capacity < self.xact.capacity.max(1) {
            return Err(ConfigError::Invalid(format!(
                "timer-capacity ({}) must be at least xact.capacity ({})",
                self.timer_capacity, self.xact.capacity
            )));
        }
        self.xact.validate()
    }

    pub fn event_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.event_wait_timeout_ms)
    }

    pub fn queue_post_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_post_timeout_ms)
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_millis(self.echo_interval_ms)
    }
}

/// Retransmission and table limits of the transaction manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct XactConfig {
    /// Time between a send of a request and its next retransmission.
    pub retry_interval_ms: u64,
    /// Retransmissions after the first send. A request is sent
    /// `max_retries + 1` times and declared timed out one interval after the
    /// last copy, so an unanswered transaction lives for
    /// `(max_retries + 1) × retry_interval`.
    pub max_retries: u8,
    /// How long an answered inbound request keeps its cached response.
    /// Defaults to the full retransmission window of the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_ms: Option<u64>,
    pub max_per_peer: usize,
    pub capacity: usize,
    pub min_id: u32,
    pub max_id: u32,
}

impl Default for XactConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 3000,
            max_retries: 3,
            hold_ms: None,
            max_per_peer: 1024,
            capacity: 8192,
            min_id: 1,
            max_id: 0x7f_ffff,
        }
    }
}

impl XactConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn hold(&self) -> Duration {
        match self.hold_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.retry_interval() * (u32::from(self.max_retries) + 1),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_id == 0 || self.min_id > self.max_id {
            return Err(ConfigError::Invalid(format!(
                "xact id range [{}, {}] is empty or includes the reserved id 0",
                self.min_id, self.max_id
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "xact.retry-interval-ms must be greater than zero".into(),
            ));
        }
        if self.max_per_peer == 0 || self.capacity < self.max_per_peer {
            return Err(ConfigError::Invalid(format!(
                "xact.capacity ({}) must be at least xact.max-per-peer ({}) and non-zero",
                self.capacity, self.max_per_peer
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SbiBackendKind {
    #[default]
    Http,
    Loopback,
}

/// Service interface registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SbiConfig {
    pub backend: SbiBackendKind,
    /// Servers registered at start-up. Empty leaves the registry unused.
    pub listen: Vec<SocketAddr>,
    pub server_capacity: usize,
    pub session_pool: usize,
    pub response_timeout_ms: u64,
}

impl Default for SbiConfig {
    fn default() -> Self {
        Self {
            backend: SbiBackendKind::default(),
            listen: Vec::new(),
            server_capacity: 64,
            session_pool: 1024,
            response_timeout_ms: 30_000,
        }
    }
}

impl SbiConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

pub fn default_listen_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SIGNALLING_PORT)
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to a TOML configuration file.
    #[arg(long, env = "NF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node label used in logs.
    #[arg(long, env = "NF_NAME")]
    pub name: Option<String>,

    /// Signalling address to bind. Repeat for several sockets.
    #[arg(long = "listen", env = "NF_LISTEN", value_delimiter = ',')]
    pub listen: Vec<SocketAddr>,

    /// Peer to exchange echo requests with. Repeat for several peers.
    #[arg(long = "peer", env = "NF_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<tracing::level_filters::LevelFilter>,

    #[arg(long, value_enum, env = "NF_SBI_BACKEND")]
    pub sbi_backend: Option<SbiBackendKind>,

    /// Service interface address to serve. Repeat for several servers.
    #[arg(long = "sbi-listen", env = "NF_SBI_LISTEN", value_delimiter = ',')]
    pub sbi_listen: Vec<SocketAddr>,
}

impl ConfigArgs {
    /// Reads the config file if one was given, applies the command line on
    /// top and validates the result.
    pub fn build(self) -> Result<NodeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(name) = self.name {
            config.name = name;
        }
        if !self.listen.is_empty() {
            config.listen = self.listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(backend) = self.sbi_backend {
            config.sbi.backend = backend;
        }
        if !self.sbi_listen.is_empty() {
            config.sbi.listen = self.sbi_listen;
        }
        config.validate()?;
        Ok(config)
    }
}
