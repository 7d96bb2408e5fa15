use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Top-level configuration, loaded from `codehive.toml` (or an explicit
/// path) with environment-variable overrides applied afterward.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for local frontend development.
    pub dev_mode: bool,
}

/// Configuration consumed by the execution sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Hard wall-clock limit; the container is killed once exceeded.
    pub timeout_secs: u64,
    /// Base image commands run in.
    pub image: String,
    /// Where the snapshot directory is bound inside the container; also the
    /// working directory of the command.
    pub bind_path: String,
    /// Container runtime endpoint (`unix://...` or `tcp://...`). Local
    /// defaults when unset.
    pub docker_host: Option<String>,
    /// Extra environment variables injected into every execution container.
    pub env: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8642,
            db_path: PathBuf::from("codehive.db"),
            dev_mode: false,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            image: "python:3.9-slim".to_string(),
            bind_path: "/app".to_string(),
            docker_host: None,
            env: HashMap::new(),
        }
    }
}

/// Cross-process broadcast transport. With no `url`, events fan out within
/// this process only.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Relay endpoint (`tcp://host:port`), shared by every server process
    /// that should see the same rooms.
    pub url: Option<String>,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            execution: ExecutionConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

/// Raw TOML structure for the config file.
#[derive(Debug, Deserialize)]
struct HiveToml {
    server: Option<ServerSection>,
    execution: Option<ExecutionSection>,
    broker: Option<BrokerSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ExecutionSection {
    timeout_secs: Option<u64>,
    image: Option<String>,
    bind_path: Option<String>,
    docker_host: Option<String>,
    env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct BrokerSection {
    url: Option<String>,
}

impl HiveConfig {
    /// Load configuration. A missing file yields defaults; a present but
    /// invalid file is an error. Environment overrides win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("codehive.toml"));
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: HiveToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.merge(toml);
        } else if path.is_some() {
            anyhow::bail!("Config file {} does not exist", config_path.display());
        }

        config.apply_env();
        Ok(config)
    }

    fn merge(&mut self, toml: HiveToml) {
        if let Some(server) = toml.server {
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(db_path) = server.db_path {
                self.server.db_path = db_path;
            }
            if let Some(dev_mode) = server.dev_mode {
                self.server.dev_mode = dev_mode;
            }
        }
        if let Some(execution) = toml.execution {
            if let Some(timeout_secs) = execution.timeout_secs {
                self.execution.timeout_secs = timeout_secs;
            }
            if let Some(image) = execution.image {
                self.execution.image = image;
            }
            if let Some(bind_path) = execution.bind_path {
                self.execution.bind_path = bind_path;
            }
            if let Some(docker_host) = execution.docker_host {
                self.execution.docker_host = Some(docker_host);
            }
            if let Some(env) = execution.env {
                self.execution.env = env;
            }
        }
        if let Some(broker) = toml.broker
            && let Some(url) = broker.url
        {
            self.broker.url = Some(url);
        }
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var("CODE_EXECUTION_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(secs) => self.execution.timeout_secs = secs,
                Err(_) => warn!(value = %raw, "ignoring unparseable CODE_EXECUTION_TIMEOUT"),
            }
        }
        if let Ok(image) = std::env::var("CODEHIVE_EXECUTION_IMAGE") {
            self.execution.image = image;
        }
        if let Ok(host) = std::env::var("DOCKER_BASE_URL") {
            self.execution.docker_host = Some(host);
        }
        if let Ok(url) = std::env::var("CODEHIVE_BROKER_URL") {
            self.broker.url = Some(url);
        }
    }
}
