use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the router's listen port
pub const ENV_PORT: &str = "EDGE_RUNTIME_PORT";
/// Environment variable overriding the router's bind address
pub const ENV_BIND: &str = "EDGE_RUNTIME_BIND";
/// Environment variable holding the function catalog
pub const ENV_FUNCTIONS: &str = "EDGE_FUNCTIONS";
/// Environment variable overriding the functions directory
pub const ENV_FUNCTIONS_DIR: &str = "EDGE_FUNCTIONS_DIR";
/// Environment variable overriding the first worker port
pub const ENV_BASE_PORT: &str = "EDGE_WORKER_BASE_PORT";
/// Environment variable overriding the host workers are reached on
pub const ENV_WORKER_HOST: &str = "EDGE_WORKER_HOST";
/// Environment variable overriding the runtime executable
pub const ENV_RUNTIME_COMMAND: &str = "EDGE_RUNTIME_COMMAND";
/// Environment variable overriding the runtime arguments (shell-words syntax)
pub const ENV_RUNTIME_ARGS: &str = "EDGE_RUNTIME_ARGS";

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Router listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Function catalog and worker addressing
    #[serde(default)]
    pub functions: FunctionsConfig,

    /// How worker processes are launched and supervised
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the router listens on (default: 9000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Upper bound on a single forwarded request, unset means no limit
    pub request_timeout_secs: Option<u64>,

    /// Maximum idle connections kept per worker (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FunctionsConfig {
    /// Function catalog, in the order it is reported
    #[serde(default)]
    pub names: Vec<String>,

    /// Directory holding one `{name}/index.*` per function
    #[serde(default = "default_functions_dir")]
    pub dir: PathBuf,

    /// First port handed to a worker (default: 9100)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Host used to reach workers (default: localhost)
    #[serde(default = "default_worker_host")]
    pub worker_host: String,
}

impl FunctionsConfig {
    /// The catalog with duplicates removed, first occurrence wins
    pub fn catalog(&self) -> Vec<String> {
        let mut catalog: Vec<String> = Vec::with_capacity(self.names.len());
        for name in &self.names {
            if !catalog.contains(name) {
                catalog.push(name.clone());
            }
        }
        catalog
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            dir: default_functions_dir(),
            base_port: default_base_port(),
            worker_host: default_worker_host(),
        }
    }
}

/// Worker launch settings
///
/// # Security Warning
///
/// Workers run whatever source sits in the functions directory, and the
/// default arguments grant the runtime full OS access (`--allow-all`). The
/// catalog is treated as a closed, pre-vetted set. Tighten `args` if that
/// does not hold for your deployment.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Runtime executable (default: deno)
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Arguments selecting "run source from stdin" (default: run --allow-all -)
    #[serde(default = "default_runtime_args")]
    pub args: Vec<String>,

    /// Extra environment variables for workers, on top of the router's own
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long a worker may take to start listening (default: 10)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds (default: 50)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Extra settling delay after the first successful probe (default: 0)
    #[serde(default)]
    pub settle_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL at shutdown (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl RuntimeConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            args: default_runtime_args(),
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            probe_interval_ms: default_probe_interval(),
            settle_ms: 0,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    9000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_functions_dir() -> PathBuf {
    PathBuf::from("/home/deno/functions")
}

fn default_base_port() -> u16 {
    9100
}

fn default_worker_host() -> String {
    "localhost".to_string()
}

fn default_runtime_command() -> String {
    "deno".to_string()
}

fn default_runtime_args() -> Vec<String> {
    vec!["run".to_string(), "--allow-all".to_string(), "-".to_string()]
}

fn default_startup_timeout() -> u64 {
    10
}

fn default_probe_interval() -> u64 {
    50
}

fn default_shutdown_grace_period() -> u64 {
    5
}

/// Parse a function list: either a JSON array or names separated by commas
/// and/or whitespace
pub fn parse_function_list(raw: &str) -> anyhow::Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let names: Vec<String> = serde_json::from_str(trimmed)
            .map_err(|e| anyhow::anyhow!("{} is not a valid JSON array: {}", ENV_FUNCTIONS, e))?;
        return Ok(names);
    }

    Ok(trimmed
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect())
}

fn parse_port(var: &str, value: &str) -> anyhow::Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{} must be a port number, got '{}': {}", var, value, e))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build a configuration from defaults and the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = parse_port(ENV_PORT, &port)?;
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Some(names) = lookup(ENV_FUNCTIONS) {
            self.functions.names = parse_function_list(&names)?;
        }
        if let Some(dir) = lookup(ENV_FUNCTIONS_DIR) {
            self.functions.dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(ENV_BASE_PORT) {
            self.functions.base_port = parse_port(ENV_BASE_PORT, &port)?;
        }
        if let Some(host) = lookup(ENV_WORKER_HOST) {
            self.functions.worker_host = host;
        }
        if let Some(command) = lookup(ENV_RUNTIME_COMMAND) {
            self.runtime.command = command;
        }
        if let Some(args) = lookup(ENV_RUNTIME_ARGS) {
            self.runtime.args = shell_words::split(&args)
                .map_err(|e| anyhow::anyhow!("{} could not be parsed: {}", ENV_RUNTIME_ARGS, e))?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for name in &self.functions.names {
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                errors.push(format!("invalid function name '{}'", name));
            }
        }

        if self.functions.base_port == 0 {
            errors.push("'functions.base_port' must be greater than 0".to_string());
        }

        // Worker ports grow upward from the base and must never reach the router
        if self.functions.base_port != 0 && self.functions.base_port <= self.server.port {
            errors.push(format!(
                "'functions.base_port' ({}) must be greater than 'server.port' ({})",
                self.functions.base_port, self.server.port
            ));
        }

        if self.functions.worker_host.is_empty() {
            errors.push("'functions.worker_host' must not be empty".to_string());
        }

        if self.runtime.command.is_empty() {
            errors.push("'runtime.command' must not be empty".to_string());
        }

        if self.runtime.probe_interval_ms == 0 {
            errors.push("'runtime.probe_interval_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
