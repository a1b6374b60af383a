use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides the public listening port
pub const PORT_ENV: &str = "PORT";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Backends in launch and route registration order
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080, `$PORT` takes precedence)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Body returned by `GET /`
    #[serde(default = "default_health_message")]
    pub health_message: String,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            health_message: default_health_message(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Max seconds to wait for backend response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Poll each backend port after launch until it accepts connections
    #[serde(default)]
    pub wait_for_ready: bool,

    /// Upper bound for the readiness poll in seconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            wait_for_ready: false,
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

/// How a backend's standard output and error are handled
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Child writes straight to the gateway's streams (default)
    #[default]
    Inherit,
    /// Lines are read by the gateway and re-emitted with a `[name:port]` prefix
    Capture,
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the gateway's permissions.
/// Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Name used in logs and in captured output prefixes
    pub name: String,

    /// Executable to launch
    pub command: String,

    /// Arguments; `{port}` is replaced with the backend port
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables (the gateway's environment is inherited)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Private port the backend listens on
    pub port: u16,

    /// Environment variable carrying the port to the child
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Mount point proxied to this backend
    pub path_prefix: String,

    /// Tunnel WebSocket/Upgrade requests (default: true)
    #[serde(default = "default_true")]
    pub websocket: bool,

    #[serde(default)]
    pub stdio: StdioMode,

    /// Request timeout in seconds (overrides default)
    pub request_timeout_secs: Option<u64>,
}

impl BackendConfig {
    /// Create a backend config with defaults for everything optional
    pub fn new(name: &str, command: &str, port: u16, path_prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            port,
            port_env: default_port_env(),
            path_prefix: path_prefix.to_string(),
            websocket: true,
            stdio: StdioMode::default(),
            request_timeout_secs: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn request_timeout(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(defaults.request_timeout_secs),
        )
    }

    /// Arguments with the `{port}` placeholder expanded
    pub fn resolved_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Backend with empty 'name'".to_string());
        }
        if self.command.trim().is_empty() {
            return Err(format!("Backend '{}': 'command' must not be empty", self.name));
        }
        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                self.name
            ));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(format!(
                "Backend '{}': 'path_prefix' must start with '/'",
                self.name
            ));
        }
        if self.port_env.is_empty() {
            return Err(format!("Backend '{}': 'port_env' must not be empty", self.name));
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_health_message() -> String {
    "Gateway is running.".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    60
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_port_env() -> String {
    PORT_ENV.to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a `$PORT` value on top of the file configuration
    pub fn apply_port_override(&mut self, value: Option<&str>) -> anyhow::Result<()> {
        if let Some(raw) = value {
            let port = raw
                .trim()
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", PORT_ENV, raw, e))?;
            self.server.port = port;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        for backend in &self.backends {
            if let Err(e) = backend.validate() {
                errors.push(e);
            }
            if !names.insert(backend.name.as_str()) {
                errors.push(format!("Backend name '{}' is used more than once", backend.name));
            }
            if !ports.insert(backend.port) {
                errors.push(format!(
                    "Backend '{}': port {} is already assigned",
                    backend.name, backend.port
                ));
            }
            if backend.port == self.server.port {
                errors.push(format!(
                    "Backend '{}': port {} collides with the public port",
                    backend.name, backend.port
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
