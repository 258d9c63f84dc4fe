use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding the proxy listen port
pub const PROXY_PORT_ENV: &str = "PROXY_PORT";
/// Environment variable overriding the backend port
pub const BACKEND_PORT_ENV: &str = "BACKEND_PORT";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend process
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the proxy listens on (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Start the backend before accepting the first connection (default: true)
    #[serde(default = "default_warm_up")]
    pub warm_up: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            warm_up: default_warm_up(),
        }
    }
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Working directory for the child process
    pub working_dir: Option<String>,

    /// Extra environment variables for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the backend listens on (default: 8000)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Name of the environment variable that carries the port to the child
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Health endpoint polled during startup
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Number of readiness probes before giving up
    #[serde(default = "default_health_attempts")]
    pub health_check_attempts: u32,

    /// Timeout for a single readiness probe in milliseconds
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: None,
            env: HashMap::new(),
            port: default_backend_port(),
            port_env: default_port_env(),
            health_path: default_health_path(),
            health_check_interval_ms: default_health_interval(),
            health_check_attempts: default_health_attempts(),
            health_check_timeout_ms: default_health_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl BackendConfig {
    /// Create a backend config for the given command and port, everything else default
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            ..Self::default()
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

    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Base URL of the backend on the loopback interface
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Full URL of the readiness endpoint
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }

    /// Validate this backend configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("backend: 'port' must be non-zero".to_string());
        }
        if self.port_env.trim().is_empty() {
            errors.push("backend: 'port_env' must not be empty".to_string());
        }
        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "backend: 'health_path' must start with '/' (got '{}')",
                self.health_path
            ));
        }
        if self.health_check_attempts == 0 {
            errors.push("backend: 'health_check_attempts' must be at least 1".to_string());
        }
        if self.health_check_interval_ms == 0 {
            errors.push("backend: 'health_check_interval_ms' must be non-zero".to_string());
        }

        errors
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_warm_up() -> bool {
    true
}

fn default_command() -> String {
    "node".to_string()
}

fn default_args() -> Vec<String> {
    vec!["src/server.js".to_string()]
}

fn default_backend_port() -> u16 {
    8000
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_health_interval() -> u64 {
    1000
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_timeout() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PROXY_PORT` / `BACKEND_PORT` overrides from the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(PROXY_PORT_ENV) {
            self.server.port = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {} value '{}': {}", PROXY_PORT_ENV, value, e)
            })?;
        }
        if let Some(value) = lookup(BACKEND_PORT_ENV) {
            self.backend.port = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {} value '{}': {}", BACKEND_PORT_ENV, value, e)
            })?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let errors = self.backend.validate();

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
