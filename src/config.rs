use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for gostly
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Control API and storage settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker process settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Host router settings
    #[serde(default)]
    pub router: RouterSettings,

    /// In-memory log and timeline buffers
    #[serde(default)]
    pub logs: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the control API (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Port for the control API (default: 9797)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the control API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// SQLite database path (default: <config dir>/gostly/gostly.db)
    pub database_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs_next::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gostly")
                .join("gostly.db")
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_bind: default_admin_bind(),
            admin_port: default_admin_port(),
            admin_token: None,
            database_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Name of the worker executable looked up on PATH
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Additional absolute paths checked after PATH and the well-known locations
    #[serde(default)]
    pub extra_search_paths: Vec<PathBuf>,

    /// Flag passed to the worker to print its version
    #[serde(default = "default_version_flag")]
    pub version_flag: String,

    /// Directory for generated worker configs (default: <cache dir>/gostly)
    pub scratch_dir: Option<PathBuf>,

    /// Include the structured logging section in generated configs
    #[serde(default = "default_true")]
    pub log_config: bool,

    /// Grace period in seconds between SIGINT and SIGKILL at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Upper bound in seconds for a forced stop to be observed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl WorkerSettings {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            dirs_next::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gostly")
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            extra_search_paths: Vec::new(),
            version_flag: default_version_flag(),
            scratch_dir: None,
            log_config: true,
            shutdown_grace_secs: default_shutdown_grace(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterSettings {
    /// Address to start the router on at launch (e.g. ":8080"); unset leaves it stopped
    pub listen: Option<String>,

    /// Origin used when no mapping matches the request host
    #[serde(default = "default_origin")]
    pub default_origin: String,

    /// Graceful shutdown bound in seconds
    #[serde(default = "default_router_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Delay in milliseconds after stopping a running router before restarting it
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Maximum time in seconds to wait for upstream response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Terminate foreign processes holding the router port before binding
    #[serde(default = "default_true")]
    pub reclaim_port: bool,

    /// Maximum idle upstream connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl RouterSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            listen: None,
            default_origin: default_origin(),
            shutdown_timeout_secs: default_router_shutdown_timeout(),
            settle_delay_ms: default_settle_delay(),
            request_timeout_secs: default_request_timeout(),
            reclaim_port: true,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    /// Maximum log entries kept in memory
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,

    /// Maximum timeline events kept in memory
    #[serde(default = "default_timeline_capacity")]
    pub timeline_capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            timeline_capacity: default_timeline_capacity(),
        }
    }
}

// Default value functions
fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9797
}

fn default_worker_command() -> String {
    "gost".to_string()
}

fn default_version_flag() -> String {
    "-V".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace() -> u64 {
    3 // 3 seconds between SIGINT and SIGKILL
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_origin() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_router_shutdown_timeout() -> u64 {
    5
}

fn default_settle_delay() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for upstream to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_log_capacity() -> usize {
    1000
}

fn default_timeline_capacity() -> usize {
    10_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.worker.command.trim().is_empty() {
            errors.push("worker.command must not be empty".to_string());
        }
        if self.worker.shutdown_grace_secs == 0 {
            errors.push("worker.shutdown_grace_secs must be greater than 0".to_string());
        }
        if !(self.router.default_origin.starts_with("http://")
            || self.router.default_origin.starts_with("https://"))
        {
            errors.push(format!(
                "router.default_origin must start with http:// or https:// (got '{}')",
                self.router.default_origin
            ));
        }
        if self.router.shutdown_timeout_secs == 0 {
            errors.push("router.shutdown_timeout_secs must be greater than 0".to_string());
        }
        if self.router.request_timeout_secs == 0 {
            errors.push("router.request_timeout_secs must be greater than 0".to_string());
        }
        if self.logs.capacity == 0 {
            errors.push("logs.capacity must be greater than 0".to_string());
        }
        if self.logs.timeline_capacity == 0 {
            errors.push("logs.timeline_capacity must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
admin_port = 9000
admin_token = "secret"
database_path = "/tmp/gostly-test.db"

[worker]
command = "gost3"
extra_search_paths = ["/srv/bin/gost3"]
shutdown_grace_secs = 7
log_config = false

[router]
listen = ":8080"
default_origin = "http://10.0.0.5:3000"
settle_delay_ms = 100
reclaim_port = false

[logs]
capacity = 250
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.server.database_path(), PathBuf::from("/tmp/gostly-test.db"));
        assert_eq!(config.worker.command, "gost3");
        assert_eq!(config.worker.extra_search_paths.len(), 1);
        assert_eq!(config.worker.shutdown_grace(), Duration::from_secs(7));
        assert!(!config.worker.log_config);
        assert_eq!(config.router.listen.as_deref(), Some(":8080"));
        assert_eq!(config.router.default_origin, "http://10.0.0.5:3000");
        assert_eq!(config.router.settle_delay(), Duration::from_millis(100));
        assert!(!config.router.reclaim_port);
        assert_eq!(config.logs.capacity, 250);
        assert_eq!(config.logs.timeline_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.admin_bind, "127.0.0.1");
        assert_eq!(config.server.admin_port, 9797);
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.worker.command, "gost");
        assert_eq!(config.worker.version_flag, "-V");
        assert!(config.worker.log_config);
        assert_eq!(config.worker.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.worker.stop_timeout(), Duration::from_secs(5));
        assert!(config.router.listen.is_none());
        assert_eq!(config.router.default_origin, "http://127.0.0.1:8082");
        assert_eq!(config.router.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.router.settle_delay(), Duration::from_millis(500));
        assert!(config.router.reclaim_port);
        assert_eq!(config.logs.capacity, 1000);
    }

    #[test]
    fn test_default_paths_end_with_app_dir() {
        let config = Config::default();
        assert!(config.worker.scratch_dir().ends_with("gostly"));
        assert!(config.server.database_path().ends_with("gostly/gostly.db"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.worker.command = " ".to_string();
        config.router.default_origin = "127.0.0.1:8082".to_string();
        config.logs.capacity = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("worker.command"));
        assert!(err.contains("router.default_origin"));
        assert!(err.contains("logs.capacity"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.admin_port, 9797);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gostly.toml");
        std::fs::write(&path, "[router]\nshutdown_timeout_secs = 0\n").unwrap();

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("router.shutdown_timeout_secs"));
    }
}
