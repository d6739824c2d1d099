use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Bounds for every relational pool the connection manager builds.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_max_connections() -> u32 {
    7
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilesConfig {
    /// Base directory for relative file-source paths.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl FilesConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Config with every section defaulted and the store at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            files: FilesConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.pool.max_connections == 0 {
        anyhow::bail!("pool.max_connections must be > 0");
    }

    if config.pool.min_connections > config.pool.max_connections {
        anyhow::bail!(
            "pool.min_connections ({}) must not exceed pool.max_connections ({})",
            config.pool.min_connections,
            config.pool.max_connections
        );
    }

    if config.pool.acquire_timeout_secs == 0 {
        anyhow::bail!("pool.acquire_timeout_secs must be > 0");
    }

    if let Some(root) = &config.files.root {
        if !root.is_dir() {
            anyhow::bail!("files.root is not a directory: {}", root.display());
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("rpt.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(tmp.path(), "[db]\npath = \"./data/rpt.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.pool.min_connections, 0);
        assert_eq!(config.pool.max_connections, 7);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert!(config.scheduler.enabled);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            "[db]\npath = \"x.sqlite\"\n\n[pool]\nmin_connections = 5\nmax_connections = 2\n",
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("min_connections"));
    }

    #[test]
    fn test_files_root_resolves_relative_paths() {
        let files = FilesConfig {
            root: Some(PathBuf::from("/srv/uploads")),
        };
        assert_eq!(
            files.resolve(Path::new("q1/sales.csv")),
            PathBuf::from("/srv/uploads/q1/sales.csv")
        );
        assert_eq!(
            files.resolve(Path::new("/abs/sales.csv")),
            PathBuf::from("/abs/sales.csv")
        );
    }
}
