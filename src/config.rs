//! Configuration for annokit.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ANNOKIT_HOME, ANNOKIT_STORE)
//! 2. Config file (.annokit/config.yaml)
//! 3. Defaults (~/.annokit, jsonl store)
//!
//! Config file discovery:
//! - Searches current directory and parents for .annokit/config.yaml
//! - `paths.home` is relative to the .annokit/ directory

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_MAX_PER_ANNOTATOR: usize = 100;
pub const DEFAULT_MAX_PER_DATAPOINT: usize = 3;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub assignment: Option<AssignmentConfig>,
    #[serde(default)]
    pub sweep: Option<SweepConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .annokit/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentConfig {
    pub max_per_annotator: Option<usize>,
    pub max_per_datapoint: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub interval_seconds: Option<u64>,
}

/// Which store backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    Memory,
    #[default]
    Jsonl,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "jsonl" => Ok(Self::Jsonl),
            "sqlite" => Ok(Self::Sqlite),
            other => anyhow::bail!("Unknown store backend '{}' (expected jsonl, sqlite or memory)", other),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Jsonl => "jsonl",
            Self::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentSettings {
    pub max_per_annotator: usize,
    pub max_per_datapoint: usize,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            max_per_annotator: DEFAULT_MAX_PER_ANNOTATOR,
            max_per_datapoint: DEFAULT_MAX_PER_DATAPOINT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval_seconds: u64,
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to annokit home (store state)
    pub home: PathBuf,
    pub store_backend: StoreBackend,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub assignment: AssignmentSettings,
    pub sweep: SweepSettings,
}

impl ResolvedConfig {
    /// Directory of per-task JSONL logs
    pub fn tasks_dir(&self) -> PathBuf {
        self.home.join("tasks")
    }

    /// SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.home.join("annokit.db")
    }
}

/// Environment overrides, read once so resolution stays testable
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    store: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("ANNOKIT_HOME").ok(),
            store: std::env::var("ANNOKIT_STORE").ok(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".annokit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine file settings, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    env: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home)) = (
        config_file.as_ref(),
        file.as_ref().and_then(|f| f.paths.home.as_ref()),
    ) {
        let annokit_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(annokit_dir, home)
    } else {
        default_home
    };

    let backend_name = env.store.or_else(|| {
        file.as_ref()
            .and_then(|f| f.store.as_ref())
            .and_then(|s| s.backend.clone())
    });
    let store_backend = match backend_name {
        Some(name) => name.parse()?,
        None => StoreBackend::default(),
    };

    let assignment = file.as_ref().and_then(|f| f.assignment.as_ref());
    let assignment = AssignmentSettings {
        max_per_annotator: assignment
            .and_then(|a| a.max_per_annotator)
            .unwrap_or(DEFAULT_MAX_PER_ANNOTATOR),
        max_per_datapoint: assignment
            .and_then(|a| a.max_per_datapoint)
            .unwrap_or(DEFAULT_MAX_PER_DATAPOINT),
    };

    let sweep = SweepSettings {
        interval_seconds: file
            .as_ref()
            .and_then(|f| f.sweep.as_ref())
            .and_then(|s| s.interval_seconds)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS),
    };

    Ok(ResolvedConfig {
        home,
        store_backend,
        config_file,
        assignment,
        sweep,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".annokit");

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    resolve(find_config_file(&cwd), EnvOverrides::from_env(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(root: &Path, body: &str) -> PathBuf {
        let dir = root.join(".annokit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/u/.annokit")).unwrap();

        assert_eq!(config.home, PathBuf::from("/u/.annokit"));
        assert_eq!(config.store_backend, StoreBackend::Jsonl);
        assert_eq!(config.assignment.max_per_annotator, 100);
        assert_eq!(config.assignment.max_per_datapoint, 3);
        assert_eq!(config.sweep.interval_seconds, 300);
        assert_eq!(config.tasks_dir(), PathBuf::from("/u/.annokit/tasks"));
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_settings() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
store:
  backend: sqlite
assignment:
  max_per_annotator: 20
sweep:
  interval_seconds: 60
"#,
        );

        let config =
            resolve(Some(path.clone()), EnvOverrides::default(), PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, temp.path().join(".annokit").join("./state"));
        assert_eq!(config.store_backend, StoreBackend::Sqlite);
        assert_eq!(config.assignment.max_per_annotator, 20);
        assert_eq!(config.assignment.max_per_datapoint, 3);
        assert_eq!(config.sweep.interval(), Duration::from_secs(60));
        assert_eq!(config.config_file, Some(path));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            "version: \"1.0\"\nstore:\n  backend: sqlite\n",
        );
        let env = EnvOverrides {
            home: Some("/env/home".to_string()),
            store: Some("memory".to_string()),
        };

        let config = resolve(Some(path), env, PathBuf::from("/unused")).unwrap();
        assert_eq!(config.home, PathBuf::from("/env/home"));
        assert_eq!(config.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!("postgres".parse::<StoreBackend>().is_err());
        assert_eq!("SQLite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "../sibling"),
            PathBuf::from("/home/user/project/../sibling")
        );
    }
}
