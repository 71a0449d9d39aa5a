//! Configuration management for carpool.
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use tracing::debug;

use crate::{
    cli::LogLevelArg,
    constants::{CONFIG_FILE_NAME, DEFAULT_LOG_DIR, DEFAULT_PORT, DEFAULT_STARTUP_WAIT_MS},
    error::ConfigError,
};

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("env reference pattern is valid")
});

/// Settings shared by the client and the daemon it spawns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port of the shared directory.
    pub port: u16,
    /// Directory receiving `supervisor-log.txt` and `<pid>_log.txt` files.
    pub log_dir: PathBuf,
    /// Verbosity of both client and daemon.
    pub log_level: LogLevelArg,
    /// Whether application stdout is copied into a capture file.
    pub capture_output: bool,
    /// Fixed wait between spawning a daemon and connecting to it.
    pub startup_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_dir: default_log_dir(),
            log_level: LogLevelArg::default(),
            capture_output: true,
            startup_wait_ms: DEFAULT_STARTUP_WAIT_MS,
        }
    }
}

impl Config {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }

    /// Applies command-line overrides on top of file values.
    pub fn apply_overrides(
        &mut self,
        port: Option<u16>,
        log_dir: Option<PathBuf>,
        log_level: Option<LogLevelArg>,
    ) {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(log_dir) = log_dir {
            self.log_dir = log_dir;
        }
        if let Some(log_level) = log_level {
            self.log_level = log_level;
        }
    }
}

fn default_log_dir() -> PathBuf {
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(DEFAULT_LOG_DIR))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Expands `$VAR` and `${VAR}` references. Unset variables are an error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_REFERENCE.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingVariable(var_name)),
        None => Ok(expanded.into_owned()),
    }
}

/// Loads the settings file, falling back to defaults when none exists.
///
/// An explicit `config_path` must exist. Without one, `carpool.yaml` in the working
/// directory is used if present. A relative `log_dir` is resolved against the
/// directory holding the file.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => {
            let candidate = PathBuf::from(CONFIG_FILE_NAME);
            if !candidate.exists() {
                debug!("No {CONFIG_FILE_NAME} found; using default settings");
                return Ok(Config::default());
            }
            candidate
        }
    };

    let content = fs::read_to_string(&config_path).map_err(|e| {
        ConfigError::Read(io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    if expanded.trim().is_empty() {
        return Ok(Config::default());
    }

    let mut config: Config = serde_yaml::from_str(&expanded)?;

    if config.log_dir.is_relative() {
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        config.log_dir = base.join(&config.log_dir);
    }

    debug!("Loaded settings from {}", config_path.display());
    Ok(config)
}
