//! Command-line interface for carpool.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap and the settings file can parse log levels
/// from either string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.0
    }
}

impl Default for LogLevelArg {
    fn default() -> Self {
        LogLevelArg(LevelFilter::WARN)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" | "severe" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" | "fine" => Some(LevelFilter::DEBUG),
            "trace" | "finer" | "finest" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

impl TryFrom<String> for LogLevelArg {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Command-line interface for carpool.
///
/// Action flags run in a fixed order: `--start`, `--status`, the subcommand, then
/// `--stop`.
#[derive(Parser)]
#[command(name = "carpool", version, author)]
#[command(about = "A supervisor daemon for ad-hoc applications", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the settings file (defaults to `carpool.yaml` when present).
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Port of the shared directory.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Directory receiving the supervisor and application logs.
    #[arg(long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,

    /// Start the supervisor daemon.
    #[arg(long)]
    pub start: bool,

    /// Stop the supervisor daemon and every application it manages.
    #[arg(long)]
    pub stop: bool,

    /// Print the supervisor's status.
    #[arg(long)]
    pub status: bool,

    /// Start the supervisor if it is not running instead of failing.
    #[arg(long)]
    pub autostart: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for carpool.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List the applications managed by the supervisor.
    List {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Launch an application under the supervisor.
    Add {
        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Terminate an application and stop tracking it.
    Remove {
        /// PID reported by `add` or `list`.
        pid: u32,
    },

    /// Serve a standalone directory in the foreground.
    Directory,

    /// Run the supervisor daemon in this process.
    #[command(hide = true)]
    Supervise {
        /// Log level of the daemon.
        #[arg(value_name = "LEVEL")]
        daemon_level: LogLevelArg,

        /// Port of the shared directory.
        #[arg(value_name = "PORT")]
        daemon_port: u16,

        /// Directory receiving the supervisor and application logs.
        #[arg(value_name = "LOG_DIR")]
        daemon_log_dir: PathBuf,

        /// Do not capture application stdout.
        #[arg(long)]
        no_capture: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
