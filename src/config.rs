//! Configuration for the `ptyspawn` command
//!
//! Sources, highest priority first:
//! - CLI arguments
//! - `PTYSPAWN_*` environment variables
//! - TOML config file (`--config FILE` or `$XDG_CONFIG_HOME/ptyspawn/config.toml`)
//! - defaults

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::pty::SlavePath;
use crate::size::WindowSize;
use crate::spawn::SpawnRequest;

/// CLI arguments for ptyspawn
#[derive(Parser, Debug, Clone)]
#[command(name = "ptyspawn")]
#[command(version)]
#[command(about = "Run a program on a fresh pseudo-terminal and report how it ended", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Terminal columns
    #[arg(long, value_name = "COLS")]
    pub cols: Option<u16>,

    /// Terminal rows
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Value of TERM for the child
    #[arg(long, value_name = "TERM")]
    pub term: Option<String>,

    /// Start the child with an empty environment
    #[arg(long)]
    pub clear_env: bool,

    /// Extra environment variable for the child (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Working directory of the child
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Termination report format (text, json)
    #[arg(long, value_name = "FORMAT")]
    pub report: Option<String>,

    /// Program to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// How the termination report is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Terminal columns
    pub cols: u16,
    /// Terminal rows
    pub rows: u16,
    /// TERM for the child; empty leaves it unset
    pub term: String,
    /// Start from the environment of ptyspawn itself
    pub inherit_env: bool,
    /// Variables set on top of the (possibly inherited) environment
    pub env: BTreeMap<String, String>,
    /// Working directory of the child
    pub cwd: Option<PathBuf>,
    /// Termination report format
    pub report: ReportFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
            inherit_env: true,
            env: BTreeMap::new(),
            cwd: None,
            report: ReportFormat::Text,
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            // An explicit file must load
            Some(path) => Self::load_from_file(path)?,
            None => Self::default_config_path()
                .filter(|path| path.exists())
                .and_then(|path| match Self::load_from_file(&path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        warn!("Failed to load config from {:?}: {}", path, e);
                        None
                    }
                })
                .unwrap_or_default(),
        };

        config.apply_env_vars(|key| env::var(key).ok())?;
        config.apply_cli_args(args)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
            field: None,
        })
    }

    /// Apply `PTYSPAWN_*` variables as returned by `lookup`
    fn apply_env_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PTYSPAWN_COLS") {
            self.cols = parse_number(&val, "PTYSPAWN_COLS")?;
        }
        if let Some(val) = lookup("PTYSPAWN_ROWS") {
            self.rows = parse_number(&val, "PTYSPAWN_ROWS")?;
        }
        if let Some(val) = lookup("PTYSPAWN_TERM") {
            self.term = val;
        }
        if let Some(val) = lookup("PTYSPAWN_INHERIT_ENV") {
            self.inherit_env = val == "1" || val.to_lowercase() == "true";
        }
        if let Some(val) = lookup("PTYSPAWN_CWD") {
            self.cwd = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("PTYSPAWN_REPORT") {
            self.report = parse_report(&val, "PTYSPAWN_REPORT")?;
        }
        Ok(())
    }

    /// Apply CLI arguments to config
    fn apply_cli_args(&mut self, args: &CliArgs) -> Result<(), ConfigError> {
        if let Some(cols) = args.cols {
            self.cols = cols;
        }
        if let Some(rows) = args.rows {
            self.rows = rows;
        }
        if let Some(term) = &args.term {
            self.term = term.clone();
        }
        if args.clear_env {
            self.inherit_env = false;
        }
        for (key, value) in &args.env {
            self.env.insert(key.clone(), value.clone());
        }
        if let Some(cwd) = &args.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(report) = &args.report {
            self.report = parse_report(report, "report")?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cols == 0 {
            return Err(ConfigError {
                message: "Columns must be at least 1".to_string(),
                field: Some("cols".to_string()),
            });
        }
        if self.rows == 0 {
            return Err(ConfigError {
                message: "Rows must be at least 1".to_string(),
                field: Some("rows".to_string()),
            });
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ConfigError {
                    message: format!("Invalid environment variable name '{}'", key),
                    field: Some("env".to_string()),
                });
            }
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptyspawn").join("config.toml"))
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.cols, self.rows)
    }

    /// Build the request for `command` on `tty`
    ///
    /// The environment is the inherited one (when enabled), then `TERM`, then
    /// the configured variables.
    pub fn spawn_request(&self, command: &[String], tty: SlavePath) -> crate::Result<SpawnRequest> {
        let (program, args) = command.split_first().ok_or_else(|| {
            crate::Error::InvalidArgument("no program to run".to_string())
        })?;

        let mut request = SpawnRequest::new(program, tty)?
            .args(args)?
            .window_size(self.window_size());
        if self.inherit_env {
            request = request.envs(env::vars_os())?;
        }
        if !self.term.is_empty() {
            request = request.env("TERM", &self.term)?;
        }
        request = request.envs(&self.env)?;
        if let Some(cwd) = &self.cwd {
            request = request.current_dir(cwd)?;
        }
        Ok(request)
    }
}

fn parse_number(val: &str, field: &str) -> Result<u16, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError {
        message: format!("Expected a number, got '{}'", val),
        field: Some(field.to_string()),
    })
}

fn parse_report(val: &str, field: &str) -> Result<ReportFormat, ConfigError> {
    ReportFormat::from_str(val).ok_or_else(|| ConfigError {
        message: format!("Unknown report format '{}' (expected text or json)", val),
        field: Some(field.to_string()),
    })
}
