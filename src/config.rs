//! Configuration for the plotline server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! Plots are described as a list of stages, each naming a generator:
//!
//! ```toml
//! [[plot]]
//! port = 44321
//!
//! [[plot.stage]]
//! tasks = 20
//! timeout_base_ms = 10000
//! timeout_dec_ms = 100
//! generator = { type = "equation", min_len = 1, max_len = 15, max_number = 1000 }
//! ```
//!
//! Without any `[[plot]]` table a default plot is served on `--port`.

use crate::generators::{BannerGenerator, EchoGenerator, EquationGenerator, Generator};
use crate::plot::{LinearPlot, Plot, PlotConstructor, Stage, TaskError};
use crate::runtime::num_cpus;
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Port of the default plot.
pub const DEFAULT_PORT: u16 = 44321;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "plotline")]
#[command(version = "0.1.0")]
#[command(about = "A multi-reactor question/answer challenge server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Port of the default plot (used when the config file defines no plots)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Readiness events fetched per poll
    #[arg(long)]
    pub event_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, rename = "plot")]
    pub plots: Vec<PlotConfig>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Readiness events fetched per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One plot served on one port.
#[derive(Debug, Clone, Deserialize)]
pub struct PlotConfig {
    pub port: u16,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

/// One stage of a plot.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Number of tasks in this stage
    pub tasks: u32,
    /// Deadline of the first task in milliseconds (0 = none)
    #[serde(default)]
    pub timeout_base_ms: u64,
    /// Deadline decrease per task in milliseconds
    #[serde(default)]
    pub timeout_dec_ms: u64,
    pub generator: GeneratorConfig,
}

/// Generator selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeneratorConfig {
    Equation {
        #[serde(default = "default_min_len")]
        min_len: usize,
        #[serde(default = "default_max_len")]
        max_len: usize,
        #[serde(default = "default_max_number")]
        max_number: u64,
        #[serde(default = "default_braces")]
        braces: bool,
    },
    Echo {
        #[serde(default = "default_echo_prefix")]
        prefix: String,
    },
    Banner {
        text: String,
    },
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_len() -> usize {
    1
}

fn default_max_len() -> usize {
    15
}

fn default_max_number() -> u64 {
    1000
}

fn default_braces() -> bool {
    true
}

fn default_echo_prefix() -> String {
    "Send this token back: ".to_string()
}

fn default_banner() -> String {
    "Well done, that was the last one. Bye!\n".to_string()
}

impl PlotConfig {
    /// The plot served when the configuration names none.
    pub fn default_plot(port: u16) -> Self {
        Self {
            port,
            stages: vec![
                StageConfig {
                    tasks: 20,
                    timeout_base_ms: 10_000,
                    timeout_dec_ms: 100,
                    generator: GeneratorConfig::Equation {
                        min_len: default_min_len(),
                        max_len: default_max_len(),
                        max_number: default_max_number(),
                        braces: default_braces(),
                    },
                },
                StageConfig {
                    tasks: 5,
                    timeout_base_ms: 10_000,
                    timeout_dec_ms: 100,
                    generator: GeneratorConfig::Echo {
                        prefix: default_echo_prefix(),
                    },
                },
                StageConfig {
                    tasks: 1,
                    timeout_base_ms: 10_000,
                    timeout_dec_ms: 0,
                    generator: GeneratorConfig::Banner {
                        text: default_banner(),
                    },
                },
            ],
        }
    }

    /// Factory building a fresh plot for every client.
    ///
    /// Fixed texts are converted once here and shared by every client.
    pub fn constructor(&self) -> PlotConstructor {
        let stages: Vec<StageBlueprint> = self.stages.iter().map(StageBlueprint::from).collect();

        Arc::new(move || -> Result<Box<dyn Plot>, TaskError> {
            let stages = stages.iter().map(StageBlueprint::build).collect();
            Ok(Box::new(LinearPlot::new(stages)))
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "plot on port {} has no stages",
                self.port
            )));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            let invalid = |msg: &str| {
                ConfigError::Invalid(format!("plot on port {}, stage {idx}: {msg}", self.port))
            };

            if stage.tasks == 0 {
                return Err(invalid("task count must be positive"));
            }

            if let GeneratorConfig::Equation {
                min_len,
                max_len,
                max_number,
                ..
            } = stage.generator
            {
                let min_len = min_len.max(1);
                if min_len > max_len {
                    return Err(invalid("min_len exceeds max_len"));
                }
                if min_len == max_len && min_len % 2 == 0 {
                    return Err(invalid("length range holds no odd length"));
                }
                if max_number == 0 {
                    return Err(invalid("max_number must be positive"));
                }
            }
        }

        Ok(())
    }
}

/// A stage with its fixed texts already in shared buffers.
struct StageBlueprint {
    generator: GeneratorBlueprint,
    tasks: u32,
    timeout_base_ms: u64,
    timeout_dec_ms: u64,
}

enum GeneratorBlueprint {
    Equation {
        min_len: usize,
        max_len: usize,
        max_number: u64,
        braces: bool,
    },
    Echo(Bytes),
    Banner(Bytes),
}

impl From<&StageConfig> for StageBlueprint {
    fn from(stage: &StageConfig) -> Self {
        let generator = match &stage.generator {
            GeneratorConfig::Equation {
                min_len,
                max_len,
                max_number,
                braces,
            } => GeneratorBlueprint::Equation {
                min_len: *min_len,
                max_len: *max_len,
                max_number: *max_number,
                braces: *braces,
            },
            GeneratorConfig::Echo { prefix } => GeneratorBlueprint::Echo(Bytes::from(prefix.clone())),
            GeneratorConfig::Banner { text } => GeneratorBlueprint::Banner(Bytes::from(text.clone())),
        };

        Self {
            generator,
            tasks: stage.tasks,
            timeout_base_ms: stage.timeout_base_ms,
            timeout_dec_ms: stage.timeout_dec_ms,
        }
    }
}

impl StageBlueprint {
    fn build(&self) -> Stage {
        let generator: Box<dyn Generator> = match &self.generator {
            GeneratorBlueprint::Equation {
                min_len,
                max_len,
                max_number,
                braces,
            } => Box::new(EquationGenerator::new(*min_len, *max_len, *max_number, *braces)),
            GeneratorBlueprint::Echo(prefix) => Box::new(EchoGenerator::new(prefix.clone())),
            GeneratorBlueprint::Banner(text) => Box::new(BannerGenerator::new(text.clone())),
        };

        Stage::new(
            generator,
            self.tasks,
            self.timeout_base_ms,
            self.timeout_dec_ms,
        )
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub event_capacity: usize,
    pub log_level: String,
    pub plots: Vec<PlotConfig>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let workers = match cli.workers.or(toml_config.server.workers) {
            None | Some(0) => num_cpus(),
            Some(n) => n,
        };

        let event_capacity = cli
            .event_capacity
            .unwrap_or(toml_config.server.event_capacity);
        if event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be positive".to_string(),
            ));
        }

        let plots = if toml_config.plots.is_empty() {
            vec![PlotConfig::default_plot(cli.port.unwrap_or(DEFAULT_PORT))]
        } else {
            toml_config.plots
        };

        let mut ports = HashSet::new();
        for plot in &plots {
            plot.validate()?;
            if plot.port != 0 && !ports.insert(plot.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} is used by more than one plot",
                    plot.port
                )));
            }
        }

        Ok(Config {
            workers,
            event_capacity,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            plots,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
