//! Configuration for scenecast servers.
//!
//! Settings persist to disk as RON and can be overridden from the command
//! line via clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, DemoConfig, default_config_dir};
pub use error::ConfigError;
