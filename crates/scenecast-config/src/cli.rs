//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// scenecast command-line arguments.
///
/// Values given here override those loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "scenecast", about = "Stream a scene to remote viewers")]
pub struct CliArgs {
    /// First port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Additional ports to try if the first is taken.
    #[arg(long)]
    pub port_range: Option<u16>,

    /// Collate messages between frames.
    #[arg(long)]
    pub collate: Option<bool>,

    /// Gzip collated packets.
    #[arg(long)]
    pub compress: Option<bool>,

    /// Stop after this many frames.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Log filter (error, warn, info, debug, trace, or a directive list).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Config directory to use: the `--config` value or the platform default.
    pub fn config_dir(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::default_config_dir)
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.listen_port = port;
        }
        if let Some(range) = args.port_range {
            self.server.port_range = range;
        }
        if let Some(collate) = args.collate {
            self.server.collate = collate;
        }
        if let Some(compress) = args.compress {
            self.server.compress = compress;
        }
        if let Some(frames) = args.frames {
            self.demo.max_frames = frames;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs::parse_from([
            "scenecast",
            "--port",
            "34000",
            "--compress",
            "true",
            "--frames",
            "90",
        ]);
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.listen_port, 34000);
        assert!(config.server.compress);
        assert_eq!(config.demo.max_frames, 90);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.port_range, 0);
        assert!(config.server.collate);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_config_dir_override() {
        let args = CliArgs::parse_from(["scenecast", "--config", "/tmp/scenecast-test"]);
        assert_eq!(args.config_dir(), PathBuf::from("/tmp/scenecast-test"));
        assert!(CliArgs::default().config_dir().ends_with("scenecast"));
    }
}
