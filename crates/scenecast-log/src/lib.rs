//! Logging setup for scenecast binaries.
//!
//! Installs a `tracing` subscriber with a console layer and, when a log
//! directory is configured, a JSON file layer. `RUST_LOG` takes precedence over
//! the configured level.

use std::fs::File;
use std::path::Path;

use scenecast_config::DebugConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config give one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written into the configured log directory.
pub const LOG_FILE_NAME: &str = "scenecast.log";

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed, which is harmless
/// in tests that initialise logging more than once.
pub fn init_logging(config: Option<&DebugConfig>) -> bool {
    let level = config.map(|c| c.log_level.as_str()).unwrap_or_default();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let log_file = config
        .and_then(|c| c.log_dir.as_deref())
        .and_then(|dir| match open_log_file(dir) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("file logging disabled: {e}");
                None
            }
        });

    let installed = match log_file {
        Some(file) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json();
            subscriber.with(file_layer).try_init().is_ok()
        }
        None => subscriber.try_init().is_ok(),
    };
    if installed {
        tracing::debug!(filter = level, "logging initialised");
    }
    installed
}

/// Build a filter from a configured level, falling back to [`DEFAULT_FILTER`]
/// when it is empty or does not parse.
pub fn filter_for(level: &str) -> EnvFilter {
    if level.trim().is_empty() {
        return EnvFilter::new(DEFAULT_FILTER);
    }
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid log filter {level:?}: {e}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Create `dir` if needed and open a fresh log file inside it.
pub fn open_log_file(dir: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(dir)?;
    File::create(dir.join(LOG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_level_uses_default() {
        assert_eq!(filter_for("").to_string(), DEFAULT_FILTER);
        assert_eq!(filter_for("   ").to_string(), DEFAULT_FILTER);
    }

    #[test]
    fn test_subsystem_filter() {
        let filter = filter_for("warn,scenecast_net=debug");
        let text = filter.to_string();
        assert!(text.contains("scenecast_net=debug"));
        assert!(text.contains("warn"));
    }

    #[test]
    fn test_log_file_created_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        open_log_file(&nested).unwrap();
        assert!(nested.join(LOG_FILE_NAME).exists());
    }

    #[test]
    fn test_second_init_is_rejected() {
        let config = DebugConfig::default();
        let _ = init_logging(Some(&config));
        assert!(!init_logging(Some(&config)));
    }
}
