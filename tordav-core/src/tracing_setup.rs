//! Log output of the tordav process.
//!
//! The console shows the user's chosen level, with the torrent engine's
//! chatty crates held at `info`. A per-run file under the logs directory
//! records tordav at `trace` and the engine at `debug`.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the file log, overwritten on every start.
pub const LOG_FILE_NAME: &str = "tordav-last-run.log";

/// Targets of the torrent engine. Peer and DHT traffic logs every packet
/// below `info`.
const ENGINE_TARGETS: &[&str] = &[
    "librqbit",
    "librqbit_core",
    "librqbit_dht",
    "librqbit_peer_protocol",
    "librqbit_tracker_comms",
    "librqbit_upnp",
];

/// Errors raised while installing the log subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Can't open log file {path:?}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Filter directives of the console: `level` for everything, engine
/// targets capped at `info`.
pub fn console_directives(level: Level) -> String {
    let mut directives = level.to_string().to_lowercase();
    if level > Level::INFO {
        for target in ENGINE_TARGETS {
            directives.push_str(&format!(",{target}=info"));
        }
    }
    directives
}

/// Filter directives of the file log.
pub fn file_directives() -> String {
    let mut directives = String::from("trace");
    for target in ENGINE_TARGETS {
        directives.push_str(&format!(",{target}=debug"));
    }
    directives
}

/// Installs console and file logging. `RUST_LOG` replaces the console
/// directives when set.
///
/// Returns the path of the file log.
///
/// # Errors
/// - `TracingError::LogFile` - `logs_dir` or the log file can't be created
/// - `TracingError::Filter` - Generated directives failed to parse
/// - `TracingError::AlreadyInitialized` - Called twice in one process
pub fn init_tracing(console_level: Level, logs_dir: &Path) -> Result<PathBuf, TracingError> {
    let log_file_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = create_dir_all(logs_dir)
        .and_then(|()| File::create(&log_file_path))
        .map_err(|source| TracingError::LogFile {
            path: log_file_path.clone(),
            source,
        })?;

    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(console_directives(console_level))?,
    };

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::try_new(file_directives())?);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging at {} to the console and to {}",
        console_level,
        log_file_path.display()
    );

    Ok(log_file_path)
}

/// Log levels selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Everything, engine internals included when `RUST_LOG` asks for them
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tracing_level().to_string().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::Debug.as_tracing_level(), Level::DEBUG);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
    }

    #[test]
    fn test_console_caps_engine_only_when_verbose() {
        assert_eq!(console_directives(Level::WARN), "warn");
        assert_eq!(console_directives(Level::INFO), "info");

        let debug = console_directives(Level::DEBUG);
        assert!(debug.starts_with("debug,"));
        assert!(debug.contains("librqbit=info"));
        assert!(debug.contains("librqbit_dht=info"));
        assert!(EnvFilter::try_new(&debug).is_ok());
    }

    #[test]
    fn test_file_directives_parse() {
        let directives = file_directives();
        assert!(directives.starts_with("trace,"));
        assert!(directives.contains("librqbit_peer_protocol=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
