use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Raw `EnvFilter` directives that replace the level-derived filter.
pub const FILTER_OVERRIDE_ENV: &str = "SPATIA_LOG_FILTER";

/// Targets owned by this workspace. Everything else (reqwest, hyper, h2)
/// stays at `warn` whatever `--log-level` says.
const SPATIA_TARGETS: &[&str] = &[
    "spatia.supervisor",
    "spatia.queue",
    "spatia.events",
    "spatia.spatial",
    "spatia.http",
    "spatia_watch",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(#[from] SetGlobalDefaultError),
}

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let directives = std::env::var(FILTER_OVERRIDE_ENV)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .unwrap_or_else(|| directives_for(config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

fn directives_for(level: LogLevel) -> String {
    let floor = level.min(LogLevel::Warn).as_str();
    let mut directives = floor.to_string();
    for target in SPATIA_TARGETS {
        directives.push(',');
        directives.push_str(target);
        directives.push('=');
        directives.push_str(level.as_str());
    }
    directives
}
