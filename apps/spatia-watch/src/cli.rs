use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "spatia-watch",
    about = "Watch and drive a Spatia workspace through the client consistency layer",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "SPATIA_BASE_URL",
        value_name = "URL",
        help = "Base URL of the Spatia service (defaults to http://127.0.0.1:8000)"
    )]
    pub base_url: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow connection state and stream events until interrupted (default)
    Watch(WatchArgs),
    /// Run one spatial conflict pass over a scene file
    Check(CheckArgs),
    /// Submit a geometry sync for one node through the request queue
    Geometry(GeometryArgs),
    /// Submit an arbitrary call through the request queue
    Request(RequestArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "SPATIA_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "SPATIA_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Also run the spatial checker over this scene and print flag changes"
    )]
    pub scene: Option<PathBuf>,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 200,
        help = "Number of recent events kept in the journal"
    )]
    pub journal: usize,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(long, value_name = "FILE", help = "JSON scene with `nodes` and `zones`")]
    pub scene: PathBuf,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Print the conflicting ids as a JSON array"
    )]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct GeometryArgs {
    #[arg(long, value_name = "ID")]
    pub id: String,

    #[arg(long, allow_negative_numbers = true)]
    pub x: i64,

    #[arg(long, allow_negative_numbers = true)]
    pub y: i64,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    #[arg(value_name = "METHOD", help = "HTTP verb (GET, POST, PUT, PATCH, DELETE)")]
    pub method: String,

    #[arg(value_name = "PATH", help = "Path relative to the base URL, e.g. /api/atoms")]
    pub path: String,

    #[arg(long, value_name = "JSON", help = "JSON request body")]
    pub body: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
