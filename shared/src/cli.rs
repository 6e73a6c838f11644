//! Command-line surface and logging setup common to both binaries

use clap::error::ErrorKind;
use clap::{Args, Parser, ValueEnum};
use log::LevelFilter;

pub const DEFAULT_PORT: u16 = 22502;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            // `log` has no level above error
            LogLevel::Fatal | LogLevel::Error => LevelFilter::Error,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Options accepted by both the server and the client
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Port number (1-65535)
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Log verbosity: fatal, error, warning, info, debug or trace
    #[arg(short, long, value_enum, ignore_case = true)]
    pub loglevel: Option<LogLevel>,
}

/// Parses arguments, printing usage and exiting on failure.
///
/// `--help` prints to standard output and exits 0; any invalid argument
/// prints to standard error and exits 1.
pub fn parse_or_exit<P: Parser>() -> P {
    match P::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    }
}

/// Initialises `env_logger`; an explicit level overrides `RUST_LOG`
pub fn init_logging(level: Option<LogLevel>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level.into());
    }
    let _ = builder.try_init();
}
