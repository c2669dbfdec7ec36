use clap::{builder::PossibleValuesParser, value_parser};
use easy_error::{Error, ResultExt};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub config_test: bool,
    #[allow(dead_code)]
    pub log_level: String,
}

pub fn parse_args() -> Result<AppArgs, Error> {
    let args = clap::Command::new("sockspipe")
        .version(crate::VERSION)
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Config filename")
                .default_value("config.yaml")
                .value_parser(value_parser!(String))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log")
                .help("Set log level")
                .value_parser(PossibleValuesParser::new([
                    "error", "warn", "info", "debug", "trace",
                ]))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("config-check")
                .short('t')
                .long("test")
                .help("Load and check config file then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();
    let config_file = args
        .get_one("config")
        .map(String::as_str)
        .unwrap_or("config.yaml")
        .to_string();
    let config_test = args.get_flag("config-check");
    let log_level = args
        .get_one("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .to_string();
    init_logging(&log_level)?;
    Ok(AppArgs {
        config_file,
        config_test,
        log_level,
    })
}

pub fn init_logging(log_level: &str) -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.parse().context("parse log level")?)
                .from_env()
                .context("build env filter")?,
        )
        .init();
    Ok(())
}
