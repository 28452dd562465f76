// File: args.rs
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use mss_demux::error::ConfigError;
use mss_demux::DemuxConfig;
use tracing::level_filters::LevelFilter;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogLevel {
    Trace = 0, // Designates very fine-grained informational events, extremely verbose.
    Debug = 1, // Designates fine-grained informational events.
    Info = 2, // Designates informational messages.
    Warn = 3, // Designates hazardous situations.
    Error = 4, // Designates very serious errors.
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = "A headless client that downloads a Smooth Streaming presentation fragment by fragment.")]
pub struct Args {
    /// Manifest URL, usually ending in /Manifest
    pub manifest_url: String,
    /// Directory receiving one sub directory per output channel
    #[arg(short, long, default_value = "fragments")]
    pub output: PathBuf,
    /// JSON file with demuxer settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Connection speed in bits per second, overrides the config file
    #[arg(short = 's', long)]
    pub connection_speed: Option<u64>,
    /// Let measured download rates pick the quality level
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    pub adaptive: bool,
    /// Seek to this position (seconds) before downloading
    #[arg(long)]
    pub start: Option<f64>,
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Args {
    /// Demuxer settings from the config file, with the command line flags applied on top.
    pub fn demux_config(&self) -> Result<DemuxConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => DemuxConfig::from_file(path)?,
            None => DemuxConfig::default(),
        };
        if let Some(speed) = self.connection_speed {
            config.connection_speed = speed;
        }
        if self.adaptive {
            config.adaptive_bitrate = true;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn parse_args() -> Args {
    Args::parse()
}

pub fn get_log_level_filter(args: &Args) -> LevelFilter {
    // Map the LogLevel enum to the LevelFilter enum
    match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}
