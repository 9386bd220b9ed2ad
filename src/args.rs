// Commandline argument parsers using clap for the scopelog binaries

use clap::Parser;
use std::path::PathBuf;

/// Arguments for the capture binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct CaptureArgs {
    /// Serial device to open; picked interactively when left out
    #[arg(short = 'p', long = "port")]
    pub port: Option<PathBuf>,

    /// RON file with capture settings, defaults used when left out
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Participant to register as soon as the pipeline is up
    #[arg(short = 'P', long = "participant")]
    pub participant: Option<String>,

    /// Stream from the built-in signal simulator instead of hardware
    #[arg(long = "simulate")]
    pub simulate: bool,

    /// Override the configured baud rate
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,
}

/// Arguments for the monitor binary.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct MonitorArgs {
    /// Serial device to open; picked interactively when left out
    #[arg(short = 'p', long = "port")]
    pub port: Option<PathBuf>,

    /// RON file with capture settings, defaults used when left out
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Stream from the built-in signal simulator instead of hardware
    #[arg(long = "simulate")]
    pub simulate: bool,

    /// Override the configured baud rate
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,
}
