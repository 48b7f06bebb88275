//! Command-line interface definitions for hostwatch.

use std::env;

use clap::{Parser, Subcommand, ValueEnum};
use hostwatch_common::HostAddress;

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Track every known and discovered host, printing each change as a JSON line.
    Watch(WatchArgs),

    /// Race a set of addresses once and print which of them reach the host.
    Probe(ProbeArgs),
}

/// Output format of the log lines written to stderr.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
    Pretty,
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "hostwatch.toml", env = "HOSTWATCH_CONFIG")]
    pub config: String,

    #[arg(long, value_enum, default_value_t)]
    pub log_format: LogFormat,
}

#[derive(Debug, Parser)]
pub struct ProbeArgs {
    /// Candidate addresses as `host[:port]`, taken as local, manual, remote and IPv6 address in that order
    #[arg(required = true, num_args = 1..=4)]
    pub addresses: Vec<HostAddress>,

    /// Only accept answers from the host with this uuid
    #[arg(long)]
    pub uuid: Option<String>,

    /// Time every address gets to answer
    #[arg(long, default_value_t = 3000)]
    pub timeout_ms: u64,

    /// How long to wait for further addresses after the first answer
    #[arg(long, default_value_t = 2000)]
    pub window_ms: u64,

    /// Client id sent along with each probe
    #[arg(long, default_value = "0123456789ABCDEF", env = "HOSTWATCH_UNIQUE_ID")]
    pub unique_id: String,

    #[arg(long, value_enum, default_value_t)]
    pub log_format: LogFormat,
}
