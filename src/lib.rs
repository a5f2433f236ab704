//! # jvclink
//!
//! Integration engine for JVC Connected Cam broadcast cameras.
//!
//! This crate provides a headless engine that:
//! - Discovers compatible camcorders on the local network via mDNS
//! - Opens an authenticated HTTP/JSON control session per camera
//! - Mirrors camera parameters into an in-memory model with edit arbitration
//! - Ingests TSL UMD tally over UDP and routes it onto camera tally lamps
//! - Exposes a line-oriented TCP command port for third-party controllers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         jvclink engine                       │
//! │  ┌───────────┐   ┌──────────────┐   ┌──────────────────────┐ │
//! │  │ Locator   │──▶│ Engine       │──▶│ DeviceSession (xN)   │ │
//! │  │ (mdns-sd) │   │ supervisor   │   │ poll + command loop  │ │
//! │  └───────────┘   └──────┬───────┘   └──────────┬───────────┘ │
//! │                         │                      │             │
//! │                  ┌──────▼───────┐     ┌────────▼───────────┐ │
//! │                  │ ConfigStore  │     │ ParameterModel(xN) │ │
//! │                  │ (json file)  │     │ edit arbitration   │ │
//! │                  └──────────────┘     └────────▲───────────┘ │
//! │  ┌───────────┐   ┌──────────────┐              │             │
//! │  │ UMD (udp) │──▶│ TallyRouter  │──────────────┘             │
//! │  └───────────┘   └──────┬───────┘                            │
//! │                  ┌──────▼───────┐                            │
//! │                  │ CommandPort  │  <TALLY.PGM:n=v> over TCP  │
//! │                  └──────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key components
//!
//! - [`engine::Engine`] - supervisor owning all other components
//! - [`device::SharedDevices`] - device registry with index assignment
//! - [`device::session::DeviceSession`] - per-camera HTTP lifecycle
//! - [`device::model::ParameterModel`] - parameter mirror + arbitration
//! - [`tally::router::TallyRouter`] - UMD and direct tally fan-in
//! - [`command_port::CommandPortServer`] - controller-facing TCP protocol
//!
//! ## Command-line interface
//!
//! See [`Cli`]. Key options:
//!
//! - `-c, --config` - config file (default: platform config dir)
//! - `--umd-bind` - UMD listener bind address override
//! - `--command-bind` - command port bind address override
//! - `--poll-interval` - camera poll cadence in milliseconds
//! - `-v` - increase verbosity (use multiple times)

use clap::Parser;

pub mod command_port;
pub mod config;
pub mod device;
pub mod engine;
pub mod locator;
pub mod spec;
pub mod tally;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default cadence for the per-device poll loop.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Parser, Clone, Debug)]
#[command(name = "jvclink", version, about = "JVC Connected Cam integration engine")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Config file; defaults to the platform config directory
    #[arg(short, long)]
    pub config: Option<std::path::PathBuf>,

    /// Bind address for the UMD tally listener, e.g. 0.0.0.0:65000
    #[arg(long)]
    pub umd_bind: Option<String>,

    /// Bind address for the TCP command port, e.g. 0.0.0.0:9923
    #[arg(long)]
    pub command_bind: Option<String>,

    /// Camera poll cadence in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval: u64,

    /// Do not browse the network for cameras; use the config file only
    #[arg(long, default_value_t = false)]
    pub no_discovery: bool,
}

#[cfg(test)]
impl Cli {
    /// A Cli as if started with no arguments - only use for testing.
    pub fn new_fake() -> Self {
        Cli::parse_from(["jvclink"])
    }
}
