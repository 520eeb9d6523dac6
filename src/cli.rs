//! Command-line interface definitions.
//!
//! Uses clap derive API for argument parsing. Every knob also reads from
//! the environment so deployments can configure the daemon without a
//! wrapper script.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use crate::ingest::{Region, REGIONS};

/// Per-minute adx bid-request distribution pipeline.
#[derive(Parser, Debug)]
#[command(name = "adx-relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Admin HTTP port
    #[arg(long, short = 'p', env = "ADX_RELAY_PORT", default_value = "8080")]
    pub port: u16,

    /// Dedup snapshot file
    #[arg(long, env = "ADX_RELAY_STATE_FILE", default_value = "./bloom_state.bin")]
    pub state_file: PathBuf,

    /// Redis URL holding the demand buckets
    #[arg(
        long,
        env = "ADX_RELAY_REDIS_URL",
        default_value = "redis://127.0.0.1:6379/0"
    )]
    pub redis_url: String,

    /// Override the DE upload-bucket endpoint
    #[arg(long, env = "ADX_RELAY_ENDPOINT_DE")]
    pub endpoint_de: Option<String>,

    /// Override the SG upload-bucket endpoint
    #[arg(long, env = "ADX_RELAY_ENDPOINT_SG")]
    pub endpoint_sg: Option<String>,

    /// Override the US upload-bucket endpoint
    #[arg(long, env = "ADX_RELAY_ENDPOINT_US")]
    pub endpoint_us: Option<String>,

    /// Port the downstream workers listen on
    #[arg(long, env = "ADX_RELAY_WORKER_PORT", default_value = "8103")]
    pub worker_port: u16,

    /// ip2region database file
    #[arg(long, env = "ADX_RELAY_XDB_PATH", default_value = "./ip2region.xdb")]
    pub xdb_path: PathBuf,

    /// Enable verbose debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(long)]
    pub quiet: bool,
}

impl Cli {
    /// Per-region bucket endpoints, overrides applied over the defaults.
    #[must_use]
    pub fn endpoints(&self) -> HashMap<Region, String> {
        REGIONS
            .iter()
            .map(|&region| {
                let override_ = match region {
                    Region::De => &self.endpoint_de,
                    Region::Sg => &self.endpoint_sg,
                    Region::Us => &self.endpoint_us,
                };
                let endpoint = override_
                    .clone()
                    .unwrap_or_else(|| region.default_endpoint().to_string());
                (region, endpoint)
            })
            .collect()
    }
}
