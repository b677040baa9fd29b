use std::path::PathBuf;

use clap::Parser;

/// blockexp: indexes blocks, transactions and coins of one or more
/// bitcoind-compatible nodes into a queryable ledger.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "blockexp.toml", env = "BLOCKEXP_CONFIG")]
    pub config: PathBuf,

    /// Snapshot directory; overrides `store.data_dir`.
    #[arg(long, env = "BLOCKEXP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Seconds between steady-state sync iterations; overrides
    /// `sync.poll_interval_secs`.
    #[arg(long, env = "BLOCKEXP_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,
}
