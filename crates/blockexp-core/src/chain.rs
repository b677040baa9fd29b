//! Chain registry: which normalizer serves which chain.

use std::sync::Arc;

use bitcoin::Network;

use crate::accessor::normalize::{BitcoinNormalizer, LegacyForkNormalizer, PayloadNormalizer};
use crate::accessor::Accessor;
use crate::error::CoreError;
use crate::rpc::HttpRpcClient;

/// Chains this indexer can follow.
pub const SUPPORTED_CHAINS: &[&str] = &["BTC", "PCH", "ABLE"];

/// One daemon to index: `chain` and `network` name the ledger namespace,
/// `url` is the daemon's JSON-RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainTarget {
    pub chain: String,
    pub network: String,
    pub url: String,
}

impl ChainTarget {
    pub fn new(chain: impl Into<String>, network: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            network: network.into(),
            url: url.into(),
        }
    }

    /// Supervisor key.
    pub fn key(&self) -> (String, String) {
        (self.chain.clone(), self.network.clone())
    }
}

/// Map a network name onto Bitcoin address parameters.
pub fn bitcoin_network(network: &str) -> Result<Network, CoreError> {
    match network {
        "mainnet" | "main" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(CoreError::Config(format!("unknown network `{other}`"))),
    }
}

pub fn normalizer_for(chain: &str, network: &str) -> Result<Arc<dyn PayloadNormalizer>, CoreError> {
    match chain {
        "BTC" => Ok(Arc::new(BitcoinNormalizer::new(bitcoin_network(network)?))),
        "PCH" => Ok(Arc::new(LegacyForkNormalizer::pch())),
        "ABLE" => Ok(Arc::new(LegacyForkNormalizer::able())),
        other => Err(CoreError::Config(format!(
            "unsupported chain `{other}`; expected one of {}",
            SUPPORTED_CHAINS.join(", ")
        ))),
    }
}

/// Build an HTTP-backed accessor for `target`.
pub fn build_accessor(
    target: &ChainTarget,
    requests_per_second: Option<u32>,
) -> Result<Accessor, CoreError> {
    let normalizer = normalizer_for(&target.chain, &target.network)?;
    let client = HttpRpcClient::new(&target.url, requests_per_second)?;
    Ok(Accessor::new(
        target.chain.clone(),
        target.network.clone(),
        Arc::new(client),
        normalizer,
    ))
}
