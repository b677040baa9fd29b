//! Shared test helpers for `blockexp-core` unit tests.
//!
//! Builders for node payloads (`coinbase_tx`, `spend_tx`) and ledger
//! documents (`make_coin`), plus a ready-made store/accessor fixture, so
//! tests across modules share a single source of truth for dummy data.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Txid};

use crate::accessor::normalize::BitcoinNormalizer;
use crate::accessor::Accessor;
use crate::rpc::mock::MockNode;
use crate::store::{Database, Ledger};
use crate::types::{Coin, NodeInput, NodeOutput, NodeTransaction, UNSPENT_HEIGHT};

pub const CHAIN: &str = "BTC";
pub const NETWORK: &str = "regtest";

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// A deterministic placeholder `scriptPubKey` hex for `address`.
pub fn script_for(address: &str) -> String {
    let mut script = String::from("0014");
    for byte in address.bytes().cycle().take(20) {
        script.push_str(&format!("{byte:02x}"));
    }
    script
}

// ==============================================================================
// Node Payload Builders
// ==============================================================================

fn outputs(paying: &[(&str, u64)]) -> Vec<NodeOutput> {
    paying
        .iter()
        .enumerate()
        .map(|(n, (address, sats))| NodeOutput {
            value: Amount::from_sat(*sats),
            n: n as u32,
            script: script_for(address),
            script_type: Some("witness_v0_keyhash".into()),
            addresses: vec![(*address).to_owned()],
        })
        .collect()
}

/// A coinbase transaction paying `(address, sats)` pairs.
pub fn coinbase_tx(txid: Txid, paying: &[(&str, u64)]) -> NodeTransaction {
    NodeTransaction {
        txid,
        size: 120,
        locktime: 0,
        inputs: vec![NodeInput::Coinbase {
            coinbase: "51".into(),
            sequence: 0xFFFF_FFFF,
        }],
        outputs: outputs(paying),
        block_hash: None,
        block_time: None,
        confirmations: None,
    }
}

/// A transaction spending `prevouts` and paying `(address, sats)` pairs.
pub fn spend_tx(txid: Txid, prevouts: &[OutPoint], paying: &[(&str, u64)]) -> NodeTransaction {
    NodeTransaction {
        txid,
        size: 225,
        locktime: 0,
        inputs: prevouts
            .iter()
            .map(|prevout| NodeInput::Spend {
                prevout: *prevout,
                sequence: 0xFFFF_FFFE,
            })
            .collect(),
        outputs: outputs(paying),
        block_hash: None,
        block_time: None,
        confirmations: None,
    }
}

// ==============================================================================
// Ledger Document Builders
// ==============================================================================

/// An unspent, non-coinbase coin minted at `height`.
pub fn make_coin(txid: Txid, index: u32, height: i64, address: &str, sats: u64) -> Coin {
    Coin {
        chain: CHAIN.into(),
        network: NETWORK.into(),
        mint_txid: txid,
        mint_index: index,
        mint_height: height,
        coinbase: false,
        value: sats,
        script: script_for(address),
        address: Some(address.into()),
        addresses: vec![address.into()],
        spent_txid: None,
        spent_height: UNSPENT_HEIGHT,
        wallets: Vec::new(),
        confirmations: None,
    }
}

// ==============================================================================
// Fixtures
// ==============================================================================

/// A mock node, an accessor over it and an empty in-memory ledger.
pub struct Fixture {
    pub node: Arc<MockNode>,
    pub accessor: Arc<Accessor>,
    pub database: Database,
    pub ledger: Arc<Ledger>,
}

pub async fn fixture() -> Fixture {
    fixture_with(MockNode::new()).await
}

pub async fn fixture_with(node: MockNode) -> Fixture {
    fixture_on(node, Database::in_memory(4)).await
}

/// Like [`fixture_with`], over a caller-supplied database.
pub async fn fixture_on(node: MockNode, database: Database) -> Fixture {
    let node = Arc::new(node);
    let accessor = Arc::new(Accessor::new(
        CHAIN,
        NETWORK,
        node.clone(),
        Arc::new(BitcoinNormalizer::new(bitcoin::Network::Regtest)),
    ));
    let ledger = database
        .connect()
        .await
        .expect("pool must hand out a connection")
        .ledger(CHAIN, NETWORK)
        .await
        .expect("in-memory ledger must open");
    ledger
        .create_indexes()
        .await
        .expect("indexes must be created");
    Fixture {
        node,
        accessor,
        database,
        ledger,
    }
}
