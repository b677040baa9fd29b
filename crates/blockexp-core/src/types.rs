//! Ledger documents and the node payload shapes they are built from.
//!
//! Ledger documents (`Block`, `Transaction`, `Coin`, `Wallet`,
//! `WalletAddress`) are what the store persists and the provider returns.
//! Node payloads (`NodeBlock`, `NodeTransaction`, ...) are the normalized
//! form of a daemon's `getblock`/`getrawtransaction` JSON, common to every
//! supported chain.

use std::str::FromStr;

use bitcoin::{Amount, BlockHash, OutPoint, TxMerkleNode, Txid};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// `spentHeight` of a coin that has not been spent.
pub const UNSPENT_HEIGHT: i64 = -2;

/// `blockHeight` of a transaction that is not yet in a block.
pub const MEMPOOL_HEIGHT: i64 = -1;

// ==============================================================================
// Block Height
// ==============================================================================

/// A block height, wrapped for type safety.
///
/// `#[serde(transparent)]` keeps the JSON representation a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u32);

impl BlockHeight {
    /// Signed form, comparable with coin and transaction heights.
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }
}

impl From<u32> for BlockHeight {
    fn from(h: u32) -> Self {
        Self(h)
    }
}

impl From<BlockHeight> for u32 {
    fn from(h: BlockHeight) -> Self {
        h.0
    }
}

impl std::ops::Deref for BlockHeight {
    type Target = u32;
    fn deref(&self) -> &u32 {
        &self.0
    }
}

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Confirmations of something recorded at `height`, relative to `tip`.
pub fn confirmations(tip: BlockHeight, height: i64) -> i64 {
    tip.as_i64() - height + 1
}

/// A block addressed either by height or by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Height(BlockHeight),
    Hash(BlockHash),
}

impl FromStr for BlockId {
    type Err = bitcoin::hex::HexToArrayError;

    /// Decimal strings are heights; anything else must be a block hash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(height) = s.parse::<u32>() {
            return Ok(Self::Height(BlockHeight(height)));
        }
        s.parse().map(Self::Hash)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Height(height) => height.fmt(f),
            Self::Hash(hash) => hash.fmt(f),
        }
    }
}

impl From<BlockHeight> for BlockId {
    fn from(height: BlockHeight) -> Self {
        Self::Height(height)
    }
}

impl From<BlockHash> for BlockId {
    fn from(hash: BlockHash) -> Self {
        Self::Hash(hash)
    }
}

/// Store-assigned wallet identity used in `wallets` tag arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub u64);

impl std::fmt::Display for WalletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Ledger Documents
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub chain: String,
    pub network: String,
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub previous_block_hash: Option<BlockHash>,
    pub next_block_hash: Option<BlockHash>,
    pub merkle_root: TxMerkleNode,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    /// Block time forced to be strictly increasing along the chain.
    #[serde(with = "time::serde::rfc3339")]
    pub time_normalized: OffsetDateTime,
    pub nonce: u64,
    pub bits: u32,
    pub size: u64,
    pub version: i64,
    pub transaction_count: u64,
    /// Sum of coinbase outputs, in satoshis.
    pub reward: u64,
    /// Derived on read; never trusted from storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<i64>,
    #[serde(default)]
    pub processed: Option<bool>,
}

impl Block {
    pub fn with_confirmations(mut self, tip: BlockHeight) -> Self {
        self.confirmations = Some(confirmations(tip, self.height.as_i64()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub txid: Txid,
    pub chain: String,
    pub network: String,
    /// [`MEMPOOL_HEIGHT`] while unconfirmed.
    pub block_height: i64,
    pub block_hash: Option<BlockHash>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub block_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub block_time_normalized: Option<OffsetDateTime>,
    pub coinbase: bool,
    /// Satoshis, or -1 when the input values could not all be resolved.
    pub fee: i64,
    pub size: u64,
    pub locktime: u32,
    pub input_count: u64,
    pub output_count: u64,
    /// Sum of outputs, in satoshis.
    pub value: u64,
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub wallets: Vec<WalletId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<i64>,
}

impl Transaction {
    pub fn with_confirmations(mut self, tip: BlockHeight) -> Self {
        if self.block_height >= 0 {
            self.confirmations = Some(confirmations(tip, self.block_height));
        }
        self
    }
}

/// A transaction output tracked with its mint and spend provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coin {
    pub chain: String,
    pub network: String,
    pub mint_txid: Txid,
    pub mint_index: u32,
    pub mint_height: i64,
    pub coinbase: bool,
    /// Satoshis.
    pub value: u64,
    /// `scriptPubKey` hex.
    pub script: String,
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub spent_txid: Option<Txid>,
    /// [`UNSPENT_HEIGHT`] until spent.
    pub spent_height: i64,
    #[serde(default)]
    pub wallets: Vec<WalletId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<i64>,
}

impl Coin {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.mint_txid, self.mint_index)
    }

    pub fn is_unspent(&self) -> bool {
        self.spent_height < 0
    }

    pub fn with_confirmations(mut self, tip: BlockHeight) -> Self {
        self.confirmations = Some(confirmations(tip, self.mint_height));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: WalletId,
    pub chain: String,
    pub network: String,
    pub name: String,
    pub pub_key: String,
    pub path: Option<String>,
    pub single_address: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub chain: String,
    pub network: String,
    pub wallet: WalletId,
    pub address: String,
    /// Set once historical coins and transactions have been tagged.
    pub processed: bool,
}

// ==============================================================================
// API Models
// ==============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
    pub balance: u64,
}

impl Balance {
    /// Sum coin values. Imported coins always have `mintHeight >= 0`, so the
    /// unconfirmed bucket only fills if unconfirmed coins are ever stored.
    pub fn from_coins<'a>(coins: impl IntoIterator<Item = &'a Coin>) -> Self {
        coins.into_iter().fold(Self::default(), |mut acc, coin| {
            if coin.mint_height >= 0 {
                acc.confirmed += coin.value;
            } else {
                acc.unconfirmed += coin.value;
            }
            acc.balance += coin.value;
            acc
        })
    }
}

/// Result of `estimatesmartfee`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateFee {
    /// BTC per kvB; absent when the node has too little data.
    pub feerate: Option<f64>,
    /// Confirmation target the estimate is valid for; may differ from the
    /// requested target.
    pub blocks: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Txid);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinListing {
    pub inputs: Vec<Coin>,
    pub outputs: Vec<Coin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTransactionCount {
    /// UTC calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTransactions {
    pub chain: String,
    pub network: String,
    pub results: Vec<DailyTransactionCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCheckResult {
    pub last_address: Option<String>,
    pub sum: u64,
}

// ==============================================================================
// Node Payloads
// ==============================================================================

/// A block as returned by `getblock`, normalized across chains.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBlock {
    pub hash: BlockHash,
    pub height: BlockHeight,
    pub version: i64,
    pub merkle_root: TxMerkleNode,
    /// Unix seconds.
    pub time: i64,
    pub nonce: u64,
    pub bits: u32,
    pub size: u64,
    pub previous_block_hash: Option<BlockHash>,
    pub next_block_hash: Option<BlockHash>,
    pub confirmations: Option<i64>,
    /// Transaction count as reported by the node (`nTx`).
    pub transaction_count: u64,
    pub transactions: BlockTransactions,
}

/// Verbosity 1 yields txids; verbosity 2 yields decoded transactions.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockTransactions {
    Ids(Vec<Txid>),
    Full(Vec<NodeTransaction>),
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Full(txs) => txs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded transactions, or an empty slice for a txid-only block.
    pub fn full(&self) -> &[NodeTransaction] {
        match self {
            Self::Ids(_) => &[],
            Self::Full(txs) => txs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTransaction {
    pub txid: Txid,
    pub size: u64,
    pub locktime: u32,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<NodeOutput>,
    pub block_hash: Option<BlockHash>,
    pub block_time: Option<i64>,
    pub confirmations: Option<i64>,
}

impl NodeTransaction {
    /// Exactly one input, and that input carries a coinbase payload.
    pub fn is_coinbase(&self) -> bool {
        matches!(self.inputs.as_slice(), [NodeInput::Coinbase { .. }])
    }

    /// Sum of output values in satoshis.
    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value.to_sat()).sum()
    }

    /// First address of the first output that has one, plus every distinct
    /// output address in output order.
    pub fn output_addresses(&self) -> (Option<String>, Vec<String>) {
        let mut addresses: Vec<String> = Vec::new();
        for output in &self.outputs {
            for address in &output.addresses {
                if !addresses.contains(address) {
                    addresses.push(address.clone());
                }
            }
        }
        (addresses.first().cloned(), addresses)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    Coinbase { coinbase: String, sequence: u32 },
    Spend { prevout: OutPoint, sequence: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub value: Amount,
    pub n: u32,
    /// `scriptPubKey` hex.
    pub script: String,
    /// Node-reported script type (`pubkeyhash`, `witness_v0_keyhash`, ...).
    pub script_type: Option<String>,
    pub addresses: Vec<String>,
}
