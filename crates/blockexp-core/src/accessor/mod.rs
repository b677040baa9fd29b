//! Chain-read primitives over one daemon.
//!
//! An [`Accessor`] wraps an [`RpcTransport`] for a single `(chain, network)`
//! and turns raw daemon JSON into node payloads and ledger documents. It
//! detects once whether the daemon only understands the boolean `getblock`
//! verbosity of older releases and hydrates full blocks itself in that case.

pub mod normalize;
mod parsing;

use std::num::NonZeroUsize;
use std::sync::Arc;

use bitcoin::{BlockHash, Txid};
use lru::LruCache;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CoreError, NotFound};
use crate::rpc::RpcTransport;
use crate::types::{
    Block, BlockHeight, BlockId, BlockTransactions, EstimateFee, NodeBlock, NodeTransaction,
    Transaction, TransactionId, MEMPOOL_HEIGHT,
};

use self::normalize::PayloadNormalizer;
use self::parsing::{parse_block, parse_transaction, parse_txid};

/// `getblock` rejected a numeric verbosity.
const LEGACY_GETBLOCK_CODE: i64 = -1;
/// `getrawtransaction`/`getblock` for an unknown id.
const NOT_FOUND_CODE: i64 = -5;
/// `getblockhash` above the tip.
const OUT_OF_RANGE_CODE: i64 = -8;

/// Maximum number of block-hash → (height, time) entries cached in memory.
const BLOCK_CACHE_CAP: usize = 10_000;

/// How much of a block `getblock` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Header fields plus txids.
    Header = 1,
    /// Header fields plus decoded transactions.
    Full = 2,
}

pub struct Accessor {
    chain: String,
    network: String,
    rpc: Arc<dyn RpcTransport>,
    normalizer: Arc<dyn PayloadNormalizer>,
    /// Set by the first `getblock`; never re-probed.
    legacy_getblock: OnceCell<bool>,
    /// Confirmed block positions are immutable until a reorg replaces the
    /// hash, so entries only need eviction.
    block_cache: RwLock<LruCache<BlockHash, (BlockHeight, i64)>>,
}

impl Accessor {
    pub fn new(
        chain: impl Into<String>,
        network: impl Into<String>,
        rpc: Arc<dyn RpcTransport>,
        normalizer: Arc<dyn PayloadNormalizer>,
    ) -> Self {
        Self {
            chain: chain.into(),
            network: network.into(),
            rpc,
            normalizer,
            legacy_getblock: OnceCell::new(),
            block_cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_CAP).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Whether the daemon was detected as boolean-`getblock` only.
    /// `None` until the first block has been fetched.
    pub fn is_legacy(&self) -> Option<bool> {
        self.legacy_getblock.get().copied()
    }

    // ==========================================================================
    // Blocks
    // ==========================================================================

    pub async fn get_block_hash(&self, height: BlockHeight) -> Result<BlockHash, CoreError> {
        let raw = self
            .rpc
            .call("getblockhash", vec![json!(height.0)])
            .await
            .map_err(|err| match err.rpc_code() {
                Some(OUT_OF_RANGE_CODE) => NotFound::Block(height.to_string()).into(),
                _ => err,
            })?;
        parsing::parse_block_hash(Some(&raw), "getblockhash result")
    }

    async fn resolve_hash(&self, id: BlockId) -> Result<BlockHash, CoreError> {
        match id {
            BlockId::Hash(hash) => Ok(hash),
            BlockId::Height(height) => self.get_block_hash(height).await,
        }
    }

    /// Header fields and txids of a block.
    pub async fn get_block_header(&self, id: impl Into<BlockId>) -> Result<NodeBlock, CoreError> {
        self.fetch_block(id.into(), Verbosity::Header).await
    }

    /// A block with every transaction decoded. Used by the synchronizer.
    pub async fn get_raw_block(&self, id: impl Into<BlockId>) -> Result<NodeBlock, CoreError> {
        self.fetch_block(id.into(), Verbosity::Full).await
    }

    /// A block in ledger document shape, without its transactions.
    pub async fn get_block(&self, id: impl Into<BlockId>) -> Result<Block, CoreError> {
        let block = self.get_block_header(id).await?;
        self.block_document(&block)
    }

    /// The daemon's best block.
    pub async fn get_local_tip(&self) -> Result<Block, CoreError> {
        let raw = self.rpc.call("getbestblockhash", Vec::new()).await?;
        let hash = parsing::parse_block_hash(Some(&raw), "getbestblockhash result")?;
        self.get_block(hash).await
    }

    async fn fetch_block(&self, id: BlockId, verbosity: Verbosity) -> Result<NodeBlock, CoreError> {
        let hash = self.resolve_hash(id).await?;
        let mut raw = self.getblock(hash, verbosity).await.map_err(|err| {
            match err.rpc_code() {
                Some(NOT_FOUND_CODE) => NotFound::Block(id.to_string()).into(),
                _ => err,
            }
        })?;

        self.normalizer.fix_block(&mut raw);
        if verbosity == Verbosity::Full {
            if let Some(txs) = raw.get_mut("tx").and_then(Value::as_array_mut) {
                for tx in txs.iter_mut() {
                    self.normalizer.fix_transaction(tx);
                }
            }
        }

        let mut block = parse_block(&raw, verbosity)?;
        if let BlockTransactions::Full(txs) = &mut block.transactions {
            for tx in txs.iter_mut() {
                self.derive_addresses(tx);
            }
            if self.is_legacy() == Some(false) && block.transaction_count != txs.len() as u64 {
                warn!(
                    chain = %self.chain,
                    network = %self.network,
                    height = %block.height,
                    n_tx = block.transaction_count,
                    decoded = txs.len(),
                    "block transaction count differs from decoded transactions"
                );
            }
        }
        self.block_cache
            .write()
            .await
            .put(block.hash, (block.height, block.time));
        Ok(block)
    }

    /// `getblock` in whichever dialect the daemon speaks, probing on first use.
    async fn getblock(&self, hash: BlockHash, verbosity: Verbosity) -> Result<Value, CoreError> {
        let params = vec![json!(hash.to_string()), json!(verbosity as u8)];

        let mut probed = None;
        let slot = &mut probed;
        let rpc = &self.rpc;
        let (chain, network) = (&self.chain, &self.network);
        let probe_params = params.clone();
        let legacy = *self
            .legacy_getblock
            .get_or_try_init(|| async move {
                match rpc.call("getblock", probe_params).await {
                    Ok(raw) => {
                        *slot = Some(raw);
                        Ok(false)
                    }
                    Err(err) if err.rpc_code() == Some(LEGACY_GETBLOCK_CODE) => {
                        info!(%chain, %network, "daemon only accepts boolean getblock verbosity");
                        Ok(true)
                    }
                    Err(err) => Err(err),
                }
            })
            .await?;
        if let Some(raw) = probed {
            return Ok(raw);
        }
        if !legacy {
            return self.rpc.call("getblock", params).await;
        }

        let mut raw = self
            .rpc
            .call("getblock", vec![json!(hash.to_string()), json!(true)])
            .await?;
        if verbosity == Verbosity::Full {
            let txs = self.hydrate_legacy(&raw).await?;
            raw["tx"] = Value::Array(txs);
        }
        Ok(raw)
    }

    /// Fetch each transaction of a legacy verbosity-1 block.
    ///
    /// Transactions the daemon cannot find (the genesis coinbase, for
    /// instance) are skipped.
    async fn hydrate_legacy(&self, raw: &Value) -> Result<Vec<Value>, CoreError> {
        let txids = raw
            .get("tx")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let calls: Vec<(String, Vec<Value>)> = txids
            .iter()
            .map(|txid| ("getrawtransaction".to_owned(), vec![txid.clone(), json!(1)]))
            .collect();

        let results = self.rpc.batch(&calls).await?;
        let mut txs = Vec::with_capacity(results.len());
        for (txid, result) in txids.iter().zip(results) {
            match result {
                Ok(tx) => txs.push(tx),
                Err(err) if err.rpc_code() == Some(NOT_FOUND_CODE) => {
                    warn!(
                        chain = %self.chain,
                        network = %self.network,
                        txid = %txid,
                        "legacy block transaction unavailable; skipped"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(txs)
    }

    fn derive_addresses(&self, tx: &mut NodeTransaction) {
        for output in tx.outputs.iter_mut() {
            self.normalizer.derive_addresses(output);
        }
    }

    fn block_document(&self, block: &NodeBlock) -> Result<Block, CoreError> {
        let time = unix_time(block.time)?;
        Ok(Block {
            chain: self.chain.clone(),
            network: self.network.clone(),
            height: block.height,
            hash: block.hash,
            previous_block_hash: block.previous_block_hash,
            next_block_hash: block.next_block_hash,
            merkle_root: block.merkle_root,
            time,
            time_normalized: time,
            nonce: block.nonce,
            bits: block.bits,
            size: block.size,
            version: block.version,
            transaction_count: block.transaction_count,
            reward: block
                .transactions
                .full()
                .iter()
                .filter(|tx| tx.is_coinbase())
                .map(NodeTransaction::output_value)
                .sum(),
            confirmations: block.confirmations,
            processed: None,
        })
    }

    // ==========================================================================
    // Transactions
    // ==========================================================================

    /// A transaction in ledger document shape, as the daemon sees it.
    ///
    /// The fee is unknown here (`-1`) unless the transaction is a coinbase;
    /// mempool transactions get `blockHeight = -1`.
    pub async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        let mut raw = self
            .rpc
            .call("getrawtransaction", vec![json!(txid.to_string()), json!(1)])
            .await
            .map_err(|err| match err.rpc_code() {
                Some(NOT_FOUND_CODE) => NotFound::Transaction(txid.to_string()).into(),
                _ => err,
            })?;
        self.normalizer.fix_transaction(&mut raw);
        let mut tx = parse_transaction(&raw)?;
        self.derive_addresses(&mut tx);

        let position = match tx.block_hash {
            Some(hash) => Some(self.block_position(hash).await?),
            None => None,
        };
        let block_time = match position {
            Some((_, time)) => Some(unix_time(time)?),
            None => None,
        };
        let coinbase = tx.is_coinbase();
        let (address, addresses) = tx.output_addresses();
        Ok(Transaction {
            txid: tx.txid,
            chain: self.chain.clone(),
            network: self.network.clone(),
            block_height: position.map_or(MEMPOOL_HEIGHT, |(height, _)| height.as_i64()),
            block_hash: tx.block_hash,
            block_time,
            block_time_normalized: block_time,
            coinbase,
            fee: if coinbase { 0 } else { -1 },
            size: tx.size,
            locktime: tx.locktime,
            input_count: tx.inputs.len() as u64,
            output_count: tx.outputs.len() as u64,
            value: tx.output_value(),
            address,
            addresses,
            wallets: Vec::new(),
            confirmations: tx.confirmations,
        })
    }

    async fn block_position(&self, hash: BlockHash) -> Result<(BlockHeight, i64), CoreError> {
        // `LruCache::get` updates recency, hence the write lock.
        if let Some(position) = self.block_cache.write().await.get(&hash).copied() {
            return Ok(position);
        }
        debug!(chain = %self.chain, block = %hash, "block position cache miss");
        let block = self.get_block_header(hash).await?;
        Ok((block.height, block.time))
    }

    // ==========================================================================
    // Fees and broadcast
    // ==========================================================================

    /// `estimatesmartfee`; the returned `blocks` may differ from `target`.
    pub async fn get_fee(&self, target: u32) -> Result<EstimateFee, CoreError> {
        let raw = self
            .rpc
            .call("estimatesmartfee", vec![json!(target)])
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| CoreError::InvalidData(format!("invalid estimatesmartfee result: {e}")))
    }

    pub async fn broadcast_transaction(&self, raw_hex: &str) -> Result<TransactionId, CoreError> {
        let raw = self
            .rpc
            .call("sendrawtransaction", vec![json!(raw_hex)])
            .await?;
        let txid = parse_txid(Some(&raw), "sendrawtransaction result")?;
        info!(chain = %self.chain, network = %self.network, %txid, "transaction broadcast");
        Ok(TransactionId(txid))
    }
}

fn unix_time(seconds: i64) -> Result<OffsetDateTime, CoreError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| CoreError::InvalidData(format!("invalid block time {seconds}: {e}")))
}
