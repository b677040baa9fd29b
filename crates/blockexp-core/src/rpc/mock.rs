use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use serde_json::{json, Value};

use crate::error::{CoreError, RpcError};
use crate::types::{NodeInput, NodeTransaction};

use super::RpcTransport;

/// Unix time of the first mined block unless a block sets its own.
pub const BASE_TIME: i64 = 1_600_000_000;

/// An in-process node answering the RPC methods the indexer consumes.
///
/// Blocks are kept as decoded transactions and rendered to the JSON shapes
/// bitcoind produces, at verbosity 1 or 2, or through the boolean-only
/// `getblock` of older daemons when built with [`MockNode::legacy`].
pub struct MockNode {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    blocks: Vec<MockBlock>,
    mempool: Vec<NodeTransaction>,
    legacy: bool,
    fork: u8,
    hidden: HashSet<Txid>,
    calls: HashMap<String, usize>,
    broadcasts: Vec<String>,
}

struct MockBlock {
    hash: BlockHash,
    time: i64,
    txs: Vec<NodeTransaction>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// A node whose `getblock` only accepts a boolean verbosity.
    pub fn legacy() -> Self {
        let node = Self::new();
        node.lock().legacy = true;
        node
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock node mutex poisoned")
    }

    /// Append a block containing `txs`, spaced ten minutes after its parent.
    pub fn mine(&self, txs: Vec<NodeTransaction>) -> BlockHash {
        let time = {
            let state = self.lock();
            state
                .blocks
                .last()
                .map(|b| b.time + 600)
                .unwrap_or(BASE_TIME)
        };
        self.mine_at(time, txs)
    }

    pub fn mine_at(&self, time: i64, txs: Vec<NodeTransaction>) -> BlockHash {
        let mut state = self.lock();
        let height = state.blocks.len() as u32;
        let hash = block_hash(height, state.fork);
        state.blocks.push(MockBlock { hash, time, txs });
        hash
    }

    /// Mine `count` blocks, each holding one coinbase paying `address`.
    pub fn mine_empty(&self, count: u32, address: &str) {
        for _ in 0..count {
            let (height, fork) = {
                let state = self.lock();
                (state.blocks.len() as u32, state.fork)
            };
            let txid = coinbase_txid(height, fork);
            self.mine(vec![crate::test_util::coinbase_tx(
                txid,
                &[(address, 50 * 100_000_000)],
            )]);
        }
    }

    /// Drop every block above `height` and switch to a new fork so blocks
    /// mined afterwards get different hashes.
    pub fn rewind(&self, height: u32) {
        let mut state = self.lock();
        state.blocks.truncate(height as usize + 1);
        state.fork = state.fork.wrapping_add(1);
    }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.lock().blocks.get(height as usize).map(|b| b.hash)
    }

    /// Make `getrawtransaction` answer `-5` for `txid`.
    pub fn hide_transaction(&self, txid: Txid) {
        self.lock().hidden.insert(txid);
    }

    pub fn add_to_mempool(&self, tx: NodeTransaction) {
        self.lock().mempool.push(tx);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.lock().broadcasts.clone()
    }
}

/// Deterministic hash for the block at `height` on fork `fork`.
pub fn block_hash(height: u32, fork: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    bytes[4] = fork;
    bytes[31] = 0xbb;
    BlockHash::from_byte_array(bytes)
}

fn coinbase_txid(height: u32, fork: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    bytes[4] = fork;
    bytes[31] = 0xcb;
    Txid::from_byte_array(bytes)
}

fn server_error(code: i64, message: &str) -> CoreError {
    CoreError::Rpc(RpcError::Server {
        code,
        message: message.to_owned(),
    })
}

fn tx_json(tx: &NodeTransaction, block: Option<(&MockBlock, u32)>, tip: u32) -> Value {
    let vin: Vec<Value> = tx
        .inputs
        .iter()
        .map(|input| match input {
            NodeInput::Coinbase { coinbase, sequence } => {
                json!({ "coinbase": coinbase, "sequence": sequence })
            }
            NodeInput::Spend { prevout, sequence } => json!({
                "txid": prevout.txid.to_string(),
                "vout": prevout.vout,
                "scriptSig": { "asm": "", "hex": "" },
                "sequence": sequence,
            }),
        })
        .collect();
    let vout: Vec<Value> = tx
        .outputs
        .iter()
        .map(|output| {
            let mut script = json!({
                "asm": "",
                "hex": output.script,
                "type": output.script_type.clone().unwrap_or_else(|| "nonstandard".into()),
            });
            if let Some(address) = output.addresses.first() {
                script["address"] = json!(address);
            }
            json!({ "value": output.value.to_btc(), "n": output.n, "scriptPubKey": script })
        })
        .collect();

    let mut value = json!({
        "txid": tx.txid.to_string(),
        "hash": tx.txid.to_string(),
        "version": 2,
        "size": tx.size,
        "vsize": tx.size,
        "weight": tx.size * 4,
        "locktime": tx.locktime,
        "vin": vin,
        "vout": vout,
    });
    if let Some((block, height)) = block {
        value["blockhash"] = json!(block.hash.to_string());
        value["confirmations"] = json!(tip - height + 1);
        value["time"] = json!(block.time);
        value["blocktime"] = json!(block.time);
    }
    value
}

impl State {
    fn tip(&self) -> u32 {
        self.blocks.len().saturating_sub(1) as u32
    }

    fn find_block(&self, hash: &BlockHash) -> Option<(usize, &MockBlock)> {
        self.blocks.iter().enumerate().find(|(_, b)| &b.hash == hash)
    }

    fn block_json(&self, height: usize, full: bool) -> Value {
        let block = &self.blocks[height];
        let tip = self.tip();
        let tx: Vec<Value> = if full {
            block
                .txs
                .iter()
                .map(|tx| tx_json(tx, Some((block, height as u32)), tip))
                .collect()
        } else {
            block.txs.iter().map(|tx| json!(tx.txid.to_string())).collect()
        };
        let mut value = json!({
            "hash": block.hash.to_string(),
            "confirmations": tip - height as u32 + 1,
            "size": 285 + block.txs.iter().map(|t| t.size).sum::<u64>(),
            "strippedsize": 285,
            "weight": 1140,
            "height": height,
            "version": 536870912,
            "versionHex": "20000000",
            "merkleroot": "0000000000000000000000000000000000000000000000000000000000000000",
            "tx": tx,
            "time": block.time,
            "mediantime": block.time,
            "nonce": height,
            "bits": "207fffff",
            "difficulty": 4.656542373906925e-10,
            "chainwork": "0000000000000000000000000000000000000000000000000000000000000002",
            "nTx": block.txs.len(),
        });
        if height > 0 {
            value["previousblockhash"] = json!(self.blocks[height - 1].hash.to_string());
        }
        if let Some(next) = self.blocks.get(height + 1) {
            value["nextblockhash"] = json!(next.hash.to_string());
        }
        value
    }

    fn getblock(&self, params: &[Value]) -> Result<Value, CoreError> {
        let hash: BlockHash = params
            .first()
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| server_error(-8, "blockhash must be hexadecimal string"))?;
        let full = match params.get(1) {
            Some(Value::Bool(verbose)) => {
                if !verbose {
                    return Err(server_error(-8, "raw block output not supported by mock"));
                }
                false
            }
            Some(Value::Number(_)) if self.legacy => {
                return Err(server_error(-1, "JSON value is not a boolean as expected"));
            }
            Some(Value::Number(n)) => n.as_u64() == Some(2),
            _ => false,
        };
        let (height, _) = self
            .find_block(&hash)
            .ok_or_else(|| server_error(-5, "Block not found"))?;
        Ok(self.block_json(height, full))
    }

    fn getrawtransaction(&self, params: &[Value]) -> Result<Value, CoreError> {
        let txid: Txid = params
            .first()
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| server_error(-8, "txid must be hexadecimal string"))?;
        let missing = || server_error(-5, "No such mempool or blockchain transaction");
        if self.hidden.contains(&txid) {
            return Err(missing());
        }
        let tip = self.tip();
        for (height, block) in self.blocks.iter().enumerate() {
            if let Some(tx) = block.txs.iter().find(|tx| tx.txid == txid) {
                return Ok(tx_json(tx, Some((block, height as u32)), tip));
            }
        }
        self.mempool
            .iter()
            .find(|tx| tx.txid == txid)
            .map(|tx| tx_json(tx, None, tip))
            .ok_or_else(missing)
    }
}

#[async_trait]
impl RpcTransport for MockNode {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CoreError> {
        let mut state = self.lock();
        *state.calls.entry(method.to_owned()).or_default() += 1;
        match method {
            "getbestblockhash" => state
                .blocks
                .last()
                .map(|b| json!(b.hash.to_string()))
                .ok_or_else(|| server_error(-1, "no blocks")),
            "getblockhash" => {
                let height = params.first().and_then(Value::as_u64).unwrap_or(u64::MAX);
                state
                    .blocks
                    .get(height as usize)
                    .map(|b| json!(b.hash.to_string()))
                    .ok_or_else(|| server_error(-8, "Block height out of range"))
            }
            "getblock" => state.getblock(&params),
            "getrawtransaction" => state.getrawtransaction(&params),
            "estimatesmartfee" => {
                let target = params.first().and_then(Value::as_u64).unwrap_or(6);
                Ok(json!({ "feerate": 0.0002, "blocks": target.max(2) }))
            }
            "sendrawtransaction" => {
                let raw = params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| server_error(-8, "hexstring required"))?;
                if raw.is_empty() || raw.len() % 2 != 0 {
                    return Err(server_error(-22, "TX decode failed"));
                }
                state.broadcasts.push(raw.to_owned());
                Ok(json!(coinbase_txid(u32::MAX, 0xee).to_string()))
            }
            other => Err(server_error(-32601, &format!("Method not found: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{coinbase_tx, txid_from_byte};

    #[tokio::test]
    async fn getblockhash_out_of_range_is_minus_eight() {
        let node = MockNode::new();
        node.mine_empty(2, "miner");
        let err = node
            .call("getblockhash", vec![json!(5)])
            .await
            .expect_err("height 5 does not exist");
        assert_eq!(err.rpc_code(), Some(-8));
    }

    #[tokio::test]
    async fn legacy_node_rejects_numeric_verbosity() {
        let node = MockNode::legacy();
        let hash = node.mine(vec![coinbase_tx(txid_from_byte(1), &[("a", 1)])]);
        let err = node
            .call("getblock", vec![json!(hash.to_string()), json!(2)])
            .await
            .expect_err("legacy getblock rejects integers");
        assert_eq!(err.rpc_code(), Some(-1));

        let block = node
            .call("getblock", vec![json!(hash.to_string()), json!(true)])
            .await
            .expect("boolean verbosity works");
        assert_eq!(block["tx"][0], json!(txid_from_byte(1).to_string()));
    }

    #[tokio::test]
    async fn rewind_changes_hashes_of_new_blocks() {
        let node = MockNode::new();
        node.mine_empty(3, "miner");
        let old = node.hash_at(2).expect("height 2 exists");
        node.rewind(1);
        assert_eq!(node.hash_at(2), None);
        node.mine_empty(1, "miner");
        assert_ne!(node.hash_at(2), Some(old));
        assert_eq!(node.calls("getblock"), 0);
    }
}
