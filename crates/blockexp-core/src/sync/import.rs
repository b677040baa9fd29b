//! Ingestion of one block into the ledger.
//!
//! Writes happen in a fixed order: spends of previously committed coins,
//! newly minted coins, transactions, then the block itself. The block is
//! written last and acts as the commit marker; every step is an upsert or a
//! keyed update, so replaying a half-written height converges to the same
//! state.

use std::collections::HashMap;

use bitcoin::{BlockHash, OutPoint, Txid};
use time::{Duration, OffsetDateTime};

use crate::error::CoreError;
use crate::store::{update, Ledger, WriteOp};
use crate::types::{
    Block, Coin, NodeBlock, NodeInput, NodeTransaction, Transaction, UNSPENT_HEIGHT,
};

/// A spend of a coin minted in an earlier block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpendOp {
    pub(crate) prevout: OutPoint,
    pub(crate) spent_txid: Txid,
    pub(crate) spent_height: i64,
}

/// One coin per output of every transaction in the block.
pub(crate) fn plan_mints(chain: &str, network: &str, height: i64, txs: &[NodeTransaction]) -> Vec<Coin> {
    let mut coins = Vec::new();
    for tx in txs {
        let coinbase = tx.is_coinbase();
        for output in &tx.outputs {
            coins.push(Coin {
                chain: chain.to_owned(),
                network: network.to_owned(),
                mint_txid: tx.txid,
                mint_index: output.n,
                mint_height: height,
                coinbase,
                value: output.value.to_sat(),
                script: output.script.clone(),
                address: output.addresses.first().cloned(),
                addresses: output.addresses.clone(),
                spent_txid: None,
                spent_height: UNSPENT_HEIGHT,
                wallets: Vec::new(),
                confirmations: None,
            });
        }
    }
    coins
}

/// Spends of every non-coinbase input.
///
/// Inputs spending a coin minted in this same block are resolved on the
/// planned mint directly; only spends of earlier coins become store ops.
pub(crate) fn plan_spends(height: i64, txs: &[NodeTransaction], mints: &mut [Coin]) -> Vec<SpendOp> {
    let by_outpoint: HashMap<OutPoint, usize> = mints
        .iter()
        .enumerate()
        .map(|(i, coin)| (coin.outpoint(), i))
        .collect();

    let mut spends = Vec::new();
    for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
        for input in &tx.inputs {
            let NodeInput::Spend { prevout, .. } = input else {
                continue;
            };
            match by_outpoint.get(prevout) {
                Some(&i) => {
                    mints[i].spent_txid = Some(tx.txid);
                    mints[i].spent_height = height;
                }
                None => spends.push(SpendOp {
                    prevout: *prevout,
                    spent_txid: tx.txid,
                    spent_height: height,
                }),
            }
        }
    }
    spends
}

/// `sum(inputs) - sum(outputs)` in satoshis when every input value is
/// known, `-1` otherwise. Coinbase transactions pay no fee.
pub(crate) fn transaction_fee(tx: &NodeTransaction, input_values: &HashMap<OutPoint, u64>) -> i64 {
    if tx.is_coinbase() {
        return 0;
    }
    let mut total_in: u64 = 0;
    for input in &tx.inputs {
        let NodeInput::Spend { prevout, .. } = input else {
            return -1;
        };
        let Some(value) = input_values.get(prevout) else {
            return -1;
        };
        total_in = total_in.saturating_add(*value);
    }
    i64::try_from(total_in)
        .ok()
        .and_then(|total_in| {
            i64::try_from(tx.output_value())
                .ok()
                .map(|total_out| total_in - total_out)
        })
        .unwrap_or(-1)
}

/// Block time forced strictly above the parent's normalized time.
pub(crate) fn normalized_time(time: OffsetDateTime, previous: Option<&Block>) -> OffsetDateTime {
    match previous {
        Some(prev) if time <= prev.time_normalized => prev.time_normalized + Duration::seconds(1),
        _ => time,
    }
}

/// Write `raw` into `ledger`. `previous` is the stored block one height
/// below, used for time normalization.
pub(crate) async fn import_block(
    ledger: &Ledger,
    raw: &NodeBlock,
    previous: Option<&Block>,
) -> Result<Block, CoreError> {
    let (chain, network) = (ledger.chain(), ledger.network());
    let height = raw.height.as_i64();
    let txs = raw.transactions.full();

    let mut mints = plan_mints(chain, network, height, txs);
    let spends = plan_spends(height, txs, &mut mints);

    // Input values for fees: same-block mints first, then stored coins.
    let mut input_values: HashMap<OutPoint, u64> =
        mints.iter().map(|coin| (coin.outpoint(), coin.value)).collect();
    for spend in &spends {
        if let Some(coin) = ledger
            .coins
            .get(&(spend.prevout.txid, spend.prevout.vout))
            .await?
        {
            input_values.insert(spend.prevout, coin.value);
        }
    }

    let time = OffsetDateTime::from_unix_timestamp(raw.time)
        .map_err(|e| CoreError::InvalidData(format!("invalid block time {}: {e}", raw.time)))?;
    let time_normalized = normalized_time(time, previous);

    write_spends(ledger, spends).await?;
    write_mints(ledger, mints).await?;
    write_transactions(ledger, raw, txs, time, time_normalized, &input_values).await?;

    let block = Block {
        chain: chain.to_owned(),
        network: network.to_owned(),
        height: raw.height,
        hash: raw.hash,
        previous_block_hash: raw.previous_block_hash,
        next_block_hash: None,
        merkle_root: raw.merkle_root,
        time,
        time_normalized,
        nonce: raw.nonce,
        bits: raw.bits,
        size: raw.size,
        version: raw.version,
        transaction_count: raw.transaction_count,
        reward: txs
            .iter()
            .filter(|tx| tx.is_coinbase())
            .map(NodeTransaction::output_value)
            .sum(),
        confirmations: None,
        processed: None,
    };
    write_block(ledger, &block).await?;
    Ok(block)
}

async fn write_spends(ledger: &Ledger, spends: Vec<SpendOp>) -> Result<(), CoreError> {
    let ops = spends
        .into_iter()
        .map(|spend| {
            let SpendOp {
                prevout,
                spent_txid,
                spent_height,
            } = spend;
            WriteOp::UpdateOne {
                key: (prevout.txid, prevout.vout),
                update: update(move |coin: &mut Coin| {
                    if coin.is_unspent() || coin.spent_txid == Some(spent_txid) {
                        coin.spent_txid = Some(spent_txid);
                        coin.spent_height = spent_height;
                    }
                }),
            }
        })
        .collect();
    ledger.coins.bulk_write(ops).await?;
    Ok(())
}

async fn write_mints(ledger: &Ledger, mints: Vec<Coin>) -> Result<(), CoreError> {
    let ops = mints
        .into_iter()
        .map(|mint| {
            let fields = mint.clone();
            WriteOp::UpsertOne {
                insert: mint,
                update: update(move |coin: &mut Coin| {
                    coin.mint_height = fields.mint_height;
                    coin.coinbase = fields.coinbase;
                    coin.value = fields.value;
                    coin.script.clone_from(&fields.script);
                    coin.address.clone_from(&fields.address);
                    coin.addresses.clone_from(&fields.addresses);
                    if fields.spent_txid.is_some() {
                        coin.spent_txid = fields.spent_txid;
                        coin.spent_height = fields.spent_height;
                    }
                }),
            }
        })
        .collect();
    ledger.coins.bulk_write(ops).await?;
    Ok(())
}

async fn write_transactions(
    ledger: &Ledger,
    raw: &NodeBlock,
    txs: &[NodeTransaction],
    time: OffsetDateTime,
    time_normalized: OffsetDateTime,
    input_values: &HashMap<OutPoint, u64>,
) -> Result<(), CoreError> {
    let ops = txs
        .iter()
        .map(|tx| {
            let (address, addresses) = tx.output_addresses();
            let doc = Transaction {
                txid: tx.txid,
                chain: ledger.chain().to_owned(),
                network: ledger.network().to_owned(),
                block_height: raw.height.as_i64(),
                block_hash: Some(raw.hash),
                block_time: Some(time),
                block_time_normalized: Some(time_normalized),
                coinbase: tx.is_coinbase(),
                fee: transaction_fee(tx, input_values),
                size: tx.size,
                locktime: tx.locktime,
                input_count: tx.inputs.len() as u64,
                output_count: tx.outputs.len() as u64,
                value: tx.output_value(),
                address,
                addresses,
                wallets: Vec::new(),
                confirmations: None,
            };
            let fields = doc.clone();
            WriteOp::UpsertOne {
                insert: doc,
                update: update(move |stored: &mut Transaction| {
                    let wallets = std::mem::take(&mut stored.wallets);
                    *stored = fields.clone();
                    stored.wallets = wallets;
                }),
            }
        })
        .collect();
    ledger.transactions.bulk_write(ops).await?;
    Ok(())
}

async fn write_block(ledger: &Ledger, block: &Block) -> Result<(), CoreError> {
    let fields = block.clone();
    let hash = block.hash;
    let mut ops = vec![WriteOp::UpsertOne {
        insert: block.clone(),
        update: update(move |stored: &mut Block| {
            let next = stored.next_block_hash;
            *stored = fields.clone();
            stored.next_block_hash = next;
        }),
    }];
    if let Some(previous) = block.previous_block_hash {
        ops.push(link_next(previous, hash));
    }
    ledger.blocks.bulk_write(ops).await?;
    Ok(())
}

fn link_next(previous: BlockHash, next: BlockHash) -> WriteOp<Block> {
    WriteOp::UpdateOne {
        key: previous,
        update: update(move |block: &mut Block| block.next_block_hash = Some(next)),
    }
}
