use bitcoin::{Amount, BlockHash, OutPoint, TxMerkleNode, Txid};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::{BlockHeight, BlockTransactions, NodeBlock, NodeInput, NodeOutput, NodeTransaction};

use super::Verbosity;

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::InvalidData(message.into())
}

pub(super) fn parse_txid(value: Option<&Value>, field: &str) -> Result<Txid, CoreError> {
    let value = value
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("missing {field}")))?;
    value
        .parse()
        .map_err(|e| invalid(format!("invalid {field}: {e}")))
}

pub(super) fn parse_block_hash(value: Option<&Value>, field: &str) -> Result<BlockHash, CoreError> {
    parse_opt_block_hash(value, field)?.ok_or_else(|| invalid(format!("missing {field}")))
}

pub(super) fn parse_opt_block_hash(
    value: Option<&Value>,
    field: &str,
) -> Result<Option<BlockHash>, CoreError> {
    match value.and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("invalid {field}: {e}"))),
    }
}

pub(super) fn parse_integer_required<T, const SIGNED: bool>(
    value: Option<&Value>,
    field: &str,
) -> Result<T, CoreError>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    parse_integer::<T, SIGNED, true>(value, field)?.ok_or_else(|| invalid(format!("missing {field}")))
}

pub(super) fn parse_integer_optional<T, const SIGNED: bool>(value: Option<&Value>) -> Option<T>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    parse_integer::<T, SIGNED, false>(value, "value")
        .ok()
        .flatten()
}

// Generic integer parser used by all concrete numeric helpers.
// `required=false` treats missing/null/type-mismatch as `Ok(None)`.
fn parse_integer<T, const SIGNED: bool, const REQUIRED: bool>(
    value: Option<&Value>,
    field: &str,
) -> Result<Option<T>, CoreError>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    let missing_or_none = || {
        if REQUIRED {
            Err(invalid(format!("missing {field}")))
        } else {
            Ok(None)
        }
    };

    let Some(value) = value else {
        return missing_or_none();
    };

    if SIGNED {
        let Some(n) = value.as_i64() else {
            return missing_or_none();
        };
        T::try_from(n)
            .map(Some)
            .map_err(|_| invalid(format!("{field} out of range: {n}")))
    } else {
        let Some(n) = value.as_u64() else {
            return missing_or_none();
        };
        T::try_from(n)
            .map(Some)
            .map_err(|_| invalid(format!("{field} out of range: {n}")))
    }
}

/// `bits` is a compact-target hex string in bitcoind; some forks send a number.
fn parse_bits(value: Option<&Value>) -> Result<u32, CoreError> {
    match value {
        Some(Value::String(s)) => {
            u32::from_str_radix(s, 16).map_err(|e| invalid(format!("invalid bits `{s}`: {e}")))
        }
        other => parse_integer_required::<u32, false>(other, "bits"),
    }
}

/// Parse a BTC amount from a JSON value.
///
/// Number values are parsed via `Amount::from_float_in` to support scientific
/// notation, while string values are parsed via `Amount::from_str_in`.
pub(super) fn parse_btc_amount(value: &Value) -> Result<Amount, CoreError> {
    match value {
        Value::Number(n) => {
            let parsed = n
                .as_f64()
                .ok_or_else(|| invalid(format!("invalid BTC amount `{value}`")))?;
            Amount::from_float_in(parsed, bitcoin::Denomination::Bitcoin)
                .map_err(|e| invalid(format!("invalid BTC amount `{value}`: {e}")))
        }
        Value::String(s) => Amount::from_str_in(s, bitcoin::Denomination::Bitcoin)
            .map_err(|e| invalid(format!("invalid BTC amount `{s}`: {e}"))),
        _ => Err(invalid(format!("expected numeric BTC amount, got: {value}"))),
    }
}

// ==============================================================================
// Transactions
// ==============================================================================

pub(super) fn parse_vin(vin: &[Value]) -> Result<Vec<NodeInput>, CoreError> {
    vin.iter()
        .map(|input| {
            let sequence = parse_integer_required::<u32, false>(input.get("sequence"), "sequence")?;
            if let Some(coinbase) = input.get("coinbase") {
                return Ok(NodeInput::Coinbase {
                    coinbase: coinbase.as_str().unwrap_or_default().to_owned(),
                    sequence,
                });
            }
            let prev_txid = parse_txid(input.get("txid"), "vin.txid")?;
            let prev_vout = parse_integer_required::<u32, false>(input.get("vout"), "vin.vout")?;
            Ok(NodeInput::Spend {
                prevout: OutPoint::new(prev_txid, prev_vout),
                sequence,
            })
        })
        .collect()
}

pub(super) fn parse_vout(vout: &[Value]) -> Result<Vec<NodeOutput>, CoreError> {
    vout.iter()
        .enumerate()
        .map(|(position, output)| {
            let value = parse_btc_amount(
                output
                    .get("value")
                    .ok_or_else(|| invalid("missing value in vout"))?,
            )?;
            let n = parse_integer_optional::<u32, false>(output.get("n"))
                .unwrap_or(position as u32);

            let spk = output
                .get("scriptPubKey")
                .ok_or_else(|| invalid("missing scriptPubKey in vout"))?;
            let script = spk
                .get("hex")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("missing hex in scriptPubKey"))?
                .to_owned();
            let script_type = spk.get("type").and_then(Value::as_str).map(str::to_owned);

            // bitcoind >= 22 reports a single `address`; older nodes and
            // forks report an `addresses` array.
            let addresses = match (spk.get("address"), spk.get("addresses")) {
                (Some(Value::String(address)), _) => vec![address.clone()],
                (_, Some(Value::Array(list))) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect(),
                _ => Vec::new(),
            };

            Ok(NodeOutput {
                value,
                n,
                script,
                script_type,
                addresses,
            })
        })
        .collect()
}

pub(super) fn parse_transaction(raw: &Value) -> Result<NodeTransaction, CoreError> {
    let txid = parse_txid(raw.get("txid"), "txid")?;
    let size = parse_integer_required::<u64, false>(raw.get("size"), "size")?;
    let locktime = parse_integer_required::<u32, false>(raw.get("locktime"), "locktime")?;
    let block_hash = parse_opt_block_hash(raw.get("blockhash"), "blockhash")?;
    let block_time = parse_integer_optional::<i64, true>(raw.get("blocktime"));
    let confirmations = parse_integer_optional::<i64, true>(raw.get("confirmations"));

    let vin = raw
        .get("vin")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("transaction {txid}: missing vin array")))?;
    let vout = raw
        .get("vout")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("transaction {txid}: missing vout array")))?;

    Ok(NodeTransaction {
        txid,
        size,
        locktime,
        inputs: parse_vin(vin)?,
        outputs: parse_vout(vout)?,
        block_hash,
        block_time,
        confirmations,
    })
}

// ==============================================================================
// Blocks
// ==============================================================================

pub(super) fn parse_block(raw: &Value, verbosity: Verbosity) -> Result<NodeBlock, CoreError> {
    let hash = parse_block_hash(raw.get("hash"), "hash")?;
    let height = BlockHeight(parse_integer_required::<u32, false>(raw.get("height"), "height")?);
    let merkle_root: TxMerkleNode = raw
        .get("merkleroot")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing merkleroot"))?
        .parse()
        .map_err(|e| invalid(format!("invalid merkleroot: {e}")))?;

    let entries = raw
        .get("tx")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("block {hash}: missing tx array")))?;
    let transactions = match verbosity {
        Verbosity::Header => BlockTransactions::Ids(
            entries
                .iter()
                .map(|entry| match entry {
                    Value::Object(_) => parse_txid(entry.get("txid"), "tx.txid"),
                    other => parse_txid(Some(other), "tx"),
                })
                .collect::<Result<_, _>>()?,
        ),
        Verbosity::Full => BlockTransactions::Full(
            entries
                .iter()
                .map(parse_transaction)
                .collect::<Result<_, _>>()?,
        ),
    };
    let transaction_count = parse_integer_optional::<u64, false>(raw.get("nTx"))
        .unwrap_or(transactions.len() as u64);

    Ok(NodeBlock {
        hash,
        height,
        version: parse_integer_required::<i64, true>(raw.get("version"), "version")?,
        merkle_root,
        time: parse_integer_required::<i64, true>(raw.get("time"), "time")?,
        nonce: parse_integer_required::<u64, false>(raw.get("nonce"), "nonce")?,
        bits: parse_bits(raw.get("bits"))?,
        size: parse_integer_required::<u64, false>(raw.get("size"), "size")?,
        previous_block_hash: parse_opt_block_hash(raw.get("previousblockhash"), "previousblockhash")?,
        next_block_hash: parse_opt_block_hash(raw.get("nextblockhash"), "nextblockhash")?,
        confirmations: parse_integer_optional::<i64, true>(raw.get("confirmations")),
        transaction_count,
        transactions,
    })
}
