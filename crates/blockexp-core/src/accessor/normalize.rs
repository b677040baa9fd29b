//! Per-chain rewriting of daemon payloads into the common node shape.
//!
//! The accessor's control flow is shared by every chain; a
//! [`PayloadNormalizer`] only patches raw JSON before parsing and fills
//! output addresses after it.

use bitcoin::{Address, Network, ScriptBuf};
use serde_json::{json, Map, Value};
use tracing::trace;

use crate::types::NodeOutput;

pub trait PayloadNormalizer: Send + Sync {
    /// Rewrite a raw `getblock` object in place before it is parsed.
    fn fix_block(&self, raw: &mut Value) {
        if let Value::Object(block) = raw {
            backfill_block(block);
        }
    }

    /// Rewrite a raw transaction object in place before it is parsed.
    fn fix_transaction(&self, raw: &mut Value) {
        if let Value::Object(tx) = raw {
            backfill_transaction(tx);
        }
    }

    /// Fill the addresses of an output the node left without any.
    fn derive_addresses(&self, _output: &mut NodeOutput) {}
}

/// Defaults for fields pre-segwit daemons do not report.
fn backfill_block(block: &mut Map<String, Value>) {
    let size = block.get("size").cloned().unwrap_or(Value::Null);
    let tx_count = block
        .get("tx")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_default();
    block.entry("strippedsize").or_insert(size);
    block.entry("weight").or_insert(json!(-1));
    block.entry("versionHex").or_insert(json!(""));
    block.entry("nTx").or_insert(json!(tx_count));
}

fn backfill_transaction(tx: &mut Map<String, Value>) {
    let txid = tx.get("txid").cloned().unwrap_or(Value::Null);
    let size = tx.get("size").cloned().unwrap_or(Value::Null);
    tx.entry("hash").or_insert(txid);
    tx.entry("vsize").or_insert(size);
    tx.entry("weight").or_insert(json!(-1));
}

// ==============================================================================
// Bitcoin
// ==============================================================================

/// Bitcoin Core and daemons that share its script and address encoding.
#[derive(Debug, Clone, Copy)]
pub struct BitcoinNormalizer {
    network: Network,
}

impl BitcoinNormalizer {
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

impl PayloadNormalizer for BitcoinNormalizer {
    fn derive_addresses(&self, output: &mut NodeOutput) {
        if !output.addresses.is_empty() {
            return;
        }
        let Ok(script) = ScriptBuf::from_hex(&output.script) else {
            trace!(script = %output.script, "unparseable scriptPubKey; no address derived");
            return;
        };
        if let Ok(address) = Address::from_script(&script, self.network) {
            output.addresses.push(address.to_string());
        }
    }
}

// ==============================================================================
// PIVX-derived forks
// ==============================================================================

/// Forks (PCH, ABLE) whose `getblock` carries zerocoin and staking fields
/// and omits the segwit-era size fields.
///
/// Their address prefixes differ from Bitcoin's, so addresses are taken
/// from the node and never derived locally.
#[derive(Debug, Clone)]
pub struct LegacyForkNormalizer {
    stripped: Vec<&'static str>,
}

impl LegacyForkNormalizer {
    /// Fields dropped from every block of the given fork.
    pub fn new(supply_field: &'static str) -> Self {
        Self {
            stripped: vec![
                "moneysupply",
                "acc_checkpoint",
                "modifier",
                "modifierV2",
                supply_field,
            ],
        }
    }

    pub fn pch() -> Self {
        Self::new("zPCHsupply")
    }

    pub fn able() -> Self {
        Self::new("zABLEsupply")
    }
}

impl PayloadNormalizer for LegacyForkNormalizer {
    fn fix_block(&self, raw: &mut Value) {
        let Value::Object(block) = raw else {
            return;
        };
        for field in &self.stripped {
            block.remove(*field);
        }
        backfill_block(block);
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Amount;

    use super::*;

    fn output(script: &str, addresses: Vec<String>) -> NodeOutput {
        NodeOutput {
            value: Amount::from_sat(1),
            n: 0,
            script: script.into(),
            script_type: None,
            addresses,
        }
    }

    #[test]
    fn fork_block_is_stripped_and_backfilled() {
        let mut raw = json!({
            "hash": "00",
            "size": 512,
            "tx": ["aa", "bb"],
            "moneysupply": 1000.0,
            "acc_checkpoint": "ff",
            "modifier": "01",
            "zPCHsupply": { "1": 0 }
        });
        LegacyForkNormalizer::pch().fix_block(&mut raw);

        for gone in ["moneysupply", "acc_checkpoint", "modifier", "zPCHsupply"] {
            assert!(raw.get(gone).is_none(), "{gone} must be stripped");
        }
        assert_eq!(raw["strippedsize"], json!(512));
        assert_eq!(raw["weight"], json!(-1));
        assert_eq!(raw["nTx"], json!(2));
        assert_eq!(raw["versionHex"], json!(""));
    }

    #[test]
    fn able_strips_its_own_supply_and_modifier_v2() {
        let mut raw = json!({ "size": 1, "tx": [], "zABLEsupply": 5, "modifierV2": "ab" });
        LegacyForkNormalizer::able().fix_block(&mut raw);
        assert!(raw.get("zABLEsupply").is_none());
        assert!(raw.get("modifierV2").is_none());
        assert_eq!(raw["nTx"], json!(0));
    }

    #[test]
    fn backfill_keeps_reported_values() {
        let mut raw = json!({ "size": 300, "strippedsize": 200, "weight": 800, "nTx": 9, "tx": [] });
        BitcoinNormalizer::new(Network::Regtest).fix_block(&mut raw);
        assert_eq!(raw["strippedsize"], json!(200));
        assert_eq!(raw["weight"], json!(800));
        assert_eq!(raw["nTx"], json!(9));
    }

    #[test]
    fn transaction_backfill_uses_txid_and_size() {
        let mut raw = json!({ "txid": "ab", "size": 191 });
        LegacyForkNormalizer::pch().fix_transaction(&mut raw);
        assert_eq!(raw["hash"], json!("ab"));
        assert_eq!(raw["vsize"], json!(191));
        assert_eq!(raw["weight"], json!(-1));
    }

    #[test]
    fn bitcoin_derives_missing_p2wpkh_address() {
        let normalizer = BitcoinNormalizer::new(Network::Bitcoin);
        let mut out = output("0014751e76e8199196d454941c45d1b3a323f1433bd6", Vec::new());
        normalizer.derive_addresses(&mut out);
        assert_eq!(
            out.addresses,
            vec!["bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_owned()]
        );
    }

    #[test]
    fn bitcoin_keeps_node_addresses_and_skips_nulldata() {
        let normalizer = BitcoinNormalizer::new(Network::Bitcoin);
        let mut reported = output("0014751e76e8199196d454941c45d1b3a323f1433bd6", vec!["x".into()]);
        normalizer.derive_addresses(&mut reported);
        assert_eq!(reported.addresses, vec!["x".to_owned()]);

        let mut op_return = output("6a0474657374", Vec::new());
        normalizer.derive_addresses(&mut op_return);
        assert!(op_return.addresses.is_empty());
    }

    #[test]
    fn fork_never_derives_addresses() {
        let mut out = output("0014751e76e8199196d454941c45d1b3a323f1433bd6", Vec::new());
        LegacyForkNormalizer::pch().derive_addresses(&mut out);
        assert!(out.addresses.is_empty());
    }
}
