//! Field access and index declarations for the ledger documents.

use bitcoin::{BlockHash, Txid};

use crate::types::{Block, Coin, Transaction, Wallet, WalletAddress, WalletId};

use super::collection::{Document, IndexSpec};
use super::query::IndexValue;

fn one(value: impl Into<IndexValue>) -> Vec<IndexValue> {
    match value.into() {
        IndexValue::Null => Vec::new(),
        value => vec![value],
    }
}

fn many<T: Clone + Into<IndexValue>>(values: &[T]) -> Vec<IndexValue> {
    values.iter().cloned().map(Into::into).collect()
}

impl Document for Block {
    type Key = BlockHash;
    const NAME: &'static str = "blocks";

    fn key(&self) -> BlockHash {
        self.hash
    }

    fn field(&self, name: &str) -> Vec<IndexValue> {
        match name {
            "chain" => one(&self.chain),
            "network" => one(&self.network),
            "hash" => one(self.hash),
            "height" => one(self.height),
            "previousBlockHash" => one(self.previous_block_hash),
            "nextBlockHash" => one(self.next_block_hash),
            "time" => one(self.time),
            "timeNormalized" => one(self.time_normalized),
            "processed" => one(self.processed),
            "transactionCount" => one(self.transaction_count),
            _ => Vec::new(),
        }
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::on(&["hash"]).unique(),
            IndexSpec::on(&["height"]).unique(),
            IndexSpec::on(&["processed", "height"]),
            IndexSpec::on(&["timeNormalized"]),
            IndexSpec::on(&["previousBlockHash"]),
        ]
    }
}

impl Document for Transaction {
    type Key = Txid;
    const NAME: &'static str = "transactions";

    fn key(&self) -> Txid {
        self.txid
    }

    fn field(&self, name: &str) -> Vec<IndexValue> {
        match name {
            "txid" => one(self.txid),
            "blockHeight" => one(self.block_height),
            "blockHash" => one(self.block_hash),
            "blockTime" => one(self.block_time),
            "blockTimeNormalized" => one(self.block_time_normalized),
            "coinbase" => one(self.coinbase),
            "address" => one(self.address.as_ref()),
            "addresses" => many(&self.addresses),
            "wallets" => many(&self.wallets),
            _ => Vec::new(),
        }
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::on(&["txid"]).unique(),
            IndexSpec::on(&["blockHeight"]),
            IndexSpec::on(&["blockHash"]),
            IndexSpec::on(&["blockTimeNormalized"]),
            IndexSpec::on(&["wallets", "blockTimeNormalized"]),
            IndexSpec::on(&["wallets", "blockHeight"]),
            IndexSpec::on(&["addresses"]),
        ]
    }
}

impl Document for Coin {
    type Key = (Txid, u32);
    const NAME: &'static str = "coins";

    fn key(&self) -> (Txid, u32) {
        (self.mint_txid, self.mint_index)
    }

    fn field(&self, name: &str) -> Vec<IndexValue> {
        match name {
            "mintTxid" => one(self.mint_txid),
            "mintIndex" => one(self.mint_index),
            "mintHeight" => one(self.mint_height),
            "coinbase" => one(self.coinbase),
            "value" => one(self.value),
            "address" => one(self.address.as_ref()),
            "addresses" => many(&self.addresses),
            "spentTxid" => one(self.spent_txid),
            "spentHeight" => one(self.spent_height),
            "wallets" => many(&self.wallets),
            _ => Vec::new(),
        }
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::on(&["mintTxid", "mintIndex"]).unique(),
            IndexSpec::on(&["mintHeight"]),
            IndexSpec::on(&["spentTxid"]),
            IndexSpec::on(&["spentHeight"]),
            IndexSpec::on(&["wallets"]),
            IndexSpec::on(&["wallets", "spentHeight"]),
            IndexSpec::on(&["wallets", "spentTxid"]),
            IndexSpec::on(&["wallets", "mintTxid"]),
            IndexSpec::on(&["address"]),
            IndexSpec::on(&["addresses"]),
        ]
    }
}

impl Document for Wallet {
    type Key = String;
    const NAME: &'static str = "wallets";

    fn key(&self) -> String {
        self.pub_key.clone()
    }

    fn field(&self, name: &str) -> Vec<IndexValue> {
        match name {
            "id" => one(self.id),
            "pubKey" => one(&self.pub_key),
            "name" => one(&self.name),
            "path" => one(self.path.as_ref()),
            "singleAddress" => one(self.single_address),
            _ => Vec::new(),
        }
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::on(&["pubKey"]).unique(),
            IndexSpec::on(&["id"]).unique(),
        ]
    }

    fn sequence(&self) -> Option<u64> {
        Some(self.id.0)
    }
}

impl Document for WalletAddress {
    type Key = (WalletId, String);
    const NAME: &'static str = "walletaddresses";

    fn key(&self) -> (WalletId, String) {
        (self.wallet, self.address.clone())
    }

    fn field(&self, name: &str) -> Vec<IndexValue> {
        match name {
            "wallet" => one(self.wallet),
            "address" => one(&self.address),
            "processed" => one(self.processed),
            _ => Vec::new(),
        }
    }

    fn indexes() -> Vec<IndexSpec> {
        vec![
            IndexSpec::on(&["wallet", "address"]).unique(),
            IndexSpec::on(&["address", "wallet"]).unique(),
        ]
    }
}
