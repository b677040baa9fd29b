//! Linking addresses to wallets and tagging their coins and transactions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bitcoin::Txid;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::store::{update, Filter, Ledger, StreamingFindOptions, Update, WriteOp};
use crate::types::{BlockHeight, Coin, Transaction, Wallet, WalletAddress, WalletId};

/// Sole writer of `wallets` tags and wallet address rows.
#[derive(Clone)]
pub struct WalletLinker {
    ledger: Arc<Ledger>,
}

fn add_wallet<D: 'static>(wallet: WalletId, wallets: fn(&mut D) -> &mut Vec<WalletId>) -> Update<D> {
    update(move |doc: &mut D| {
        let tags = wallets(doc);
        if !tags.contains(&wallet) {
            tags.push(wallet);
        }
    })
}

fn coin_wallets(coin: &mut Coin) -> &mut Vec<WalletId> {
    &mut coin.wallets
}

fn transaction_wallets(tx: &mut Transaction) -> &mut Vec<WalletId> {
    &mut tx.wallets
}

impl WalletLinker {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Link `addresses` to `wallet` and tag their history.
    ///
    /// Addresses already linked and processed are skipped. Steps are not
    /// atomic: an interrupted run leaves rows with `processed = false`, and
    /// running again completes them. Returns the number of addresses
    /// processed by this call.
    pub async fn update_wallet(&self, wallet: &Wallet, addresses: &[String]) -> Result<usize, CoreError> {
        let requested: BTreeSet<&String> = addresses.iter().collect();
        let done: BTreeSet<String> = self
            .ledger
            .wallet_addresses
            .fetch_many(
                &Filter::all()
                    .eq("wallet", wallet.id)
                    .any_of("address", requested.iter().copied())
                    .eq("processed", true),
                &StreamingFindOptions::new(),
            )
            .await?
            .into_iter()
            .map(|row| row.address)
            .collect();
        let pending: Vec<String> = requested
            .into_iter()
            .filter(|address| !done.contains(*address))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let rows = pending
            .iter()
            .map(|address| WriteOp::UpsertOne {
                insert: WalletAddress {
                    chain: self.ledger.chain().to_owned(),
                    network: self.ledger.network().to_owned(),
                    wallet: wallet.id,
                    address: address.clone(),
                    processed: false,
                },
                update: update(|_: &mut WalletAddress| {}),
            })
            .collect();
        self.ledger.wallet_addresses.bulk_write(rows).await?;

        let by_address = Filter::all().any_of("address", pending.iter());
        self.ledger
            .coins
            .update_many(by_address.clone(), add_wallet(wallet.id, coin_wallets))
            .await?;

        let mut txids = BTreeSet::new();
        for coin in self
            .ledger
            .coins
            .fetch_many(&by_address, &StreamingFindOptions::new())
            .await?
        {
            txids.insert(coin.mint_txid);
            txids.extend(coin.spent_txid);
        }
        self.tag_transactions(wallet.id, txids).await?;

        let processed = pending
            .iter()
            .map(|address| WriteOp::UpdateOne {
                key: (wallet.id, address.clone()),
                update: update(|row: &mut WalletAddress| row.processed = true),
            })
            .collect();
        self.ledger.wallet_addresses.bulk_write(processed).await?;

        info!(wallet = %wallet.id, addresses = pending.len(), "wallet addresses linked");
        Ok(pending.len())
    }

    /// Tag coins minted or spent at `height`, and their transactions, with
    /// the wallets their address is linked to.
    pub async fn tag_height(&self, height: BlockHeight) -> Result<(), CoreError> {
        if self.ledger.wallet_addresses.is_empty().await {
            return Ok(());
        }

        let options = StreamingFindOptions::new();
        let mut coins = self
            .ledger
            .coins
            .fetch_many(&Filter::all().eq("mintHeight", height), &options)
            .await?;
        coins.extend(
            self.ledger
                .coins
                .fetch_many(&Filter::all().eq("spentHeight", height), &options)
                .await?,
        );

        let addresses: BTreeSet<&String> = coins.iter().filter_map(|c| c.address.as_ref()).collect();
        if addresses.is_empty() {
            return Ok(());
        }
        let mut linked: HashMap<String, Vec<WalletId>> = HashMap::new();
        for row in self
            .ledger
            .wallet_addresses
            .fetch_many(&Filter::all().any_of("address", addresses), &options)
            .await?
        {
            linked.entry(row.address).or_default().push(row.wallet);
        }
        if linked.is_empty() {
            return Ok(());
        }

        let mut coin_ops = Vec::new();
        let mut tx_tags: HashMap<WalletId, BTreeSet<Txid>> = HashMap::new();
        for coin in &coins {
            let Some(wallets) = coin.address.as_ref().and_then(|a| linked.get(a)) else {
                continue;
            };
            for wallet in wallets {
                coin_ops.push(WriteOp::UpdateOne {
                    key: (coin.mint_txid, coin.mint_index),
                    update: add_wallet(*wallet, coin_wallets),
                });
                let txids = tx_tags.entry(*wallet).or_default();
                if coin.mint_height == height.as_i64() {
                    txids.insert(coin.mint_txid);
                }
                if coin.spent_height == height.as_i64() {
                    txids.extend(coin.spent_txid);
                }
            }
        }
        debug!(%height, coins = coin_ops.len(), "tagging wallet coins");
        self.ledger.coins.bulk_write(coin_ops).await?;
        for (wallet, txids) in tx_tags {
            self.tag_transactions(wallet, txids).await?;
        }
        Ok(())
    }

    async fn tag_transactions(&self, wallet: WalletId, txids: BTreeSet<Txid>) -> Result<(), CoreError> {
        if txids.is_empty() {
            return Ok(());
        }
        let ops = txids
            .into_iter()
            .map(|txid| WriteOp::UpdateOne {
                key: txid,
                update: add_wallet(wallet, transaction_wallets),
            })
            .collect();
        self.ledger.transactions.bulk_write(ops).await?;
        Ok(())
    }
}
