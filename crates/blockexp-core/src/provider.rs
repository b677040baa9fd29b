//! Read-side projections over one ledger.
//!
//! Every projection that reports `confirmations` computes it against the
//! stored tip at the time of the call. Missing documents become typed
//! [`NotFound`] errors; nothing here retries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bitcoin::{BlockHash, Txid};
use futures::stream::StreamExt;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};

use crate::accessor::Accessor;
use crate::error::{CoreError, NotFound};
use crate::store::{
    update, Connection, Database, Direction, DocumentStream, Filter, Ledger, StreamingFindOptions,
};
use crate::types::{
    Balance, Block, BlockHeight, BlockId, Coin, CoinListing, DailyTransactionCount,
    DailyTransactions, EstimateFee, Transaction, TransactionId, Wallet, WalletAddress,
    WalletCheckResult, WalletId, UNSPENT_HEIGHT,
};
use crate::wallet::WalletLinker;

/// `Number.MAX_SAFE_INTEGER`, the modulus of [`WalletCheckResult::sum`].
const WALLET_CHECK_MODULUS: u64 = 9_007_199_254_740_991;

/// Filters of [`Provider::stream_blocks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockQuery {
    /// A hash selects that block; a height selects blocks above it.
    pub since_block: Option<BlockId>,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    /// One UTC calendar day.
    pub date: Option<Date>,
}

/// Filters of [`Provider::stream_wallet_transactions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletTransactionQuery {
    pub start_block: Option<BlockHeight>,
    pub end_block: Option<BlockHeight>,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
}

/// Query surface of one `(chain, network)`.
#[derive(Clone)]
pub struct Provider {
    accessor: Arc<Accessor>,
    database: Database,
}

fn utc_midnight(date: Date) -> OffsetDateTime {
    date.with_time(Time::MIDNIGHT).assume_utc()
}

fn with_confirmations<D: Send + 'static>(
    stream: DocumentStream<D>,
    tip: Option<BlockHeight>,
    apply: fn(D, BlockHeight) -> D,
) -> DocumentStream<D> {
    match tip {
        Some(tip) => stream.map(move |doc| apply(doc, tip)).boxed(),
        None => stream,
    }
}

impl Provider {
    pub fn new(accessor: Arc<Accessor>, database: Database) -> Self {
        Self { accessor, database }
    }

    pub fn chain(&self) -> &str {
        self.accessor.chain()
    }

    pub fn network(&self) -> &str {
        self.accessor.network()
    }

    /// A pooled connection and this provider's ledger. The connection must
    /// outlive every use of the ledger in the calling operation.
    async fn open(&self) -> Result<(Connection, Arc<Ledger>), CoreError> {
        let connection = self.database.connect().await?;
        let ledger = connection.ledger(self.chain(), self.network()).await?;
        Ok((connection, ledger))
    }

    async fn tip_height(ledger: &Ledger) -> Result<Option<BlockHeight>, CoreError> {
        Ok(ledger.tip().await?.map(|block| block.height))
    }

    // ==========================================================================
    // Blocks
    // ==========================================================================

    /// Highest stored block.
    pub async fn get_local_tip(&self) -> Result<Block, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let tip = ledger
            .tip()
            .await?
            .ok_or_else(|| NotFound::Block("tip".into()))?;
        let height = tip.height;
        Ok(tip.with_confirmations(height))
    }

    pub async fn get_block(&self, id: impl Into<BlockId>) -> Result<Block, CoreError> {
        let id = id.into();
        let (_conn, ledger) = self.open().await?;
        let filter = match id {
            BlockId::Height(height) => Filter::all().eq("height", height),
            BlockId::Hash(hash) => Filter::all().eq("hash", hash),
        };
        let block = ledger
            .blocks
            .fetch_one(&filter)
            .await?
            .ok_or_else(|| NotFound::Block(id.to_string()))?;
        Ok(match Self::tip_height(&ledger).await? {
            Some(tip) => block.with_confirmations(tip),
            None => block,
        })
    }

    /// Blocks matching `query`, highest first. Paging on `height` always
    /// continues downwards from `since`.
    pub async fn stream_blocks(
        &self,
        query: &BlockQuery,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Block>, CoreError> {
        let mut filter = Filter::all();
        match query.since_block {
            Some(BlockId::Hash(hash)) => filter = filter.eq("hash", hash),
            Some(BlockId::Height(height)) => filter = filter.gt("height", height),
            None => {}
        }
        if let Some(start) = query.start_date {
            filter = filter.gt("time", start);
        }
        if let Some(end) = query.end_date {
            filter = filter.lt("time", end);
        }
        if let Some(date) = query.date {
            let start = utc_midnight(date);
            filter = filter.gt("time", start).lt("time", start + Duration::days(1));
        }

        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let options = match options.paging_field() {
            Some("height") => options.clone().direction(Direction::Descending),
            _ => options.clone(),
        }
        .with_sort("height", Direction::Descending);
        let stream = ledger.blocks.streaming(&filter, &options).await?;
        Ok(with_confirmations(stream, tip, Block::with_confirmations))
    }

    /// Blocks per UTC day of their normalized time, oldest day first.
    pub async fn get_daily_transactions(&self) -> Result<DailyTransactions, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let mut days: BTreeMap<Date, u64> = BTreeMap::new();
        for block in ledger.blocks.fetch_all().await? {
            let day = block.time_normalized.to_offset(UtcOffset::UTC).date();
            *days.entry(day).or_default() += block.transaction_count;
        }
        Ok(DailyTransactions {
            chain: self.chain().to_owned(),
            network: self.network().to_owned(),
            results: days
                .into_iter()
                .map(|(date, transaction_count)| DailyTransactionCount {
                    date: date.to_string(),
                    transaction_count,
                })
                .collect(),
        })
    }

    // ==========================================================================
    // Transactions and coins
    // ==========================================================================

    pub async fn stream_transactions(
        &self,
        block_height: Option<BlockHeight>,
        block_hash: Option<BlockHash>,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Transaction>, CoreError> {
        let mut filter = Filter::all();
        if let Some(height) = block_height {
            filter = filter.eq("blockHeight", height);
        }
        if let Some(hash) = block_hash {
            filter = filter.eq("blockHash", hash);
        }
        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let stream = ledger.transactions.streaming(&filter, options).await?;
        Ok(with_confirmations(stream, tip, Transaction::with_confirmations))
    }

    pub async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let tx = ledger
            .transactions
            .get(txid)
            .await?
            .ok_or_else(|| NotFound::Transaction(txid.to_string()))?;
        Ok(match Self::tip_height(&ledger).await? {
            Some(tip) => tx.with_confirmations(tip),
            None => tx,
        })
    }

    /// Coins spent by `txid` and coins it minted.
    pub async fn get_coins_for_tx(&self, txid: &Txid) -> Result<CoinListing, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let options = StreamingFindOptions::new();
        let project = |coins: Vec<Coin>| -> Vec<Coin> {
            coins
                .into_iter()
                .map(|coin| match tip {
                    Some(tip) => coin.with_confirmations(tip),
                    None => coin,
                })
                .collect()
        };
        let inputs = ledger
            .coins
            .fetch_many(&Filter::all().eq("spentTxid", *txid), &options)
            .await?;
        let outputs = ledger
            .coins
            .fetch_many(
                &Filter::all().eq("mintTxid", *txid),
                &options.with_sort("mintIndex", Direction::Ascending),
            )
            .await?;
        Ok(CoinListing {
            inputs: project(inputs),
            outputs: project(outputs),
        })
    }

    // ==========================================================================
    // Addresses
    // ==========================================================================

    pub async fn stream_address_transactions(
        &self,
        address: &str,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Transaction>, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let stream = ledger
            .transactions
            .streaming(&Filter::all().eq("addresses", address), options)
            .await?;
        Ok(with_confirmations(stream, tip, Transaction::with_confirmations))
    }

    /// Coins paying `address`; `unspent` restricts to unspent (`true`) or
    /// spent (`false`) coins.
    pub async fn stream_address_utxos(
        &self,
        address: &str,
        unspent: Option<bool>,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Coin>, CoreError> {
        let mut filter = Filter::all().eq("addresses", address);
        match unspent {
            Some(true) => filter = filter.lt("spentHeight", 0i64),
            Some(false) => filter = filter.gte("spentHeight", 0i64),
            None => {}
        }
        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let stream = ledger.coins.streaming(&filter, options).await?;
        Ok(with_confirmations(stream, tip, Coin::with_confirmations))
    }

    pub async fn get_balance_for_address(&self, address: &str) -> Result<Balance, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let coins = ledger
            .coins
            .fetch_many(
                &Filter::all()
                    .eq("address", address)
                    .lt("spentHeight", 0i64)
                    .gt("mintHeight", -3i64),
                &StreamingFindOptions::new(),
            )
            .await?;
        Ok(Balance::from_coins(&coins))
    }

    // ==========================================================================
    // Wallets
    // ==========================================================================

    /// Register a wallet, or update name, path and flag of the wallet with
    /// the same `pub_key`.
    pub async fn create_wallet(
        &self,
        name: &str,
        pub_key: &str,
        path: Option<&str>,
        single_address: Option<bool>,
    ) -> Result<Wallet, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let key = pub_key.to_owned();
        let id = match ledger.wallets.get(&key).await? {
            Some(existing) => existing.id,
            None => WalletId(ledger.wallets.next_sequence()),
        };
        let wallet = Wallet {
            id,
            chain: self.chain().to_owned(),
            network: self.network().to_owned(),
            name: name.to_owned(),
            pub_key: pub_key.to_owned(),
            path: path.map(str::to_owned),
            single_address,
        };
        let fields = wallet.clone();
        ledger
            .wallets
            .upsert_one(
                wallet,
                update(move |stored: &mut Wallet| {
                    stored.name.clone_from(&fields.name);
                    stored.path.clone_from(&fields.path);
                    stored.single_address = fields.single_address;
                }),
            )
            .await?;
        ledger
            .wallets
            .get(&key)
            .await?
            .ok_or_else(|| NotFound::Wallet(key).into())
    }

    pub async fn get_wallet(&self, pub_key: &str) -> Result<Wallet, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let key = pub_key.to_owned();
        ledger
            .wallets
            .get(&key)
            .await?
            .ok_or_else(|| NotFound::Wallet(key).into())
    }

    /// Cheap fingerprint of a wallet's address set: the last linked address
    /// and the sum of every address's ASCII bytes.
    pub async fn wallet_check(&self, wallet: &Wallet) -> Result<WalletCheckResult, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let rows = ledger
            .wallet_addresses
            .fetch_many(&Filter::all().eq("wallet", wallet.id), &StreamingFindOptions::new())
            .await?;
        let sum = rows.iter().fold(0u64, |acc, row| {
            let bytes: u64 = row.address.bytes().map(u64::from).sum();
            (acc + bytes) % WALLET_CHECK_MODULUS
        });
        Ok(WalletCheckResult {
            last_address: rows.last().map(|row| row.address.clone()),
            sum,
        })
    }

    /// Addresses linked to `wallet`; `limit` zero is unbounded.
    pub async fn stream_wallet_addresses(
        &self,
        wallet: &Wallet,
        limit: usize,
    ) -> Result<DocumentStream<WalletAddress>, CoreError> {
        let (_conn, ledger) = self.open().await?;
        ledger
            .wallet_addresses
            .streaming(
                &Filter::all().eq("wallet", wallet.id),
                &StreamingFindOptions::new().limit(limit),
            )
            .await
    }

    /// Addresses that co-spend with the wallet's coins but are not linked
    /// to it, sorted.
    pub async fn stream_missing_wallet_addresses(
        &self,
        wallet: &Wallet,
    ) -> Result<DocumentStream<String>, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let options = StreamingFindOptions::new();
        let spent = ledger
            .coins
            .fetch_many(
                &Filter::all().eq("wallets", wallet.id).gte("spentHeight", 0i64),
                &options,
            )
            .await?;
        let spending: BTreeSet<Txid> = spent.iter().filter_map(|coin| coin.spent_txid).collect();
        if spending.is_empty() {
            return Ok(futures::stream::empty().boxed());
        }

        let mut missing = BTreeSet::new();
        for coin in ledger
            .coins
            .fetch_many(&Filter::all().any_of("spentTxid", spending), &options)
            .await?
        {
            if !coin.wallets.contains(&wallet.id) {
                missing.extend(coin.addresses);
            }
        }
        Ok(futures::stream::iter(missing).boxed())
    }

    /// Link `addresses` to `wallet`; see [`WalletLinker::update_wallet`].
    pub async fn update_wallet(&self, wallet: &Wallet, addresses: &[String]) -> Result<usize, CoreError> {
        let (_conn, ledger) = self.open().await?;
        WalletLinker::new(ledger).update_wallet(wallet, addresses).await
    }

    /// Wallet transactions in block time order.
    pub async fn stream_wallet_transactions(
        &self,
        wallet: &Wallet,
        query: &WalletTransactionQuery,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Transaction>, CoreError> {
        let mut filter = Filter::all().eq("wallets", wallet.id);
        if let Some(start) = query.start_block {
            filter = filter.gte("blockHeight", start);
        }
        if let Some(end) = query.end_block {
            filter = filter.lte("blockHeight", end);
        }
        if let Some(start) = query.start_date {
            filter = filter.gt("blockTimeNormalized", start);
        }
        if let Some(end) = query.end_date {
            filter = filter.lt("blockTimeNormalized", end);
        }

        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let options = options.with_sort("blockTimeNormalized", Direction::Ascending);
        let stream = ledger.transactions.streaming(&filter, &options).await?;
        Ok(with_confirmations(stream, tip, Transaction::with_confirmations))
    }

    pub async fn get_wallet_balance(&self, wallet: &Wallet) -> Result<Balance, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let coins = ledger
            .coins
            .fetch_many(
                &Filter::all()
                    .eq("wallets", wallet.id)
                    .lt("spentHeight", 0i64)
                    .gt("mintHeight", -3i64),
                &StreamingFindOptions::new(),
            )
            .await?;
        Ok(Balance::from_coins(&coins))
    }

    /// Balance as of the last block at or before `time`. Zero when no block
    /// is that old.
    pub async fn get_wallet_balance_at_time(
        &self,
        wallet: &Wallet,
        time: OffsetDateTime,
    ) -> Result<Balance, CoreError> {
        let (_conn, ledger) = self.open().await?;
        let at = ledger
            .blocks
            .fetch_many(
                &Filter::all().lte("timeNormalized", time),
                &StreamingFindOptions::new()
                    .sort("timeNormalized", Direction::Descending)
                    .limit(1),
            )
            .await?
            .into_iter()
            .next();
        let Some(at) = at else {
            return Ok(Balance::default());
        };

        let height = at.height.as_i64();
        let coins = ledger
            .coins
            .fetch_many(
                &Filter::all()
                    .eq("wallets", wallet.id)
                    .lte("mintHeight", height),
                &StreamingFindOptions::new(),
            )
            .await?;
        let unspent_then: Vec<&Coin> = coins
            .iter()
            .filter(|coin| coin.spent_height > height || coin.spent_height == UNSPENT_HEIGHT)
            .collect();
        Ok(Balance::from_coins(unspent_then))
    }

    /// Confirmed coins of `wallet`, unspent only unless `include_spent`.
    pub async fn stream_wallet_utxos(
        &self,
        wallet: &Wallet,
        include_spent: bool,
        options: &StreamingFindOptions,
    ) -> Result<DocumentStream<Coin>, CoreError> {
        let mut filter = Filter::all()
            .eq("wallets", wallet.id)
            .gte("mintHeight", 0i64);
        if !include_spent {
            filter = filter.eq("spentHeight", UNSPENT_HEIGHT);
        }
        let (_conn, ledger) = self.open().await?;
        let tip = Self::tip_height(&ledger).await?;
        let stream = ledger.coins.streaming(&filter, options).await?;
        Ok(with_confirmations(stream, tip, Coin::with_confirmations))
    }

    // ==========================================================================
    // Node pass-through
    // ==========================================================================

    pub async fn get_fee(&self, target: u32) -> Result<EstimateFee, CoreError> {
        self.accessor.get_fee(target).await
    }

    pub async fn broadcast_transaction(&self, raw_hex: &str) -> Result<TransactionId, CoreError> {
        self.accessor.broadcast_transaction(raw_hex).await
    }
}
