//! Ledger store: a bounded connection pool over per-chain document
//! collections, optionally persisted as JSONL snapshots.

pub mod collection;
mod documents;
pub mod options;
pub mod query;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::CoreError;
use crate::types::{Block, Coin, Transaction, Wallet, WalletAddress};

pub use collection::{
    update, BulkWriteResult, Collection, Document, DocumentStream, IndexSpec, Update, WriteOp,
};
pub use options::{Direction, StreamingFindOptions};
pub use query::{Condition, Filter, IndexValue};

/// Default number of concurrently held connections.
pub const DEFAULT_POOL_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Snapshot directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub pool_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

// ==============================================================================
// Database / Connection
// ==============================================================================

/// Shared handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    permits: Arc<Semaphore>,
    pool_size: usize,
    data_dir: Option<PathBuf>,
    ledgers: Mutex<HashMap<(String, String), Arc<Ledger>>>,
}

impl Database {
    pub fn open(settings: StoreSettings) -> Result<Self, CoreError> {
        if settings.pool_size == 0 {
            return Err(CoreError::Config("store pool_size must be at least 1".into()));
        }
        if let Some(dir) = &settings.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                permits: Arc::new(Semaphore::new(settings.pool_size)),
                pool_size: settings.pool_size,
                data_dir: settings.data_dir,
                ledgers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn in_memory(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            inner: Arc::new(DatabaseInner {
                permits: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                data_dir: None,
                ledgers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.inner.data_dir.as_deref()
    }

    /// Connections currently free in the pool.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Wait for a free connection.
    pub async fn connect(&self) -> Result<Connection, CoreError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Cancelled)?;
        Ok(Connection {
            database: self.clone(),
            _permit: permit,
        })
    }

    /// Close the pool; pending and future `connect` calls fail.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

/// One pooled connection; the slot is released on drop.
pub struct Connection {
    database: Database,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// The ledger of `(chain, network)`, loading its snapshot and building
    /// its indexes on first open.
    pub async fn ledger(&self, chain: &str, network: &str) -> Result<Arc<Ledger>, CoreError> {
        let inner = &self.database.inner;
        let mut ledgers = inner.ledgers.lock().await;
        let key = (chain.to_owned(), network.to_owned());
        if let Some(ledger) = ledgers.get(&key) {
            return Ok(ledger.clone());
        }

        let snapshot_dir = inner
            .data_dir
            .as_ref()
            .map(|dir| dir.join(chain).join(network));
        let ledger = Arc::new(Ledger::new(chain, network, snapshot_dir));
        ledger.load().await?;
        ledger.create_indexes().await?;
        ledgers.insert(key, ledger.clone());
        Ok(ledger)
    }
}

// ==============================================================================
// Ledger
// ==============================================================================

/// The five collections of one `(chain, network)` namespace.
pub struct Ledger {
    chain: String,
    network: String,
    snapshot_dir: Option<PathBuf>,
    pub blocks: Collection<Block>,
    pub transactions: Collection<Transaction>,
    pub coins: Collection<Coin>,
    pub wallets: Collection<Wallet>,
    pub wallet_addresses: Collection<WalletAddress>,
}

fn collection<D: Document>(chain: &str, network: &str) -> Collection<D> {
    Collection::new(format!("{chain}:{network}:{}", D::NAME))
}

impl Ledger {
    fn new(chain: &str, network: &str, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            chain: chain.to_owned(),
            network: network.to_owned(),
            snapshot_dir,
            blocks: collection(chain, network),
            transactions: collection(chain, network),
            coins: collection(chain, network),
            wallets: collection(chain, network),
            wallet_addresses: collection(chain, network),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Declare every index. Safe to call repeatedly.
    pub async fn create_indexes(&self) -> Result<(), CoreError> {
        create_all(&self.blocks).await?;
        create_all(&self.transactions).await?;
        create_all(&self.coins).await?;
        create_all(&self.wallets).await?;
        create_all(&self.wallet_addresses).await?;
        debug!(chain = %self.chain, network = %self.network, "indexes ensured");
        Ok(())
    }

    /// Highest stored block.
    pub async fn tip(&self) -> Result<Option<Block>, CoreError> {
        let options = StreamingFindOptions::new()
            .sort("height", Direction::Descending)
            .limit(1);
        Ok(self
            .blocks
            .fetch_many(&Filter::all(), &options)
            .await?
            .into_iter()
            .next())
    }

    fn snapshot_path<D: Document>(dir: &Path) -> PathBuf {
        dir.join(format!("{}.jsonl", D::NAME))
    }

    async fn load(&self) -> Result<(), CoreError> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(());
        };
        let blocks = self.blocks.load_jsonl(&Self::snapshot_path::<Block>(dir)).await?;
        self.transactions
            .load_jsonl(&Self::snapshot_path::<Transaction>(dir))
            .await?;
        self.coins.load_jsonl(&Self::snapshot_path::<Coin>(dir)).await?;
        self.wallets.load_jsonl(&Self::snapshot_path::<Wallet>(dir)).await?;
        self.wallet_addresses
            .load_jsonl(&Self::snapshot_path::<WalletAddress>(dir))
            .await?;
        if blocks > 0 {
            info!(chain = %self.chain, network = %self.network, blocks, "ledger snapshot loaded");
        }
        Ok(())
    }

    /// Persist every collection. A no-op for in-memory stores.
    ///
    /// Blocks are written last: a checkpoint that stops early leaves the
    /// previous block snapshot, whose heights are fully covered by the
    /// newer transaction and coin files.
    pub async fn checkpoint(&self) -> Result<(), CoreError> {
        let Some(dir) = &self.snapshot_dir else {
            return Ok(());
        };
        self.transactions
            .save_jsonl(&Self::snapshot_path::<Transaction>(dir))
            .await?;
        self.coins.save_jsonl(&Self::snapshot_path::<Coin>(dir)).await?;
        self.wallets.save_jsonl(&Self::snapshot_path::<Wallet>(dir)).await?;
        self.wallet_addresses
            .save_jsonl(&Self::snapshot_path::<WalletAddress>(dir))
            .await?;
        let blocks = self.blocks.save_jsonl(&Self::snapshot_path::<Block>(dir)).await?;
        debug!(chain = %self.chain, network = %self.network, blocks, "ledger checkpointed");
        Ok(())
    }
}

async fn create_all<D: Document>(collection: &Collection<D>) -> Result<(), CoreError> {
    for spec in D::indexes() {
        collection.create_index(spec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{make_coin, txid_from_byte};

    #[tokio::test]
    async fn collections_are_namespaced_and_indexes_idempotent() {
        let db = Database::in_memory(2);
        let ledger = db
            .connect()
            .await
            .expect("connect")
            .ledger("PCH", "mainnet")
            .await
            .expect("ledger");
        assert_eq!(ledger.coins.name(), "PCH:mainnet:coins");
        assert_eq!(ledger.wallet_addresses.name(), "PCH:mainnet:walletaddresses");

        ledger.create_indexes().await.expect("first");
        ledger.create_indexes().await.expect("second");
        let names = ledger.blocks.index_names().await;
        assert_eq!(names.len(), Block::indexes().len());
        assert!(names.contains(&"processed_height".to_owned()));
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_connections() {
        let db = Database::in_memory(1);
        let first = db.connect().await.expect("first connection");
        assert_eq!(db.available(), 0);

        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), db.connect()).await;
        assert!(pending.is_err(), "second connection must wait");

        drop(first);
        let _second = db.connect().await.expect("released slot is reusable");
        db.close();
        assert!(matches!(db.connect().await, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn same_namespace_shares_one_ledger() {
        let db = Database::in_memory(4);
        let a = db.connect().await.expect("c").ledger("BTC", "regtest").await.expect("l");
        let b = db.connect().await.expect("c").ledger("BTC", "regtest").await.expect("l");
        assert!(Arc::ptr_eq(&a, &b));
        let other = db.connect().await.expect("c").ledger("BTC", "testnet").await.expect("l");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn checkpoint_reloads_in_a_new_database() {
        let dir = std::env::temp_dir().join(format!("blockexp-ledger-{}", std::process::id()));
        let settings = StoreSettings {
            data_dir: Some(dir.clone()),
            pool_size: 2,
        };
        {
            let db = Database::open(settings.clone()).expect("open");
            let ledger = db.connect().await.expect("c").ledger("BTC", "regtest").await.expect("l");
            ledger.create_indexes().await.expect("indexes");
            ledger
                .coins
                .insert_one(make_coin(txid_from_byte(1), 0, 3, "addr", 900))
                .await
                .expect("insert");
            ledger.checkpoint().await.expect("checkpoint");
        }

        let db = Database::open(settings).expect("reopen");
        let ledger = db.connect().await.expect("c").ledger("BTC", "regtest").await.expect("l");
        let coin = ledger
            .coins
            .get(&(txid_from_byte(1), 0))
            .await
            .expect("get")
            .expect("coin restored");
        assert_eq!(coin.value, 900);
        assert!(dir.join("BTC").join("regtest").join("coins.jsonl").exists());
        assert_eq!(ledger.coins.index_names().await.len(), Coin::indexes().len());
        assert_eq!(ledger.wallets.index_names().await.len(), Wallet::indexes().len());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = Database::open(StoreSettings {
            data_dir: None,
            pool_size: 0,
        })
        .err()
        .expect("zero pool");
        assert!(matches!(err, CoreError::Config(_)));
    }
}
