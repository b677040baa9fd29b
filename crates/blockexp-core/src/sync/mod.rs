//! Keeps one `(chain, network)` ledger in step with its node.

mod import;
mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::accessor::Accessor;
use crate::error::CoreError;
use crate::store::{update, Database, Filter, Ledger};
use crate::types::{Block, BlockHeight, Coin, UNSPENT_HEIGHT};
use crate::wallet::WalletLinker;

pub use service::SyncService;

/// Default pause between steady-state iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default number of imported heights between full-sync checkpoints.
pub const DEFAULT_CHECKPOINT_EVERY: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    /// Zero disables intermediate checkpoints during full sync.
    pub checkpoint_every: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    FullSync,
    SteadyState,
}

/// Imports blocks from one node into its ledger.
pub struct Synchronizer {
    accessor: Arc<Accessor>,
    database: Database,
    settings: SyncSettings,
    state: SyncState,
}

impl Synchronizer {
    pub fn new(accessor: Arc<Accessor>, database: Database, settings: SyncSettings) -> Self {
        Self {
            accessor,
            database,
            settings,
            state: SyncState::FullSync,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Sync until `shutdown` flips to `true` or an iteration fails.
    ///
    /// Shutdown drops the in-flight iteration together with its pooled
    /// connection and returns [`CoreError::Cancelled`].
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let chain = self.accessor.chain().to_owned();
        let network = self.accessor.network().to_owned();
        info!(%chain, %network, "synchronizer started");

        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => Err(CoreError::Cancelled),
            result = self.work() => result,
        };

        match &result {
            Err(CoreError::Cancelled) => info!(%chain, %network, "synchronizer cancelled"),
            Err(err) => error!(%chain, %network, error = %err, "synchronizer failed"),
            Ok(()) => info!(%chain, %network, "synchronizer stopped"),
        }
        result
    }

    async fn work(&mut self) -> Result<(), CoreError> {
        let connection = self.database.connect().await?;
        let ledger = connection
            .ledger(self.accessor.chain(), self.accessor.network())
            .await?;
        ledger.create_indexes().await?;
        discard_uncommitted(&ledger).await?;
        let linker = WalletLinker::new(ledger.clone());

        self.full_sync(&ledger, &linker).await?;
        self.state = SyncState::SteadyState;
        loop {
            self.sync_iteration(&ledger, &linker).await?;
            ledger.checkpoint().await?;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Import every height up to the node's tip into an empty ledger.
    pub async fn full_sync(&self, ledger: &Ledger, linker: &WalletLinker) -> Result<(), CoreError> {
        if ledger.tip().await?.is_some() {
            return Ok(());
        }
        let tip = self.accessor.get_local_tip().await?;
        info!(
            chain = %ledger.chain(),
            network = %ledger.network(),
            tip = %tip.height,
            "full sync started"
        );

        let every = self.settings.checkpoint_every;
        for height in 0..=tip.height.0 {
            self.import_height(ledger, linker, BlockHeight(height)).await?;
            if every > 0 && (height + 1) % every == 0 {
                ledger.checkpoint().await?;
                info!(chain = %ledger.chain(), %height, "full sync progress");
            }
        }
        ledger.checkpoint().await?;
        info!(chain = %ledger.chain(), network = %ledger.network(), "full sync finished");
        Ok(())
    }

    /// One steady-state pass: undo a reorg if the node's chain diverged,
    /// then import up to the node's tip.
    pub async fn sync_iteration(&self, ledger: &Ledger, linker: &WalletLinker) -> Result<(), CoreError> {
        let Some(db_tip) = ledger.tip().await? else {
            return self.full_sync(ledger, linker).await;
        };

        if let Some(fork) = self.find_fork(ledger, db_tip.height).await? {
            warn!(
                chain = %ledger.chain(),
                network = %ledger.network(),
                %fork,
                "chain reorganized"
            );
            undo_from(ledger, fork).await?;
        }

        let start = match ledger.tip().await? {
            Some(tip) => tip.height.0 + 1,
            None => 0,
        };
        let remote_tip = self.accessor.get_local_tip().await?;
        for height in start..=remote_tip.height.0 {
            self.import_height(ledger, linker, BlockHeight(height)).await?;
        }
        Ok(())
    }

    /// First height where the stored chain and the node's chain disagree,
    /// walking down from `db_tip`.
    async fn find_fork(&self, ledger: &Ledger, db_tip: BlockHeight) -> Result<Option<BlockHeight>, CoreError> {
        let mut height = i64::from(db_tip.0);
        while height >= 0 {
            let at = BlockHeight(height as u32);
            let remote = match self.accessor.get_block_hash(at).await {
                Ok(hash) => Some(hash),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            let local = ledger
                .blocks
                .fetch_one(&Filter::all().eq("height", at))
                .await?
                .map(|block| block.hash);

            if remote.is_some() && remote == local {
                return Ok((at != db_tip).then(|| BlockHeight(at.0 + 1)));
            }
            debug!(chain = %ledger.chain(), height, ?remote, ?local, "block differs from node");
            height -= 1;
        }
        Ok(Some(BlockHeight(0)))
    }

    async fn import_height(
        &self,
        ledger: &Ledger,
        linker: &WalletLinker,
        height: BlockHeight,
    ) -> Result<Block, CoreError> {
        let raw = self.accessor.get_raw_block(height).await?;
        let previous = match height.0.checked_sub(1) {
            Some(below) => {
                ledger
                    .blocks
                    .fetch_one(&Filter::all().eq("height", BlockHeight(below)))
                    .await?
            }
            None => None,
        };
        let block = import::import_block(ledger, &raw, previous.as_ref()).await?;
        linker.tag_height(height).await?;
        debug!(
            chain = %ledger.chain(),
            %height,
            hash = %block.hash,
            txs = block.transaction_count,
            "block imported"
        );
        Ok(block)
    }
}

/// Remove every height at or above `height`.
///
/// The block documents go first so an interrupted undo never leaves a
/// block whose coins are gone.
pub(crate) async fn undo_from(ledger: &Ledger, height: BlockHeight) -> Result<(), CoreError> {
    info!(
        chain = %ledger.chain(),
        network = %ledger.network(),
        %height,
        "undoing heights"
    );
    let blocks = ledger
        .blocks
        .delete_many(Filter::all().gte("height", height))
        .await?;
    let transactions = ledger
        .transactions
        .delete_many(Filter::all().gte("blockHeight", height))
        .await?;
    let minted = ledger
        .coins
        .delete_many(Filter::all().gte("mintHeight", height))
        .await?;
    let unspent = ledger
        .coins
        .update_many(
            Filter::all().gte("spentHeight", height),
            update(|coin: &mut Coin| {
                coin.spent_height = UNSPENT_HEIGHT;
                coin.spent_txid = None;
            }),
        )
        .await?;
    if let Some(below) = height.0.checked_sub(1) {
        ledger
            .blocks
            .update_many(
                Filter::all().eq("height", BlockHeight(below)),
                update(|block: &mut Block| block.next_block_hash = None),
            )
            .await?;
    }
    info!(
        chain = %ledger.chain(),
        blocks,
        transactions,
        minted,
        unspent,
        "undo finished"
    );
    Ok(())
}

/// Drop transactions and coin writes above the stored tip.
///
/// A block is stored only after its coins and transactions, so anything
/// above the tip comes from an import or checkpoint that never finished.
pub(crate) async fn discard_uncommitted(ledger: &Ledger) -> Result<(), CoreError> {
    let above = match ledger.tip().await? {
        Some(tip) => BlockHeight(tip.height.0 + 1),
        None => BlockHeight(0),
    };
    let stale = ledger
        .transactions
        .count(&Filter::all().gte("blockHeight", above))
        .await?
        + ledger
            .coins
            .count(&Filter::all().gte("mintHeight", above))
            .await?
        + ledger
            .coins
            .count(&Filter::all().gte("spentHeight", above))
            .await?;
    if stale == 0 {
        return Ok(());
    }
    warn!(
        chain = %ledger.chain(),
        network = %ledger.network(),
        %above,
        stale,
        "discarding writes above the stored tip"
    );
    undo_from(ledger, above).await
}

#[cfg(test)]
mod tests {
    use bitcoin::OutPoint;

    use super::*;
    use crate::provider::Provider;
    use crate::rpc::mock::MockNode;
    use crate::store::StoreSettings;
    use crate::test_util::{
        coinbase_tx, fixture, fixture_on, spend_tx, txid_from_byte, Fixture, CHAIN, NETWORK,
    };

    fn synchronizer(fx: &Fixture) -> Synchronizer {
        Synchronizer::new(fx.accessor.clone(), fx.database.clone(), SyncSettings::default())
    }

    async fn sync_once(fx: &Fixture) {
        let sync = synchronizer(fx);
        let linker = WalletLinker::new(fx.ledger.clone());
        sync.sync_iteration(&fx.ledger, &linker).await.expect("sync iteration");
    }

    async fn ledger_counts(fx: &Fixture) -> (usize, usize, usize) {
        let all = Filter::all();
        (
            fx.ledger.blocks.count(&all).await.expect("count"),
            fx.ledger.transactions.count(&all).await.expect("count"),
            fx.ledger.coins.count(&all).await.expect("count"),
        )
    }

    #[tokio::test]
    async fn reimporting_a_height_is_idempotent() {
        let fx = fixture().await;
        let funding = txid_from_byte(1);
        fx.node.mine(vec![coinbase_tx(funding, &[("alice", 5_000)])]);
        fx.node.mine(vec![
            coinbase_tx(txid_from_byte(2), &[("miner", 5_000)]),
            spend_tx(txid_from_byte(3), &[OutPoint::new(funding, 0)], &[("bob", 4_900)]),
        ]);
        sync_once(&fx).await;

        let before = ledger_counts(&fx).await;
        let coins_before = fx.ledger.coins.fetch_all().await.expect("coins");
        let block_before = fx.ledger.tip().await.expect("tip").expect("block");

        let sync = synchronizer(&fx);
        let linker = WalletLinker::new(fx.ledger.clone());
        sync.import_height(&fx.ledger, &linker, BlockHeight(1)).await.expect("reimport");

        assert_eq!(ledger_counts(&fx).await, before);
        assert_eq!(fx.ledger.coins.fetch_all().await.expect("coins"), coins_before);
        assert_eq!(fx.ledger.tip().await.expect("tip").expect("block"), block_before);

        let spend = fx.ledger.transactions.get(&txid_from_byte(3)).await.expect("get").expect("tx");
        assert_eq!(spend.fee, 100);
    }

    #[tokio::test]
    async fn replaying_a_mint_keeps_its_later_spend() {
        let fx = fixture().await;
        let funding = txid_from_byte(0x31);
        let spender = txid_from_byte(0x32);
        fx.node.mine(vec![coinbase_tx(funding, &[("alice", 2_000)])]);
        fx.node.mine(vec![
            coinbase_tx(txid_from_byte(0x33), &[("miner", 50)]),
            spend_tx(spender, &[OutPoint::new(funding, 0)], &[("bob", 1_900)]),
        ]);
        sync_once(&fx).await;

        let sync = synchronizer(&fx);
        let linker = WalletLinker::new(fx.ledger.clone());
        sync.import_height(&fx.ledger, &linker, BlockHeight(0)).await.expect("replay genesis");

        let coin = fx.ledger.coins.get(&(funding, 0)).await.expect("get").expect("coin");
        assert_eq!(coin.spent_height, 1);
        assert_eq!(coin.spent_txid, Some(spender));
        let genesis = fx.ledger.blocks.get(&fx.node.hash_at(0).expect("0")).await.expect("get").expect("b");
        assert_eq!(genesis.next_block_hash, fx.node.hash_at(1));
        assert_eq!(fx.ledger.tip().await.expect("tip").expect("block").height, BlockHeight(1));
    }

    #[tokio::test]
    async fn local_tip_never_decreases_without_a_reorg() {
        let fx = fixture().await;
        let provider = Provider::new(fx.accessor.clone(), fx.database.clone());
        let mut mined = 0;
        let mut last: Option<BlockHeight> = None;
        for batch in [2u32, 0, 3, 0, 1] {
            fx.node.mine_empty(batch, "miner");
            mined += batch;
            sync_once(&fx).await;

            let tip = provider.get_local_tip().await.expect("tip").height;
            assert_eq!(tip, BlockHeight(mined - 1));
            if let Some(previous) = last {
                assert!(tip >= previous, "tip went from {previous} to {tip}");
            }
            last = Some(tip);
        }
    }

    #[tokio::test]
    async fn interrupted_checkpoint_is_repaired_on_restart() {
        let dir = std::env::temp_dir().join(format!("blockexp-sync-checkpoint-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let settings = StoreSettings {
            data_dir: Some(dir.clone()),
            pool_size: 4,
        };
        let fx = fixture_on(MockNode::new(), Database::open(settings.clone()).expect("open")).await;
        fx.node.mine_empty(3, "miner");
        sync_once(&fx).await;
        fx.node.mine_empty(2, "miner");
        sync_once(&fx).await;

        // A directory in the way makes the coin snapshot fail mid-checkpoint.
        std::fs::create_dir_all(dir.join(CHAIN).join(NETWORK).join("coins.jsonl.tmp"))
            .expect("block the coin snapshot");
        assert!(fx.ledger.checkpoint().await.is_err());

        let reopened = Database::open(settings).expect("reopen");
        let ledger = reopened
            .connect()
            .await
            .expect("connection")
            .ledger(CHAIN, NETWORK)
            .await
            .expect("ledger");
        assert_eq!(ledger.tip().await.expect("tip").expect("block").height, BlockHeight(2));
        for block in ledger.blocks.fetch_all().await.expect("blocks") {
            let minted = ledger
                .coins
                .count(&Filter::all().eq("mintHeight", block.height))
                .await
                .expect("count");
            assert_eq!(minted, 1, "block {} lost its coinbase coin", block.height);
        }

        discard_uncommitted(&ledger).await.expect("discard");
        assert_eq!(
            ledger
                .transactions
                .count(&Filter::all().gte("blockHeight", BlockHeight(3)))
                .await
                .expect("count"),
            0
        );

        let sync = Synchronizer::new(fx.accessor.clone(), reopened.clone(), SyncSettings::default());
        sync.sync_iteration(&ledger, &WalletLinker::new(ledger.clone()))
            .await
            .expect("resume");
        assert_eq!(ledger.tip().await.expect("tip").expect("block").height, BlockHeight(4));
        assert_eq!(ledger.coins.count(&Filter::all()).await.expect("count"), 5);
        assert_eq!(ledger.transactions.count(&Filter::all()).await.expect("count"), 5);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn same_block_spend_is_recorded_on_the_coin() {
        let fx = fixture().await;
        let funding = txid_from_byte(1);
        let spender = txid_from_byte(2);
        fx.node.mine(vec![
            coinbase_tx(funding, &[("alice", 700)]),
            spend_tx(spender, &[OutPoint::new(funding, 0)], &[("bob", 650)]),
        ]);
        sync_once(&fx).await;

        let coin = fx.ledger.coins.get(&(funding, 0)).await.expect("get").expect("coin");
        assert_eq!(coin.spent_txid, Some(spender));
        assert_eq!(coin.spent_height, 0);
        let change = fx.ledger.coins.get(&(spender, 0)).await.expect("get").expect("coin");
        assert!(change.is_unspent());
    }

    #[tokio::test]
    async fn reorg_at_height_seven_undoes_the_stale_branch() {
        let fx = fixture().await;
        let funding = txid_from_byte(0xf0);
        fx.node.mine(vec![coinbase_tx(funding, &[("alice", 1_000)])]);
        fx.node.mine_empty(6, "miner");
        // Height 7 spends the coin minted at genesis.
        fx.node.mine(vec![
            coinbase_tx(txid_from_byte(0xf7), &[("miner", 50)]),
            spend_tx(txid_from_byte(0xe7), &[OutPoint::new(funding, 0)], &[("bob", 900)]),
        ]);
        fx.node.mine_empty(3, "miner");
        sync_once(&fx).await;
        assert_eq!(fx.ledger.tip().await.expect("tip").expect("block").height, BlockHeight(10));

        let kept: Vec<Block> = {
            let mut blocks = fx.ledger.blocks.fetch_all().await.expect("blocks");
            blocks.retain(|b| b.height.0 < 6);
            blocks
        };

        fx.node.rewind(6);
        fx.node.mine_empty(2, "other");
        sync_once(&fx).await;

        let tip = fx.ledger.tip().await.expect("tip").expect("block");
        assert_eq!(tip.height, BlockHeight(8));
        assert_eq!(Some(tip.hash), fx.node.hash_at(8));
        for block in kept {
            let stored = fx.ledger.blocks.get(&block.hash).await.expect("get").expect("kept");
            assert_eq!(stored, block);
        }
        let six = fx
            .ledger
            .blocks
            .fetch_one(&Filter::all().eq("height", BlockHeight(6)))
            .await
            .expect("fetch")
            .expect("height 6");
        assert_eq!(six.next_block_hash, fx.node.hash_at(7));

        let funding_coin = fx.ledger.coins.get(&(funding, 0)).await.expect("get").expect("coin");
        assert!(funding_coin.is_unspent());
        assert_eq!(funding_coin.spent_txid, None);
        assert!(fx.ledger.coins.get(&(txid_from_byte(0xe7), 0)).await.expect("get").is_none());
        assert!(fx
            .ledger
            .transactions
            .get(&txid_from_byte(0xe7))
            .await
            .expect("get")
            .is_none());
        assert!(fx.ledger.coins.get(&(txid_from_byte(0xf7), 0)).await.expect("get").is_none());
        assert_eq!(
            fx.ledger
                .coins
                .count(&Filter::all().gte("mintHeight", 7i64))
                .await
                .expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn undo_removes_heights_at_and_above() {
        let fx = fixture().await;
        let funding = txid_from_byte(0x10);
        fx.node.mine(vec![coinbase_tx(funding, &[("alice", 1_000)])]);
        fx.node.mine_empty(6, "miner");
        fx.node.mine(vec![
            coinbase_tx(txid_from_byte(0x17), &[("miner", 50)]),
            spend_tx(txid_from_byte(0x27), &[OutPoint::new(funding, 0)], &[("bob", 900)]),
        ]);
        fx.node.mine_empty(3, "miner");
        sync_once(&fx).await;

        undo_from(&fx.ledger, BlockHeight(7)).await.expect("undo");

        assert_eq!(fx.ledger.tip().await.expect("tip").expect("block").height, BlockHeight(6));
        assert_eq!(
            fx.ledger
                .blocks
                .count(&Filter::all().gte("height", BlockHeight(7)))
                .await
                .expect("count"),
            0
        );
        assert_eq!(
            fx.ledger
                .coins
                .count(&Filter::all().gte("mintHeight", 7i64))
                .await
                .expect("count"),
            0
        );
        let coin = fx.ledger.coins.get(&(funding, 0)).await.expect("get").expect("coin");
        assert_eq!(coin.spent_height, UNSPENT_HEIGHT);
        assert_eq!(coin.spent_txid, None);
    }

    #[tokio::test]
    async fn genesis_coin_moves_to_its_spender() {
        let fx = fixture().await;
        let genesis = txid_from_byte(0x01);
        fx.node.mine(vec![coinbase_tx(genesis, &[("genesis-addr", 5_000_000_000)])]);
        sync_once(&fx).await;

        let provider = Provider::new(fx.accessor.clone(), fx.database.clone());
        let balance = provider.get_balance_for_address("genesis-addr").await.expect("balance");
        assert_eq!(balance.confirmed, 5_000_000_000);
        assert_eq!(balance.unconfirmed, 0);
        assert_eq!(balance.balance, 5_000_000_000);

        fx.node.mine(vec![spend_tx(
            txid_from_byte(0x02),
            &[OutPoint::new(genesis, 0)],
            &[("next-addr", 4_999_990_000)],
        )]);
        sync_once(&fx).await;

        let old = provider.get_balance_for_address("genesis-addr").await.expect("balance");
        assert_eq!(old.balance, 0);
        let new = provider.get_balance_for_address("next-addr").await.expect("balance");
        assert_eq!(new.balance, 4_999_990_000);
        assert_eq!(new.confirmed, new.balance);
    }

    #[tokio::test]
    async fn normalized_time_never_goes_backwards() {
        let fx = fixture().await;
        fx.node.mine_at(2_000, vec![coinbase_tx(txid_from_byte(1), &[("a", 1)])]);
        fx.node.mine_at(1_000, vec![coinbase_tx(txid_from_byte(2), &[("a", 1)])]);
        sync_once(&fx).await;

        let first = fx.ledger.blocks.get(&fx.node.hash_at(0).expect("0")).await.expect("get").expect("b");
        let second = fx.ledger.blocks.get(&fx.node.hash_at(1).expect("1")).await.expect("get").expect("b");
        assert!(second.time < first.time);
        assert_eq!(second.time_normalized, first.time_normalized + time::Duration::seconds(1));
        assert_eq!(first.next_block_hash, Some(second.hash));

        let tx = fx.ledger.transactions.get(&txid_from_byte(2)).await.expect("get").expect("tx");
        assert_eq!(tx.block_time_normalized, Some(second.time_normalized));
        assert_eq!(second.reward, 1);
    }

    #[tokio::test]
    async fn run_returns_cancelled_and_releases_its_connection() {
        let fx = fixture().await;
        fx.node.mine_empty(3, "miner");
        let (tx, rx) = watch::channel(false);
        let sync = Synchronizer::new(
            fx.accessor.clone(),
            fx.database.clone(),
            SyncSettings {
                poll_interval: Duration::from_secs(3600),
                checkpoint_every: 0,
            },
        );
        let handle = tokio::spawn(sync.run(rx));

        for _ in 0..200 {
            if fx.ledger.tip().await.expect("tip").map(|b| b.height) == Some(BlockHeight(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).expect("receiver alive");

        let result = handle.await.expect("task must not panic");
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert_eq!(fx.database.available(), fx.database.pool_size());
    }

    #[tokio::test]
    async fn node_failure_ends_the_task_with_the_error() {
        let fx = fixture().await;
        let (_tx, rx) = watch::channel(false);
        // An empty node has no best block to report.
        let result = synchronizer(&fx).run(rx).await;
        assert!(matches!(result, Err(ref err) if !matches!(err, CoreError::Cancelled)));
    }
}
