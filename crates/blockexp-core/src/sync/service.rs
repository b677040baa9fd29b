use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::accessor::Accessor;
use crate::error::CoreError;
use crate::store::Database;

use super::{SyncSettings, Synchronizer};

/// `(chain, network)`.
pub type TargetKey = (String, String);

/// Supervisor of one synchronizer task per `(chain, network)`.
///
/// Tasks are started in the order requested and stopped in key order.
pub struct SyncService {
    shutdown: watch::Sender<bool>,
    finished: watch::Sender<usize>,
    tasks: BTreeMap<TargetKey, JoinHandle<Result<(), CoreError>>>,
}

impl Default for SyncService {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncService {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(0);
        Self {
            shutdown,
            finished,
            tasks: BTreeMap::new(),
        }
    }

    /// Spawn a synchronizer for the accessor's `(chain, network)`.
    pub fn start(
        &mut self,
        accessor: Arc<Accessor>,
        database: Database,
        settings: SyncSettings,
    ) -> Result<(), CoreError> {
        let key = (accessor.chain().to_owned(), accessor.network().to_owned());
        if self.tasks.contains_key(&key) {
            return Err(CoreError::Config(format!(
                "{}:{} is already being synchronized",
                key.0, key.1
            )));
        }

        let synchronizer = Synchronizer::new(accessor, database, settings);
        let shutdown = self.shutdown.subscribe();
        let finished = self.finished.clone();
        let handle = tokio::spawn(async move {
            let result = synchronizer.run(shutdown).await;
            finished.send_modify(|count| *count += 1);
            result
        });
        info!(chain = %key.0, network = %key.1, "synchronizer task spawned");
        self.tasks.insert(key, handle);
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &TargetKey> {
        self.tasks.keys()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolves once every started task has returned on its own.
    pub async fn finished(&self) {
        let total = self.tasks.len();
        let mut finished = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = finished.wait_for(|count| *count >= total).await;
    }

    /// Signal every task to stop and join them in key order.
    pub async fn shutdown(self) -> Vec<(TargetKey, Result<(), CoreError>)> {
        self.shutdown.send_replace(true);
        let mut results = Vec::with_capacity(self.tasks.len());
        for (key, handle) in self.tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    warn!(chain = %key.0, network = %key.1, error = %err, "synchronizer task panicked");
                    Err(CoreError::Task(err.to_string()))
                }
            };
            results.push((key, result));
        }
        results
    }
}
