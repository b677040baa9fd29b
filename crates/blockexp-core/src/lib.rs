pub mod accessor;
pub mod chain;
pub mod error;
pub mod provider;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod types;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_util;

pub use accessor::Accessor;
pub use chain::ChainTarget;
pub use error::CoreError;
pub use provider::Provider;
pub use store::{Database, StoreSettings};
pub use sync::{SyncService, SyncSettings, Synchronizer};
pub use wallet::WalletLinker;
