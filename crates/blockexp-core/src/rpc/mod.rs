//! JSON-RPC transport to a bitcoind-compatible daemon.
//!
//! Defines the [`RpcTransport`] trait and provides an HTTP implementation
//! ([`HttpRpcClient`]) plus an in-process test node (`mock::MockNode`).

mod http_adapter;
#[cfg(test)]
pub mod mock;

pub use http_adapter::HttpRpcClient;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;

/// Raw method-call surface of a node.
///
/// Implementations handle authentication, retries and response decoding.
/// Daemon-reported failures come back as `RpcError::Server { code, .. }`
/// so callers can branch on the code.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CoreError>;

    /// Issue several calls, returning one result per call in input order.
    ///
    /// A server error on one call does not fail the others; the outer
    /// `Result` only fails when the exchange itself does.
    async fn batch(
        &self,
        calls: &[(String, Vec<Value>)],
    ) -> Result<Vec<Result<Value, CoreError>>, CoreError> {
        let mut results = Vec::with_capacity(calls.len());
        for (method, params) in calls {
            results.push(self.call(method, params.clone()).await);
        }
        Ok(results)
    }
}
