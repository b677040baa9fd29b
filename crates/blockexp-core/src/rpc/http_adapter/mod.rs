//! JSON-RPC client for bitcoind-compatible endpoints.
//!
//! Implements [`RpcTransport`](super::RpcTransport) over HTTP using
//! `reqwest`, with URL-embedded basic auth, bounded retry of transient
//! connection failures, optional rate limiting and batched calls.

mod client;
mod connection;
mod protocol;

pub use client::HttpRpcClient;
