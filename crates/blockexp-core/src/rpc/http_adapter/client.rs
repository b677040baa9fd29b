use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, RpcError};

use super::super::RpcTransport;
use super::connection::parse_connection;
use super::protocol::{parse_batch_id, JsonRpcRequest, JsonRpcResponse};

/// Attempts made for a request whose connection keeps failing.
const MAX_ATTEMPTS: u32 = 5;

/// Fixed pause between attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// bitcoind JSON-RPC client over HTTP(S).
///
/// Only the connect phase has a timeout; slow calls such as `getblock` at
/// full verbosity on large blocks are allowed to run to completion.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: Url,
    auth: Option<(String, String)>,
    limiter: Option<DirectRateLimiter>,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a client for `http(s)://[user:pass@]host:port`.
    ///
    /// If `requests_per_second` is set, calls are rate-limited per outbound
    /// HTTP request (batched calls count as one request).
    pub fn new(connection: &str, requests_per_second: Option<u32>) -> Result<Self, CoreError> {
        let endpoint = parse_connection(connection)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(RpcError::Transport)?;

        let limiter = match requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::Config("requests_per_second must be at least 1".to_owned())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        Ok(Self {
            client,
            url: endpoint.url,
            auth: endpoint.auth,
            limiter,
            next_id: AtomicU64::new(initial_request_id()),
        })
    }

    /// Endpoint URL with credentials removed.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Atomically reserve `count` consecutive request IDs for batch calls.
    fn reserve_request_ids(&self, count: u64) -> u64 {
        self.next_id.fetch_add(count, Ordering::Relaxed)
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// POST `payload`, retrying transient connection failures.
    ///
    /// Any HTTP status other than 401 yields the body: bitcoind reports RPC
    /// errors with a 4xx/5xx status and a JSON-RPC error object.
    async fn post<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(StatusCode, String), CoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut builder = self
                .client
                .post(self.url.clone())
                .header(header::CONTENT_TYPE, "application/json")
                .json(payload);
            if let Some((ref user, ref pass)) = self.auth {
                builder = builder.basic_auth(user, Some(pass));
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %err, url = %self.url, "rpc connection failed; retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
                Err(err) if is_transient(&err) => {
                    return Err(RpcError::ConnectionFailed {
                        attempts: attempt,
                        source: err,
                    }
                    .into());
                }
                Err(err) => return Err(RpcError::Transport(err).into()),
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(RpcError::Unauthorized.into());
            }
            let body = response.text().await.map_err(RpcError::Transport)?;
            return Ok((status, body));
        }
    }

    async fn rpc_call(&self, method: &str, params: Vec<Value>) -> Result<Value, CoreError> {
        self.wait_for_rate_limit().await;
        let id = self.reserve_request_ids(1);
        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params: &params,
        };

        let (status, body) = self.post(&req).await?;
        debug!(rpc.id = id, rpc.method = method, %status, body_len = body.len(), "rpc response");
        trace!(rpc.id = id, rpc.method = method, body = %body, "rpc response body");

        let decoded: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC response: {e}; body={body}"))
        })?;
        decoded.into_result()
    }

    async fn rpc_batch(
        &self,
        calls: &[(String, Vec<Value>)],
    ) -> Result<Vec<Result<Value, CoreError>>, CoreError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        self.wait_for_rate_limit().await;
        let start_id = self.reserve_request_ids(calls.len() as u64);
        debug!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = calls.len(),
            "rpc batch call"
        );
        let requests: Vec<JsonRpcRequest<'_>> = calls
            .iter()
            .enumerate()
            .map(|(offset, (method, params))| JsonRpcRequest {
                jsonrpc: "2.0",
                id: start_id + offset as u64,
                method,
                params,
            })
            .collect();

        let (status, body) = self.post(&requests).await?;
        debug!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = calls.len(),
            %status,
            body_len = body.len(),
            "rpc batch response"
        );
        trace!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = calls.len(),
            body = %body,
            "rpc batch response body"
        );

        let decoded: Vec<JsonRpcResponse> = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC batch response: {e}; body={body}"))
        })?;

        let mut by_id: HashMap<u64, JsonRpcResponse> = HashMap::with_capacity(decoded.len());
        for item in decoded {
            let id = parse_batch_id(&item.id)?;
            by_id.insert(id, item);
        }

        let mut ordered = Vec::with_capacity(calls.len());
        for id in start_id..(start_id + calls.len() as u64) {
            let item = by_id.remove(&id).ok_or(RpcError::MissingBatchItem { id })?;
            ordered.push(item.into_result());
        }
        Ok(ordered)
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CoreError> {
        self.rpc_call(method, params).await
    }

    async fn batch(
        &self,
        calls: &[(String, Vec<Value>)],
    ) -> Result<Vec<Result<Value, CoreError>>, CoreError> {
        self.rpc_batch(calls).await
    }
}

/// Failures worth another attempt: the node was unreachable or the request
/// never completed.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}
