use crate::error::{CoreError, RpcError};

#[derive(serde::Serialize)]
pub(super) struct JsonRpcRequest<'a> {
    pub(super) jsonrpc: &'static str,
    pub(super) id: u64,
    pub(super) method: &'a str,
    pub(super) params: &'a [serde_json::Value],
}

#[derive(serde::Deserialize)]
pub(super) struct JsonRpcResponse {
    #[serde(default)]
    pub(super) id: serde_json::Value,
    pub(super) result: Option<serde_json::Value>,
    pub(super) error: Option<serde_json::Value>,
}

impl JsonRpcResponse {
    /// Split into the call outcome. A `null` error means success.
    pub(super) fn into_result(self) -> Result<serde_json::Value, CoreError> {
        match self.error {
            Some(err) if !err.is_null() => Err(parse_jsonrpc_error(err)),
            _ => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Parse a JSON-RPC error value into a structured `CoreError`.
///
/// JSON-RPC 2.0 errors are `{"code": <int>, "message": <string>}`.
/// If the error value matches that shape, we produce a `Server` error;
/// otherwise we fall back to `InvalidResponse` with the raw JSON.
pub(super) fn parse_jsonrpc_error(err: serde_json::Value) -> CoreError {
    #[derive(serde::Deserialize)]
    struct JsonRpcError {
        code: i64,
        message: String,
    }

    if let Ok(parsed) = serde_json::from_value::<JsonRpcError>(err.clone()) {
        CoreError::Rpc(RpcError::Server {
            code: parsed.code,
            message: parsed.message,
        })
    } else {
        CoreError::Rpc(RpcError::InvalidResponse(format!(
            "non-standard JSON-RPC error: {err}"
        )))
    }
}

pub(super) fn parse_batch_id(id: &serde_json::Value) -> Result<u64, CoreError> {
    if let Some(n) = id.as_u64() {
        return Ok(n);
    }

    if let Some(s) = id.as_str() {
        return s.parse::<u64>().map_err(|e| {
            RpcError::InvalidResponse(format!("invalid batch response id string: {e}")).into()
        });
    }

    Err(RpcError::InvalidResponse(format!("invalid batch response id: {id}")).into())
}
