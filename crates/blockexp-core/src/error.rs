use std::path::PathBuf;

/// Documents a caller asked for by id that the node or ledger does not have.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFound {
    #[error("block not found: {0}")]
    Block(String),

    #[error("transaction not found: {0}")]
    Transaction(String),

    #[error("wallet not found: {0}")]
    Wallet(String),

    #[error("address not found: {0}")]
    Address(String),
}

/// Failures talking to the node's JSON-RPC endpoint.
///
/// Daemon-reported errors stay data (`Server { code, message }`) so callers
/// can branch on the code instead of on error types.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("JSON-RPC server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC endpoint rejected credentials (HTTP 401)")]
    Unauthorized,

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    #[error("batch response is missing request id {id}")]
    MissingBatchItem { id: u64 },
}

impl RpcError {
    /// The daemon error code, when this is a server-reported error.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("bulk write on {collection} failed for {failed} of {total} operations")]
    PartialBulkWrite {
        collection: String,
        failed: usize,
        total: usize,
    },

    #[error("snapshot {path}: {message}")]
    Snapshot { path: PathBuf, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid node data: {0}")]
    InvalidData(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The daemon error code carried by an RPC server error, if any.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc(err) => err.code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
