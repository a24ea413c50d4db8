use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid address: {addr}")]
    InvalidAddress { addr: String },

    #[error("address already in use: {addr}")]
    AddressInUse { addr: String },

    #[error("invalid pool handle: {name}")]
    InvalidPool { name: String },

    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("bulk transfer failed: {reason}")]
    BulkTransfer { reason: String },

    #[error("no handler registered for rpc 0x{rpc_id:016X} (provider {provider_id})")]
    UnknownRpc { rpc_id: u64, provider_id: u16 },

    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("completion callback dropped before firing")]
    CompletionDropped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this error was raised before the operation was issued.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, RpcError::ResourceExhausted { .. })
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
