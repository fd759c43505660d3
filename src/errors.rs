use thiserror::Error;

/// Caller-visible error taxonomy of the library.
///
/// Validation failures are recoverable: the offending frame is dropped and the
/// connection stays up. RPC failures bubble to the caller; only a timeout also
/// disconnects the peer. Lifecycle and configuration failures abort `start`.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("invalid peer info: {0}")]
    InvalidPeer(String),

    #[error("invalid RPC request: {0}")]
    InvalidRpcRequest(String),

    #[error("invalid protocol message: {0}")]
    InvalidProtocolMessage(String),

    #[error("invalid RPC response: {0}")]
    InvalidRpcResponse(String),

    #[error("RPC request for procedure '{procedure}' timed out")]
    RpcTimeout { procedure: String },

    #[error("RPC request for procedure '{procedure}' failed: {message}")]
    RpcResponseError { procedure: String, message: String },

    #[error("a response was already sent for this request")]
    ResponseAlreadySent,

    #[error("request failed: {0}")]
    RequestFail(String),

    #[error("send failed: {0}")]
    SendFail(String),

    #[error("inbound handshake failed: {0}")]
    PeerInboundHandshake(String),

    #[error("outbound connection failed: {0}")]
    PeerOutboundConnection(String),

    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("node is not active")]
    NotActive,

    #[error("node is already active")]
    AlreadyActive,
}
