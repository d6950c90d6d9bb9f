use std::time::Duration;

use thiserror::Error;

/// Errors produced anywhere in the muxrpc stack.
///
/// The variants keep the protocol's error classes distinguishable for
/// callers: framing and handshake errors are terminal for a session,
/// dispatch and application errors are scoped to a single call, and the
/// timeout variants each carry their own message so tests and callers can
/// tell them apart.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc codec: binary serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("rpc codec: json serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("rpc: frame of {0} bytes exceeds the maximum message size")]
    FrameTooLarge(usize),

    #[error("rpc: invalid magic number {0:#x}")]
    BadMagic(u32),

    #[error("rpc: unknown codec type {0}")]
    UnknownCodec(String),

    #[error("rpc: handshake failed: {0}")]
    Handshake(String),

    #[error("rpc server: service/method request ill-formed: {0}")]
    BadServiceMethod(String),

    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc server: service name is not exported: {0}")]
    UnexportedService(String),

    #[error("rpc server: request handling timed out within {0:?}")]
    HandleTimeout(Duration),

    #[error("rpc client: connect timeout within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc client: call canceled")]
    Canceled,

    #[error("rpc client: connection is shut down")]
    Shutdown,

    #[error("rpc client: connection error: {0}")]
    Connection(String),

    /// Error string reported by the remote handler, carried in the response
    /// header.
    #[error("{0}")]
    Application(String),

    #[error("rpc registry: {0}")]
    Registry(String),

    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("rpc: invalid address {0}, expected format scheme@target")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
