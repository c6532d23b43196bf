//! Proxy error types.

use thiserror::Error;

use crate::protocol::{CallId, ObjectId};

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("worker channel closed")]
    ChannelClosed,

    #[error("worker channel inbound hook already taken")]
    ChannelInUse,

    #[error("worker proxy disposed")]
    WorkerDisposed,

    #[error("remote object {0} is not live")]
    ObjectDisposed(ObjectId),

    #[error("remote object {0} is owned by the worker and cannot be disposed directly")]
    DisposalForbidden(ObjectId),

    #[error("call {0} was dropped without a result")]
    CallDropped(CallId),

    #[error("snapshot static data requested before it was fetched")]
    StaticDataNotLoaded,

    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Proxy result type.
pub type Result<T> = std::result::Result<T, ProxyError>;
