use super::rpc::{RpcRequest, RpcResponse};
use accord_common::types::NodeId;
use async_trait::async_trait;
use thiserror::Error;

/// Delivers one RPC to a peer and waits for its answer.
///
/// Messages may be lost or delayed but never corrupted. Implementations
/// must not block the caller's task; the node calls `send` from a task of
/// its own per peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError>;
}

/// Errors that can occur during transport operations. None of them are
/// fatal to the protocol; the request is simply retried later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request timed out")]
    Timeout,

    #[error("peer closed the connection")]
    Closed,
}
