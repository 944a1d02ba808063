//! In-process network connecting nodes through channels, with fault
//! injection for partitions and message loss.

use super::rpc::{RpcRequest, RpcResponse};
use super::transport::{Transport, TransportError};
use accord_common::types::NodeId;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

const INBOX_CAPACITY: usize = 256;

/// An RPC waiting to be handled by the receiving node
#[derive(Debug)]
pub struct InboundRpc {
    pub from: NodeId,
    pub request: RpcRequest,
    pub reply: oneshot::Sender<RpcResponse>,
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, mpsc::Sender<InboundRpc>>,
    isolated: HashSet<NodeId>,
    drop_rate: f64,
}

impl NetworkState {
    fn cut(&self, a: &str, b: &str) -> bool {
        self.isolated.contains(a) || self.isolated.contains(b)
    }
}

/// Shared registry of node inboxes. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach `id` to the network, replacing any earlier inbox (a restart)
    pub fn register(&self, id: impl Into<NodeId>) -> mpsc::Receiver<InboundRpc> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.state().inboxes.insert(id.into(), tx);
        rx
    }

    /// Detach `id`; requests to it fail as if the process were gone
    pub fn unregister(&self, id: &str) {
        self.state().inboxes.remove(id);
    }

    /// The transport `id` uses to reach its peers
    pub fn transport_for(&self, id: impl Into<NodeId>) -> NetworkTransport {
        NetworkTransport {
            network: self.clone(),
            from: id.into(),
        }
    }

    /// Cut `id` off from every other node
    pub fn isolate(&self, id: &str) {
        self.state().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.state().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        self.state().isolated.clear();
    }

    /// Probability in `[0, 1]` that a request or its reply is lost
    pub fn set_drop_rate(&self, rate: f64) {
        self.state().drop_rate = rate.clamp(0.0, 1.0);
    }

    fn lost(&self) -> bool {
        let rate = self.state().drop_rate;
        rate > 0.0 && rand::thread_rng().gen_bool(rate)
    }
}

/// One node's endpoint on an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct NetworkTransport {
    network: InMemoryNetwork,
    from: NodeId,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn send(&self, to: &NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        let sender = {
            let state = self.network.state();
            if state.cut(&self.from, to) {
                return Err(TransportError::Unreachable(to.clone()));
            }
            state
                .inboxes
                .get(to)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(to.clone()))?
        };

        if self.network.lost() {
            return Err(TransportError::Unreachable(to.clone()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(InboundRpc {
                from: self.from.clone(),
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        let response = reply_rx.await.map_err(|_| TransportError::Closed)?;

        // The reply travels back over the same link, which may have been cut
        // or may drop it
        let cut = self.network.state().cut(&self.from, to);
        if cut || self.network.lost() {
            return Err(TransportError::Unreachable(to.clone()));
        }
        Ok(response)
    }
}
