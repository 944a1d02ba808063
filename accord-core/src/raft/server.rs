//! Runs a [`RaftNode`] as a tokio task.
//!
//! Every event (inbound RPC, peer reply, client request, timer expiry) is
//! handled one at a time by a single loop that owns the node and both of
//! its timers, so no two state changes ever interleave. Outbound RPCs run
//! as their own tasks and report back through a channel.

use super::network::InboundRpc;
use super::node::{Applied, NodeRole, NodeStatus, RaftNode};
use super::rpc::{RpcRequest, RpcResponse};
use super::timer::{random_election_timeout, Timer};
use super::transport::{Transport, TransportError};
use accord_common::error::{AccordError, Result};
use accord_common::types::{LogIndex, NodeId, Term};
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const CLIENT_QUEUE: usize = 128;
const REPLY_QUEUE: usize = 1024;

/// Requests from the local application to the node task
#[derive(Debug)]
pub enum ClientRequest {
    /// Replicate a command; answered with its result once applied
    Propose {
        command: Bytes,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcome of one outbound RPC, reported by its task
struct PeerReply {
    peer: NodeId,
    request: RpcRequest,
    result: std::result::Result<RpcResponse, TransportError>,
}

/// Client side of a running node
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    requests: mpsc::Sender<ClientRequest>,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Replicates `command` and waits until it has been applied.
    ///
    /// Fails with `NotLeader` on a non-leader, and with `LeadershipLost` if
    /// the node is deposed before the entry is applied (the entry may still
    /// commit under a later leader).
    pub async fn propose(&self, command: impl Into<Bytes>) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ClientRequest::Propose {
                command: command.into(),
                reply,
            })
            .await
            .map_err(|_| AccordError::Shutdown)?;
        rx.await.map_err(|_| AccordError::Shutdown)?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ClientRequest::Status { reply })
            .await
            .map_err(|_| AccordError::Shutdown)?;
        rx.await.map_err(|_| AccordError::Shutdown)
    }

    /// Stops the node task. Outstanding proposals fail with `Shutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ClientRequest::Shutdown { reply })
            .await
            .map_err(|_| AccordError::Shutdown)?;
        rx.await.map_err(|_| AccordError::Shutdown)
    }
}

/// The event loop owning one node
pub struct RaftServer {
    node: RaftNode,
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<InboundRpc>,
    requests: mpsc::Receiver<ClientRequest>,
    replies_tx: mpsc::Sender<PeerReply>,
    replies_rx: mpsc::Receiver<PeerReply>,
    election_timer: Timer,
    heartbeat_timer: Timer,
    /// Peers with an AppendEntries still outstanding
    in_flight: HashSet<NodeId>,
    /// Proposals waiting to be applied, by log index
    pending: BTreeMap<LogIndex, (Term, oneshot::Sender<Result<Bytes>>)>,
}

impl RaftServer {
    /// Starts the node task and returns a handle to it
    pub fn spawn(
        node: RaftNode,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<InboundRpc>,
    ) -> RaftHandle {
        let (requests_tx, requests) = mpsc::channel(CLIENT_QUEUE);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_QUEUE);
        let handle = RaftHandle {
            id: node.id().clone(),
            requests: requests_tx,
        };

        let server = Self {
            node,
            transport,
            inbox,
            requests,
            replies_tx,
            replies_rx,
            election_timer: Timer::new(),
            heartbeat_timer: Timer::new(),
            in_flight: HashSet::new(),
            pending: BTreeMap::new(),
        };
        tokio::spawn(server.run());
        handle
    }

    async fn run(mut self) {
        tracing::info!(node = %self.node.id(), term = self.node.current_term(), "Node started");
        self.arm_election_timer();

        loop {
            let role_before = self.node.role();

            tokio::select! {
                Some(rpc) = self.inbox.recv() => self.handle_inbound(rpc),
                Some(reply) = self.replies_rx.recv() => self.handle_peer_reply(reply),
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_client(request) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.election_timer.fired() => self.handle_election_timeout(),
                _ = self.heartbeat_timer.fired() => self.handle_heartbeat_tick(),
            }

            self.after_event(role_before);
        }

        self.fail_pending(|| AccordError::Shutdown);
        tracing::info!(node = %self.node.id(), "Node stopped");
    }

    fn arm_election_timer(&mut self) {
        let config = self.node.config();
        let timeout =
            random_election_timeout(config.election_timeout_min, config.election_timeout_max);
        self.election_timer.arm(timeout);
    }

    //
    // Event handlers
    //

    fn handle_inbound(&mut self, rpc: InboundRpc) {
        let InboundRpc {
            from,
            request,
            reply,
        } = rpc;

        let handled = match request {
            RpcRequest::RequestVote(req) => self
                .node
                .handle_request_vote(&req)
                .map(|h| (RpcResponse::RequestVote(h.reply), h.reset_election_timer)),
            RpcRequest::AppendEntries(req) => self
                .node
                .handle_append_entries(&req)
                .map(|h| (RpcResponse::AppendEntries(h.reply), h.reset_election_timer)),
        };

        match handled {
            Ok((response, reset)) => {
                if reset {
                    self.arm_election_timer();
                }
                let _ = reply.send(response);
            }
            Err(e) => {
                // No reply: the sender treats it as a lost message and retries
                tracing::warn!(node = %self.node.id(), peer = %from, error = %e, "Dropping RPC");
            }
        }
    }

    fn handle_peer_reply(&mut self, reply: PeerReply) {
        let PeerReply {
            peer,
            request,
            result,
        } = reply;

        if matches!(request, RpcRequest::AppendEntries(_)) {
            self.in_flight.remove(&peer);
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(node = %self.node.id(), peer = %peer, error = %e, "RPC failed");
                return;
            }
        };

        let outcome = match (request, response) {
            (RpcRequest::RequestVote(req), RpcResponse::RequestVote(resp)) => {
                self.node.handle_vote_response(&peer, req.term, &resp)
            }
            (RpcRequest::AppendEntries(req), RpcResponse::AppendEntries(resp)) => {
                self.node.handle_append_response(&peer, &req, &resp)
            }
            _ => {
                tracing::warn!(
                    node = %self.node.id(),
                    peer = %peer,
                    "Response kind does not match request"
                );
                Ok(())
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(
                node = %self.node.id(),
                peer = %peer,
                error = %e,
                "Failed to handle reply"
            );
        }
    }

    /// Returns `false` once the node has been asked to stop
    fn handle_client(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Propose { command, reply } => match self.node.propose(command) {
                Ok((index, term)) => {
                    self.pending.insert(index, (term, reply));
                    self.broadcast_append();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ClientRequest::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            ClientRequest::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_election_timeout(&mut self) {
        if self.node.role() == NodeRole::Leader {
            return;
        }
        // Re-armed first so a failed attempt is retried after a fresh timeout
        self.arm_election_timer();

        match self.node.start_election() {
            Ok(request) => {
                for peer in self.node.peers().to_vec() {
                    self.dispatch(peer, RpcRequest::RequestVote(request.clone()));
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.node.id(), error = %e, "Could not start election");
            }
        }
    }

    fn handle_heartbeat_tick(&mut self) {
        if self.node.role() != NodeRole::Leader {
            return;
        }
        self.broadcast_append();
        self.heartbeat_timer.arm(self.node.config().heartbeat_interval);
    }

    //
    // Outbound RPCs
    //

    /// Sends each idle peer whatever it is missing, or a heartbeat
    fn broadcast_append(&mut self) {
        for peer in self.node.peers().to_vec() {
            if self.in_flight.contains(&peer) {
                continue;
            }
            if let Some(request) = self.node.replication_request(&peer) {
                self.in_flight.insert(peer.clone());
                self.dispatch(peer, RpcRequest::AppendEntries(request));
            }
        }
    }

    fn dispatch(&self, peer: NodeId, request: RpcRequest) {
        let transport = Arc::clone(&self.transport);
        let replies = self.replies_tx.clone();
        let timeout = self.node.config().rpc_timeout;

        tokio::spawn(async move {
            let send = transport.send(&peer, request.clone());
            let result = match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = replies
                .send(PeerReply {
                    peer,
                    request,
                    result,
                })
                .await;
        });
    }

    //
    // Bookkeeping after each event
    //

    fn after_event(&mut self, role_before: NodeRole) {
        let applied = self.node.apply_committed();
        self.resolve_pending(applied);

        let role = self.node.role();
        if role == NodeRole::Leader {
            self.election_timer.cancel();
            if role_before != NodeRole::Leader {
                self.heartbeat_timer.arm(self.node.config().heartbeat_interval);
                self.broadcast_append();
            }
        } else {
            self.heartbeat_timer.cancel();
            if role_before == NodeRole::Leader {
                self.fail_pending(|| AccordError::LeadershipLost);
            }
            if !self.election_timer.is_armed() {
                self.arm_election_timer();
            }
        }
    }

    fn resolve_pending(&mut self, applied: Vec<Applied>) {
        for entry in applied {
            let Some((term, reply)) = self.pending.remove(&entry.index) else {
                continue;
            };
            // A different term at this index means our entry was overwritten
            let result = if term == entry.term {
                Ok(entry.result.unwrap_or_default())
            } else {
                Err(AccordError::LeadershipLost)
            };
            let _ = reply.send(result);
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> AccordError) {
        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error()));
        }
    }
}
