// Replicated log consensus: election, replication and the node event loop
pub mod config;
pub mod log;
pub mod network;
pub mod node;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod storage;
pub mod timer;
pub mod transport;

pub use config::RaftConfig;
pub use log::{EntryKind, LogEntry, RaftLog};
pub use network::{InMemoryNetwork, InboundRpc, NetworkTransport};
pub use node::{Applied, Handled, NodeRole, NodeStatus, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    RpcRequest, RpcResponse,
};
pub use server::{RaftHandle, RaftServer};
pub use state_machine::{KeyValueStore, KvCommand, KvResponse, RecordingStateMachine, StateMachine};
pub use storage::{FileStorage, HardState, MemoryStorage, Storage};
pub use transport::{Transport, TransportError};
