use super::log::LogEntry;
use accord_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,               // Leader’s term
    pub leader_id: NodeId,        // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,      // Term of that entry
    pub entries: Vec<LogEntry>,   // New log entries to store
    pub leader_commit: LogIndex,  // Leader’s commit index
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request vouches for
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    /// On success, the highest index known to match the leader's stream.
    /// On a consistency failure, the follower's last log index, which the
    /// leader may use to skip backtracking past the end of a short log.
    pub match_index: LogIndex,
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Either RPC, as carried by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

impl RpcRequest {
    pub fn term(&self) -> Term {
        match self {
            RpcRequest::RequestVote(req) => req.term,
            RpcRequest::AppendEntries(req) => req.term,
        }
    }
}

impl RpcResponse {
    pub fn term(&self) -> Term {
        match self {
            RpcResponse::RequestVote(resp) => resp.term,
            RpcResponse::AppendEntries(resp) => resp.term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_append_entries() {
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "leader1".into(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::command(1, 1, "set x")],
            leader_commit: 0,
        };

        let encoded = bincode::serialize(&RpcRequest::AppendEntries(req.clone())).unwrap();
        let decoded: RpcRequest = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded, RpcRequest::AppendEntries(req));
        assert_eq!(decoded.term(), 1);
    }

    #[test]
    fn test_last_index_counts_entries() {
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: "leader1".into(),
            prev_log_index: 4,
            prev_log_term: 1,
            entries: vec![LogEntry::command(2, 5, "a"), LogEntry::command(2, 6, "b")],
            leader_commit: 3,
        };
        assert!(!req.is_heartbeat());
        assert_eq!(req.last_index(), 6);
    }
}
