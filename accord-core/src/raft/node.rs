use super::config::RaftConfig;
use super::log::{EntryKind, RaftLog};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::state_machine::StateMachine;
use super::storage::{HardState, Storage};
use accord_common::error::{AccordError, Result};
use accord_common::types::{LogIndex, NodeId, Term};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// A handler's reply plus whether the message counts as contact from a
/// legitimate leader (or a granted vote), which re-arms the election timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<T> {
    pub reply: T,
    pub reset_election_timer: bool,
}

/// An entry handed to the state machine. `result` is `None` for no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: Option<Bytes>,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// A Raft node: controls its own state and participates in consensus.
///
/// The node does no I/O of its own apart from its storage and state
/// machine; callers feed it RPCs, replies and timer expiries one at a time
/// and ship the requests it produces.
pub struct RaftNode {
    config: RaftConfig,
    storage: Box<dyn Storage>,
    state_machine: Box<dyn StateMachine>,

    // persistent
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
    dirty: bool,

    // volatile
    role: NodeRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    votes_received: HashSet<NodeId>,

    // leader only, reset on every election win
    next_index: HashMap<NodeId, LogIndex>, // For each peer: next entry to send
    match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated
}

impl RaftNode {
    /// Create a node from whatever its storage holds. Always starts as Follower.
    pub fn new(
        config: RaftConfig,
        storage: Box<dyn Storage>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        let HardState {
            current_term,
            voted_for,
            log,
        } = storage.load()?;
        let log = RaftLog::from_entries(log)?;

        tracing::info!(
            node = %config.id,
            term = current_term,
            last_index = log.last_index(),
            "Loaded persistent state"
        );

        Ok(Self {
            config,
            storage,
            state_machine,
            current_term,
            voted_for,
            log,
            dirty: false,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.config.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn next_index(&self, peer: &str) -> Option<LogIndex> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index(&self, peer: &str) -> Option<LogIndex> {
        self.match_index.get(peer).copied()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.config.id.clone(),
            role: self.role,
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            leader_id: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    //
    // Persistence
    //

    /// Writes term, vote and log if anything changed since the last write.
    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.entries().to_vec(),
        };
        if let Err(e) = self.storage.save(&state) {
            tracing::warn!(node = %self.config.id, error = %e, "Failed to persist state");
            return Err(e);
        }
        self.dirty = false;
        Ok(())
    }

    //
    // Role transitions
    //

    /// Adopt a newer term: forget the old vote and follow.
    fn step_down(&mut self, term: Term) {
        tracing::info!(
            node = %self.config.id,
            from_term = self.current_term,
            term,
            role = ?self.role,
            "Observed newer term, becoming follower"
        );
        self.current_term = term;
        self.voted_for = None;
        self.dirty = true;
        self.become_follower();
    }

    fn become_follower(&mut self) {
        self.role = NodeRole::Follower;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Starts an election: bumps the term, votes for itself and returns the
    /// request to send to every peer. A single-member cluster wins at once.
    pub fn start_election(&mut self) -> Result<RequestVoteRequest> {
        self.become_follower();
        self.role = NodeRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.config.id.clone());
        self.votes_received.insert(self.config.id.clone());
        self.dirty = true;
        self.flush()?;

        tracing::info!(
            node = %self.config.id,
            term = self.current_term,
            last_index = self.log.last_index(),
            "Starting election"
        );

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.config.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        if self.votes_received.len() >= self.config.quorum() {
            self.become_leader()?;
        }
        Ok(request)
    }

    /// Transition to leader role once a quorum has voted for this term
    fn become_leader(&mut self) -> Result<()> {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.config.id.clone());
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        self.next_index = self.config.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.config.peers.iter().map(|p| (p.clone(), 0)).collect();

        tracing::info!(
            node = %self.config.id,
            term = self.current_term,
            last_index = self.log.last_index(),
            "Became leader"
        );

        if self.config.leader_noop {
            self.log.append(self.current_term, EntryKind::Noop, Bytes::new());
            self.dirty = true;
            self.flush()?;
            self.advance_commit_index();
        }
        Ok(())
    }

    //
    // Election
    //

    /// Handles RequestVote from a candidate, in any role
    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteRequest,
    ) -> Result<Handled<RequestVoteResponse>> {
        if req.term > self.current_term {
            self.step_down(req.term);
        }

        let vote_granted = if req.term < self.current_term {
            false
        } else if self.voted_for.is_some() && self.voted_for.as_ref() != Some(&req.candidate_id) {
            // Already voted for someone else in this term
            false
        } else if !self.log.is_up_to_date(req.last_log_term, req.last_log_index) {
            false
        } else {
            if self.voted_for.is_none() {
                self.voted_for = Some(req.candidate_id.clone());
                self.dirty = true;
            }
            true
        };

        self.flush()?;

        tracing::debug!(
            node = %self.config.id,
            candidate = %req.candidate_id,
            term = req.term,
            granted = vote_granted,
            "RequestVote handled"
        );

        Ok(Handled {
            reply: RequestVoteResponse {
                term: self.current_term,
                vote_granted,
            },
            reset_election_timer: vote_granted,
        })
    }

    /// Handles a peer's answer to the RequestVote sent in `request_term`
    pub fn handle_vote_response(
        &mut self,
        from: &NodeId,
        request_term: Term,
        resp: &RequestVoteResponse,
    ) -> Result<()> {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return self.flush();
        }

        if self.role != NodeRole::Candidate || request_term != self.current_term {
            tracing::debug!(
                node = %self.config.id,
                peer = %from,
                request_term,
                "Ignoring stale vote"
            );
            return Ok(());
        }

        if resp.vote_granted {
            self.votes_received.insert(from.clone());
            tracing::debug!(
                node = %self.config.id,
                peer = %from,
                votes = self.votes_received.len(),
                "Received vote"
            );
            if self.votes_received.len() >= self.config.quorum() {
                self.become_leader()?;
            }
        }
        Ok(())
    }

    //
    // Log replication (follower side)
    //

    /// Handles AppendEntries from a leader, in any role
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<Handled<AppendEntriesResponse>> {
        // 1. Reject if term is older; never mutates state
        if req.term < self.current_term {
            return Ok(Handled {
                reply: AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: self.log.last_index(),
                },
                reset_election_timer: false,
            });
        }

        // 2. Follow the sender
        if req.term > self.current_term {
            self.step_down(req.term);
        } else if self.role != NodeRole::Follower {
            if self.role == NodeRole::Leader {
                tracing::error!(
                    node = %self.config.id,
                    other = %req.leader_id,
                    term = req.term,
                    "Another leader in the same term"
                );
            }
            self.become_follower();
        }
        self.leader_id = Some(req.leader_id.clone());

        // 3. Validate previous entry consistency
        let consistent = self.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
        if !consistent {
            self.flush()?;
            tracing::debug!(
                node = %self.config.id,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                last_index = self.log.last_index(),
                "Log inconsistency, rejecting entries"
            );
            let hint = self.log.last_index().min(req.prev_log_index.saturating_sub(1));
            return Ok(Handled {
                reply: AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: hint,
                },
                reset_election_timer: true,
            });
        }

        // 4. Append new entries (overwrite conflicting entries)
        if self.log.merge(req.prev_log_index, &req.entries)? {
            self.dirty = true;
        }
        self.flush()?;

        // 5. Update commit index, bounded by what this request vouched for
        let matched = req.last_index();
        let leader_commit = req.leader_commit.min(matched);
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit;
            tracing::debug!(
                node = %self.config.id,
                commit_index = self.commit_index,
                "Follower commit advanced"
            );
        }

        Ok(Handled {
            reply: AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: matched,
            },
            reset_election_timer: true,
        })
    }

    //
    // Log replication (leader side)
    //

    /// Called by the leader to append a new client command
    pub fn propose(&mut self, command: Bytes) -> Result<(LogIndex, Term)> {
        if self.role != NodeRole::Leader {
            return Err(AccordError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let index = self.log.append(self.current_term, EntryKind::Command, command);
        self.dirty = true;
        if let Err(e) = self.flush() {
            self.log.truncate_from(index);
            return Err(e);
        }

        tracing::debug!(
            node = %self.config.id,
            index,
            term = self.current_term,
            "Appended new command"
        );
        self.advance_commit_index();
        Ok((index, self.current_term))
    }

    /// The AppendEntries to send `peer` now: the entries from its `nextIndex`
    /// on, or a heartbeat when it is caught up. `None` unless leader.
    pub fn replication_request(&self, peer: &str) -> Option<AppendEntriesRequest> {
        if self.role != NodeRole::Leader {
            return None;
        }
        let next_idx = self
            .next_index
            .get(peer)
            .copied()?
            .clamp(1, self.log.last_index() + 1);

        let prev_log_index = next_idx - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.config.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next_idx, self.config.max_append_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Called when a follower responds to the AppendEntries in `sent`
    pub fn handle_append_response(
        &mut self,
        from: &NodeId,
        sent: &AppendEntriesRequest,
        resp: &AppendEntriesResponse,
    ) -> Result<()> {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return self.flush();
        }

        if self.role != NodeRole::Leader || sent.term != self.current_term {
            tracing::debug!(
                node = %self.config.id,
                peer = %from,
                sent_term = sent.term,
                "Ignoring stale append response"
            );
            return Ok(());
        }

        let Some(next) = self.next_index.get(from).copied() else {
            return Ok(());
        };
        let matched = self.match_index.get(from).copied().unwrap_or(0);

        if resp.success {
            let new_match = matched.max(sent.last_index());
            self.match_index.insert(from.clone(), new_match);
            self.next_index.insert(from.clone(), new_match + 1);
            if new_match > matched {
                tracing::debug!(
                    node = %self.config.id,
                    peer = %from,
                    match_index = new_match,
                    "Follower caught up"
                );
            }
            self.advance_commit_index();
        } else if sent.prev_log_index + 1 == next {
            // Follower rejected: step back one, or straight past the end of
            // a shorter log, but never behind what it already acknowledged
            let mut new_next = next.saturating_sub(1).min(resp.match_index + 1);
            new_next = new_next.max(matched + 1).max(1);
            self.next_index.insert(from.clone(), new_next);
            tracing::debug!(
                node = %self.config.id,
                peer = %from,
                next_index = new_next,
                "Backtracking"
            );
        }
        Ok(())
    }

    /// Commits the highest index stored on a quorum, if it is from this term
    pub fn advance_commit_index(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }

        let mut match_indexes: Vec<LogIndex> = self
            .config
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        match_indexes.push(self.log.last_index()); // include leader's own index
        match_indexes.sort_unstable_by(|a, b| b.cmp(a)); // descending

        let new_commit = match_indexes[self.config.quorum() - 1];

        // Only entries from the current term are committed by counting
        // replicas; earlier ones commit with them.
        if new_commit > self.commit_index && self.log.term_at(new_commit) == Some(self.current_term)
        {
            self.commit_index = new_commit;
            tracing::info!(
                node = %self.config.id,
                term = self.current_term,
                commit_index = self.commit_index,
                "Commit index advanced"
            );
        }
    }

    /// Applies all entries between last_applied..=commit_index to the state machine
    pub fn apply_committed(&mut self) -> Vec<Applied> {
        let mut applied = Vec::new();

        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.get(next) else {
                break;
            };

            let result = match entry.kind {
                EntryKind::Command => Some(self.state_machine.apply(next, &entry.command)),
                EntryKind::Noop => None,
            };
            self.last_applied = next;

            tracing::debug!(
                node = %self.config.id,
                index = next,
                term = entry.term,
                "Applied log entry"
            );
            applied.push(Applied {
                index: next,
                term: entry.term,
                result,
            });
        }
        applied
    }
}
