use crate::error::{AccordError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Static description of a consensus group, shared by every member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: Vec<NodeId>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Append an empty entry when a leader is elected so entries from
    /// earlier terms commit without waiting for a client command.
    #[serde(default)]
    pub leader_noop: bool,
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
    /// Where each member keeps its durable state. In-memory when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_max_append_entries() -> usize {
    64
}

impl ClusterConfig {
    /// A config with default timings for the given members.
    pub fn with_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            leader_noop: false,
            max_append_entries: default_max_append_entries(),
            data_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(AccordError::Config("cluster has no members".into()));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if member.is_empty() {
                return Err(AccordError::Config("member id must not be empty".into()));
            }
            if !seen.insert(member) {
                return Err(AccordError::Config(format!("duplicate member {}", member)));
            }
        }

        if self.election_timeout_min_ms == 0
            || self.heartbeat_interval_ms == 0
            || self.rpc_timeout_ms == 0
        {
            return Err(AccordError::Config("timeouts must be non-zero".into()));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(AccordError::Config(format!(
                "election timeout range is empty: {}..={}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        // Followers must hear from the leader before any of them times out.
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(AccordError::Config(format!(
                "heartbeat interval {}ms must be shorter than the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        // A peer with an outstanding RPC gets no heartbeat until it times out.
        if self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return Err(AccordError::Config(format!(
                "rpc timeout {}ms must be shorter than the minimum election timeout {}ms",
                self.rpc_timeout_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_append_entries == 0 {
            return Err(AccordError::Config("max_append_entries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
