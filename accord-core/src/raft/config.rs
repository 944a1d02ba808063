use accord_common::config::ClusterConfig;
use accord_common::error::{AccordError, Result};
use accord_common::types::NodeId;
use std::time::Duration;

/// One member's view of the cluster configuration
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub leader_noop: bool,
    pub max_append_entries: usize,
}

impl RaftConfig {
    /// Builds the config for member `id`, failing if it is not in the cluster
    pub fn for_member(cluster: &ClusterConfig, id: &str) -> Result<Self> {
        cluster.validate()?;
        if !cluster.members.iter().any(|m| m == id) {
            return Err(AccordError::Config(format!("{} is not a cluster member", id)));
        }

        Ok(Self {
            id: id.to_string(),
            peers: cluster.members.iter().filter(|m| *m != id).cloned().collect(),
            election_timeout_min: Duration::from_millis(cluster.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(cluster.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(cluster.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(cluster.rpc_timeout_ms),
            leader_noop: cluster.leader_noop,
            max_append_entries: cluster.max_append_entries,
        })
    }

    /// Number of voting members, including this node
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the full cluster
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_member_excludes_self_from_peers() {
        let cluster = ClusterConfig::with_members(["n1", "n2", "n3"]);
        let config = RaftConfig::for_member(&cluster, "n2").unwrap();

        assert_eq!(config.id, "n2");
        assert_eq!(config.peers, vec!["n1".to_string(), "n3".to_string()]);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_member_is_rejected() {
        let cluster = ClusterConfig::with_members(["n1", "n2", "n3"]);
        assert!(matches!(
            RaftConfig::for_member(&cluster, "n9"),
            Err(AccordError::Config(_))
        ));
    }

    #[test]
    fn test_quorum_uses_full_cluster_size() {
        for (size, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (7, 4)] {
            let members: Vec<String> = (1..=size).map(|i| format!("n{}", i)).collect();
            let cluster = ClusterConfig::with_members(members);
            let config = RaftConfig::for_member(&cluster, "n1").unwrap();
            assert_eq!(config.quorum(), quorum, "cluster of {}", size);
        }
    }
}
