use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccordError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),

    #[error("Not the leader, last known leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Leadership lost before the entry was committed")]
    LeadershipLost,

    #[error("Node is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, AccordError>;

impl From<bincode::Error> for AccordError {
    fn from(err: bincode::Error) -> Self {
        AccordError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_message_names_leader() {
        let err = AccordError::NotLeader {
            leader: Some("node-2".into()),
        };
        assert!(err.to_string().contains("node-2"));
    }

    #[test]
    fn test_bincode_error_maps_to_codec() {
        let err: AccordError = bincode::deserialize::<u64>(&[1, 2])
            .map_err(AccordError::from)
            .unwrap_err();
        assert!(matches!(err, AccordError::Codec(_)));
    }
}
