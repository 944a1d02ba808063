pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;
