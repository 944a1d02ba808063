use accord_common::types::LogIndex;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The application that consumes committed commands.
///
/// Every replica applies the same commands in the same order, so `apply`
/// must be deterministic and must not fail on malformed input: a command
/// that cannot be interpreted still produces a (deterministic) result.
pub trait StateMachine: Send {
    /// Applies the committed command at `index` and returns its result
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Bytes;
}

//
// Example Implementation: In-Memory Key-Value Store
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Get(String),
    Delete(String),
}

impl KvCommand {
    pub fn encode(&self) -> Bytes {
        // Serializing a plain enum of strings into a Vec cannot fail
        Bytes::from(bincode::serialize(self).unwrap_or_default())
    }
}

/// Response type returned by the state machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvResponse {
    Value(Option<String>),
    Ack,
    Invalid,
}

impl KvResponse {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// The in-memory key-value store
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn execute(&mut self, command: KvCommand) -> KvResponse {
        match command {
            KvCommand::Set(k, v) => {
                self.data.insert(k, v);
                KvResponse::Ack
            }
            KvCommand::Get(k) => KvResponse::Value(self.data.get(&k).cloned()),
            KvCommand::Delete(k) => {
                self.data.remove(&k);
                KvResponse::Ack
            }
        }
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Bytes {
        let response = match bincode::deserialize::<KvCommand>(command) {
            Ok(cmd) => self.execute(cmd),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable key-value command");
                KvResponse::Invalid
            }
        };
        Bytes::from(bincode::serialize(&response).unwrap_or_default())
    }
}

/// Shared record of applied commands, in apply order
pub type AppliedLog = Arc<Mutex<Vec<(LogIndex, Bytes)>>>;

/// Records every applied command and echoes it back as the result.
#[derive(Debug, Default, Clone)]
pub struct RecordingStateMachine {
    applied: AppliedLog,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to inspect applied commands from outside the node
    pub fn applied(&self) -> AppliedLog {
        Arc::clone(&self.applied)
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Bytes {
        let command = Bytes::copy_from_slice(command);
        if let Ok(mut applied) = self.applied.lock() {
            applied.push((index, command.clone()));
        }
        command
    }
}

//
// Tests
//
#[cfg(test)]
mod tests {
    use super::*;

    fn run(kv: &mut KeyValueStore, index: LogIndex, cmd: KvCommand) -> KvResponse {
        let out = kv.apply(index, &cmd.encode());
        KvResponse::decode(&out).unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let mut kv = KeyValueStore::default();

        // Set a value
        let resp = run(&mut kv, 1, KvCommand::Set("foo".into(), "bar".into()));
        assert_eq!(resp, KvResponse::Ack);

        // Get it
        let resp = run(&mut kv, 2, KvCommand::Get("foo".into()));
        assert_eq!(resp, KvResponse::Value(Some("bar".into())));

        // Delete it
        let resp = run(&mut kv, 3, KvCommand::Delete("foo".into()));
        assert_eq!(resp, KvResponse::Ack);

        // Ensure it's gone
        let resp = run(&mut kv, 4, KvCommand::Get("foo".into()));
        assert_eq!(resp, KvResponse::Value(None));
        assert_eq!(kv.get("foo"), None);
    }

    #[test]
    fn test_garbage_command_is_invalid_not_a_panic() {
        let mut kv = KeyValueStore::default();
        let out = kv.apply(1, &[0xde, 0xad, 0xbe, 0xef, 0xff]);
        assert_eq!(KvResponse::decode(&out), Some(KvResponse::Invalid));
    }

    #[test]
    fn test_recording_state_machine_echoes_and_records() {
        let mut sm = RecordingStateMachine::new();
        let applied = sm.applied();

        let out = sm.apply(7, b"hello");
        assert_eq!(out, Bytes::from_static(b"hello"));
        assert_eq!(
            applied.lock().unwrap().clone(),
            vec![(7, Bytes::from_static(b"hello"))]
        );
    }
}
