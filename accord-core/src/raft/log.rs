use accord_common::error::{AccordError, Result};
use accord_common::types::{LogIndex, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,       // Term number when entry was received by leader
    pub index: LogIndex,  // Position in the log, starting at 1
    pub kind: EntryKind,  // How the state machine treats the entry
    pub command: Bytes,   // Opaque payload
}

/// Type of log entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    Command, // Handed to the state machine once committed
    Noop,    // Appended by a fresh leader, never applied
}

impl LogEntry {
    pub fn command(term: Term, index: LogIndex, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            command: command.into(),
        }
    }

    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Noop,
            command: Bytes::new(),
        }
    }
}

/// The replicated log held by one node. Entries are dense: the entry at
/// position `i` of `entries` always has index `i + 1`.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a log from persisted entries, checking that indexes are dense.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return Err(AccordError::Storage(format!(
                    "log entry at position {} has index {}",
                    pos + 1,
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Append a new entry at the tail, returning its index
    pub fn append(&mut self, term: Term, kind: EntryKind, command: Bytes) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            kind,
            command,
        });
        index
    }

    /// Get a specific log entry by Raft log index
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        self.entries[(index - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Remove the entry at `index` and everything after it
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// Whether a log ending at (`last_term`, `last_index`) is at least as
    /// up-to-date as this one: later term wins, equal terms compare length.
    pub fn is_up_to_date(&self, last_term: Term, last_index: LogIndex) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    /// Follower-side merge of a leader's entries following `prev_log_index`.
    ///
    /// Entries already present with a matching term are skipped, the first
    /// conflicting entry truncates the rest of the log, and whatever remains
    /// is appended. The caller has already checked `prev_log_index`.
    /// Returns whether the log changed.
    pub fn merge(&mut self, prev_log_index: LogIndex, entries: &[LogEntry]) -> Result<bool> {
        for (offset, entry) in entries.iter().enumerate() {
            let expected = prev_log_index + offset as u64 + 1;
            if entry.index != expected {
                return Err(AccordError::Consensus(format!(
                    "entry index {} does not follow {}",
                    entry.index,
                    expected - 1
                )));
            }
        }

        let mut changed = false;
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflict: drop this entry and everything after it
                    self.truncate_from(entry.index);
                    self.entries.push(entry.clone());
                    changed = true;
                }
                None => {
                    self.entries.push(entry.clone());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for term in terms {
            log.append(*term, EntryKind::Command, Bytes::from(vec![*term as u8]));
        }
        log
    }

    #[test]
    fn test_append_and_get_entry() {
        let mut log = RaftLog::new();
        let index = log.append(1, EntryKind::Command, Bytes::from_static(&[1, 2, 3]));

        assert_eq!(index, 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.get(1).unwrap().command, Bytes::from_static(&[1, 2, 3]));
        assert!(log.get(0).is_none());
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_term_at_index_zero_is_zero() {
        let log = RaftLog::new();
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn test_from_entries_rejects_gaps() {
        let entries = vec![LogEntry::command(1, 1, "a"), LogEntry::command(1, 3, "c")];
        assert!(RaftLog::from_entries(entries).is_err());
    }

    #[test]
    fn test_entries_from_respects_max() {
        let log = log_with_terms(&[1, 1, 2, 3]);
        let batch = log.entries_from(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
        assert!(log.entries_from(5, 10).is_empty());
    }

    #[test]
    fn test_up_to_date_compares_term_then_index() {
        let log = log_with_terms(&[1, 2, 2]);
        assert!(log.is_up_to_date(3, 1));
        assert!(log.is_up_to_date(2, 3));
        assert!(log.is_up_to_date(2, 4));
        assert!(!log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 10));
    }

    #[test]
    fn test_merge_truncates_conflicting_suffix() {
        let mut log = log_with_terms(&[1, 1, 1]);
        let incoming = vec![LogEntry::command(2, 2, "x")];

        assert!(log.merge(1, &incoming).unwrap());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.get(2).unwrap().command, Bytes::from_static(b"x"));
    }

    #[test]
    fn test_merge_keeps_entries_beyond_a_stale_batch() {
        let mut log = log_with_terms(&[1, 1, 1]);
        // A delayed request carrying only the first two entries must not
        // cut off the third.
        let incoming = log.entries_from(1, 2);

        assert!(!log.merge(0, &incoming).unwrap());
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut log = log_with_terms(&[1]);
        let incoming = vec![LogEntry::command(1, 2, "b"), LogEntry::command(1, 3, "c")];

        assert!(log.merge(1, &incoming).unwrap());
        let after_first = log.entries().to_vec();
        assert!(!log.merge(1, &incoming).unwrap());
        assert_eq!(log.entries(), &after_first[..]);
    }

    #[test]
    fn test_merge_rejects_misnumbered_entries() {
        let mut log = log_with_terms(&[1]);
        let incoming = vec![LogEntry::command(1, 3, "c")];

        assert!(log.merge(1, &incoming).is_err());
        assert_eq!(log.last_index(), 1);
    }
}
