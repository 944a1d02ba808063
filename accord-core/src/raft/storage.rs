use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::log::LogEntry;
use accord_common::error::{AccordError, Result};
use accord_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

/// State that must survive a restart. Written before any reply that
/// depends on it is sent.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// Defines the behavior for any durable state backend.
pub trait Storage: Send {
    /// Durably replace the stored state. Must not return before it is flushed.
    fn save(&mut self, state: &HardState) -> Result<()>;

    /// Load the stored state, or the initial state for a fresh node.
    fn load(&self) -> Result<HardState>;
}

/// Keeps state in memory. Clones share the same cell, so a test can build a
/// fresh node over the storage of a "crashed" one.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<HardState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of what is currently stored
    pub fn snapshot(&self) -> Result<HardState> {
        self.load()
    }
}

impl Storage for MemoryStorage {
    fn save(&mut self, state: &HardState) -> Result<()> {
        let mut stored = self
            .state
            .lock()
            .map_err(|_| AccordError::Storage("memory storage lock poisoned".into()))?;
        *stored = state.clone();
        Ok(())
    }

    fn load(&self) -> Result<HardState> {
        let stored = self
            .state
            .lock()
            .map_err(|_| AccordError::Storage("memory storage lock poisoned".into()))?;
        Ok(stored.clone())
    }
}

/// Saves state as a single bincode file, replaced atomically on each save.
pub struct FileStorage {
    pub path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// Directory holding the state file; `.` for a bare file name
    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// Directories cannot be opened as files elsewhere
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl Storage for FileStorage {
    fn save(&mut self, state: &HardState) -> Result<()> {
        let encoded = bincode::serialize(state)?;
        let dir = self.dir();
        fs::create_dir_all(&dir)?;

        // write to a temp file then rename so a crash never leaves half a state
        let temp = self.temp_path();
        let mut file = File::create(&temp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;

        // the rename itself is only durable once the directory entry is
        sync_dir(&dir)
    }

    fn load(&self) -> Result<HardState> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let state = bincode::deserialize(&bytes)?;
        Ok(state)
    }
}
