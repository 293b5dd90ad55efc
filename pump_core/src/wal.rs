//! Write-Ahead Log (WAL) for unreconciled pump events.
//!
//! Pending events are appended to a JSONL (JSON Lines) file with file locking
//! so delivery history survives a restart before reconciliation. Once the
//! delegate acknowledges events the file is rewritten with what remains.

use crate::{PendingEvent, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Durable storage behind the pending event log
///
/// Journal calls run synchronously on the command task while the manager
/// lock is held, so every other command waits on them. Implementations must
/// return promptly; a journal backed by slow storage should buffer and flush
/// on its own thread.
pub trait EventJournal: Send {
    fn append(&mut self, event: &PendingEvent) -> Result<()>;

    /// Replace the journal contents with `events`
    fn rewrite(&mut self, events: &[PendingEvent]) -> Result<()>;
}

/// Journal that keeps nothing; used when the host persists events itself
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJournal;

impl EventJournal for NullJournal {
    fn append(&mut self, _event: &PendingEvent) -> Result<()> {
        Ok(())
    }

    fn rewrite(&mut self, _events: &[PendingEvent]) -> Result<()> {
        Ok(())
    }
}

/// JSONL-based event journal with file locking
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    /// Create a new JSONL journal for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl EventJournal for JsonlJournal {
    fn append(&mut self, event: &PendingEvent) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(event)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.sync_data()?;
        file.unlock()?;

        tracing::debug!("Appended {:?} event {} to WAL", event.kind, event.id);
        Ok(())
    }

    fn rewrite(&mut self, events: &[PendingEvent]) -> Result<()> {
        self.ensure_parent_dir()?;

        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "journal path missing parent")
        })?;
        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for event in events {
                let line = serde_json::to_string(event)?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;
        temp.persist(&self.path)
            .map_err(|e| crate::Error::Io(e.error))?;

        tracing::debug!("Rewrote WAL with {} pending events", events.len());
        Ok(())
    }
}

/// Read all pending events from a WAL file
pub fn read_events(path: &Path) -> Result<Vec<PendingEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut events = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<PendingEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                // A torn final write should not hide the events before it
                tracing::warn!("Failed to parse pending event at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} pending events from WAL", events.len());
    Ok(events)
}
