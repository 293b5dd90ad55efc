//! Append-only buffer of pump events awaiting reconciliation.

use std::collections::HashSet;
use std::path::Path;

use uuid::Uuid;

use crate::wal::{self, EventJournal, JsonlJournal, NullJournal};
use crate::{PendingEvent, Result};

/// Pending pump events, mirrored to a journal on every change
pub struct PendingEventLog {
    events: Vec<PendingEvent>,
    journal: Box<dyn EventJournal>,
}

impl std::fmt::Debug for PendingEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEventLog")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Default for PendingEventLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PendingEventLog {
    /// A log with no durable journal
    pub fn in_memory() -> Self {
        Self::with_journal(Box::new(NullJournal), Vec::new())
    }

    pub fn with_journal(journal: Box<dyn EventJournal>, events: Vec<PendingEvent>) -> Self {
        Self { events, journal }
    }

    /// Reload unreconciled events from a JSONL journal and keep appending to it
    pub fn restore(path: &Path) -> Result<Self> {
        let events = wal::read_events(path)?;
        if !events.is_empty() {
            tracing::info!(
                "Restored {} unreconciled pump events from {:?}",
                events.len(),
                path
            );
        }
        Ok(Self::with_journal(Box::new(JsonlJournal::new(path)), events))
    }

    /// Append an event for an action the device has already taken
    ///
    /// The event is kept in memory even when the journal rejects it, so the
    /// next reconciliation still reports it. The journal error is returned.
    pub fn append(&mut self, event: PendingEvent) -> Result<()> {
        let journaled = self.journal.append(&event);
        self.events.push(event);
        journaled
    }

    pub fn events(&self) -> &[PendingEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remove the events whose identity is in `ids`, keeping anything newer
    ///
    /// Returns the number of events removed.
    pub fn remove_reconciled(&mut self, ids: &HashSet<Uuid>) -> Result<usize> {
        let remaining: Vec<PendingEvent> = self
            .events
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .cloned()
            .collect();
        let removed = self.events.len() - remaining.len();

        self.journal.rewrite(&remaining)?;
        self.events = remaining;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DoseEntry;
    use chrono::Utc;

    fn event(units: f64) -> PendingEvent {
        let now = Utc::now();
        PendingEvent::from_dose(DoseEntry::bolus(units, now, 1.5).unwrap(), now)
    }

    #[test]
    fn test_remove_reconciled_keeps_newer_events() {
        let mut log = PendingEventLog::in_memory();
        let first = event(1.0);
        let second = event(2.0);
        log.append(first.clone()).unwrap();
        log.append(second.clone()).unwrap();

        let ids: HashSet<_> = [first.id].into_iter().collect();
        assert_eq!(log.remove_reconciled(&ids).unwrap(), 1);
        assert_eq!(log.events(), &[second]);
    }

    #[test]
    fn test_restore_from_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pending.wal");

        {
            let mut log = PendingEventLog::restore(&path).unwrap();
            assert!(log.is_empty());
            log.append(event(1.0)).unwrap();
            log.append(event(3.0)).unwrap();
        }

        let mut log = PendingEventLog::restore(&path).unwrap();
        assert_eq!(log.len(), 2);

        let ids: HashSet<_> = log.events().iter().map(|e| e.id).collect();
        log.remove_reconciled(&ids).unwrap();

        let log = PendingEventLog::restore(&path).unwrap();
        assert!(log.is_empty());
    }
}
