//! In-memory event backend.
//!
//! The default backend for embedding and tests: a plain append-ordered
//! `Vec`, isolated per instance, nothing shared. Durability here means
//! "for the lifetime of the process" — pick the sqlite backend when events
//! must survive restarts.

use super::{EventBackend, EventRecord};
use crate::error::SplitError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    events: Vec<EventRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events held.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventBackend for MemoryBackend {
    fn append(&mut self, event: &EventRecord) -> Result<(), SplitError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn load(&mut self, test_id: Option<&str>) -> Result<Vec<EventRecord>, SplitError> {
        Ok(match test_id {
            None => self.events.clone(),
            Some(id) => self
                .events
                .iter()
                .filter(|e| e.test_id == id)
                .cloned()
                .collect(),
        })
    }
}
