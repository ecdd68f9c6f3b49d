//! Crate-level error taxonomy.
//!
//! Four categories, matching how failures propagate:
//! - [`SplitError::Configuration`] — malformed test/variant definitions.
//!   Fatal, surfaced at creation or load time.
//! - [`SplitError::OrphanConversion`] — conversion without a prior
//!   exposure. Non-fatal at the engine facade: logged and dropped.
//! - [`SplitError::TestStopped`] — write attempted after a test was
//!   stopped. Non-fatal at the engine facade: logged and dropped.
//! - [`SplitError::Persistence`] — storage I/O failure after one retry.
//!   Surfaced to the caller; committed state is never partial.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    /// Malformed test or variant definition, or an unknown test id.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A conversion was reported for a subject that was never exposed.
    #[error("conversion without prior exposure for subject '{subject_id}' on test '{test_id}'")]
    OrphanConversion { test_id: String, subject_id: String },

    /// A write was attempted on a stopped test. Stopped tests are frozen.
    #[error("test '{0}' is stopped and no longer accepts events")]
    TestStopped(String),

    /// The storage backend failed after one retry.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SplitError {
    /// `true` for the non-fatal categories the engine facade logs and drops.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            SplitError::OrphanConversion { .. } | SplitError::TestStopped(_)
        )
    }
}
