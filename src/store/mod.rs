//! # Stage: Event Store
//!
//! ## Responsibility
//! Append-only, idempotent log of exposure and conversion events, keyed by
//! `(test id, subject id)`. The async [`EventStore`] front owns the dedup
//! index and lifecycle checks; durable writes go through a pluggable
//! synchronous [`EventBackend`] (in-memory for tests and embedding, sqlite
//! for the admin CLI). The store — not the bucketing function — is the
//! durable source of truth for which arm a subject is actually in.
//!
//! ## Guarantees
//! - At most one exposure per `(test, subject)`; the first recorded variant
//!   is permanent even if re-bucketing would later compute a different one
//! - At most one conversion per `(test, subject)`, and only after exposure
//! - Check-and-commit is atomic under one lock: two rapid duplicate calls
//!   (a double-click) cannot both pass the "no existing record" check
//! - A failed write is retried once, then surfaced as
//!   [`SplitError::Persistence`]; the dedup index is only updated after a
//!   durable commit, so a failed retry never fakes an existing record
//! - Writes against a stopped test are rejected with
//!   [`SplitError::TestStopped`] — a stopped test's sample is frozen
//!
//! ## NOT Responsible For
//! - Assigning variants (bucketing) or aggregating counts (aggregator)
//! - Test definitions and lifecycle transitions (registry; only consulted)

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::SplitError;
use crate::registry::{now_ms, TestRegistry};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The two kinds of events the log records. A closed enum — the compiler
/// enforces exhaustive handling everywhere events are consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The subject was shown its variant.
    Exposure,
    /// The subject completed the tracked goal action, with an optional
    /// monetary (or other) value.
    Conversion { value: Option<f64> },
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Exposure => write!(f, "exposure"),
            EventKind::Conversion { .. } => write!(f, "conversion"),
        }
    }
}

/// One appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub test_id: String,
    pub subject_id: String,
    pub variant_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at_ms: u64,
}

// ---------------------------------------------------------------------------
// EventBackend
// ---------------------------------------------------------------------------

/// Synchronous append-only storage behind the async store front.
///
/// Implementations only persist and load; idempotence and lifecycle rules
/// live in [`EventStore`]. Swap in a different transport by implementing
/// this trait.
pub trait EventBackend: Send {
    /// Durably append one event. A returned error means the event may not
    /// have been recorded; the caller decides whether to retry.
    fn append(&mut self, event: &EventRecord) -> Result<(), SplitError>;

    /// Load events in append order — all of them, or one test's.
    fn load(&mut self, test_id: Option<&str>) -> Result<Vec<EventRecord>, SplitError>;
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

/// Per-subject state derived from the log. `variant_id` is the arm the
/// subject was first exposed to; it never changes.
#[derive(Debug, Clone)]
struct SubjectState {
    variant_id: String,
    converted: bool,
}

struct StoreInner {
    backend: Box<dyn EventBackend>,
    /// test id → subject id → state. The idempotence check reads this map
    /// under the same lock that guards the backend write.
    index: HashMap<String, HashMap<String, SubjectState>>,
}

/// Async front over the event log. Cheap to share via `Arc`; all methods
/// take `&self`.
pub struct EventStore {
    registry: Arc<TestRegistry>,
    inner: Mutex<StoreInner>,
}

impl EventStore {
    /// A store over an empty backend.
    pub fn new(registry: Arc<TestRegistry>, backend: Box<dyn EventBackend>) -> Self {
        Self {
            registry,
            inner: Mutex::new(StoreInner {
                backend,
                index: HashMap::new(),
            }),
        }
    }

    /// Open a store over a backend that may already hold events (a sqlite
    /// file from a previous run): the dedup index is rebuilt from the log
    /// so idempotence survives process restarts.
    pub fn open(
        registry: Arc<TestRegistry>,
        mut backend: Box<dyn EventBackend>,
    ) -> Result<Self, SplitError> {
        let events = backend.load(None)?;
        let mut index: HashMap<String, HashMap<String, SubjectState>> = HashMap::new();
        for event in &events {
            let subjects = index.entry(event.test_id.clone()).or_default();
            match &event.kind {
                EventKind::Exposure => {
                    subjects
                        .entry(event.subject_id.clone())
                        .or_insert_with(|| SubjectState {
                            variant_id: event.variant_id.clone(),
                            converted: false,
                        });
                }
                EventKind::Conversion { .. } => {
                    if let Some(state) = subjects.get_mut(&event.subject_id) {
                        state.converted = true;
                    }
                }
            }
        }
        tracing::debug!(events = events.len(), "event store index rehydrated");
        Ok(Self {
            registry,
            inner: Mutex::new(StoreInner { backend, index }),
        })
    }

    /// Record an exposure for `(test_id, subject_id)`.
    ///
    /// Returns `Ok(true)` if a new event was committed, `Ok(false)` for the
    /// idempotent no-op (the subject is already exposed — its original arm
    /// stands, whatever `variant_id` says now).
    pub async fn record_exposure(
        &self,
        test_id: &str,
        subject_id: &str,
        variant_id: &str,
    ) -> Result<bool, SplitError> {
        let mut inner = self.inner.lock().await;
        self.check_accepts_events(test_id)?;

        if inner
            .index
            .get(test_id)
            .is_some_and(|subjects| subjects.contains_key(subject_id))
        {
            tracing::debug!(test_id, subject_id, "duplicate exposure ignored");
            return Ok(false);
        }

        let event = EventRecord {
            id: Uuid::new_v4(),
            test_id: test_id.to_string(),
            subject_id: subject_id.to_string(),
            variant_id: variant_id.to_string(),
            kind: EventKind::Exposure,
            at_ms: now_ms(),
        };
        append_with_retry(inner.backend.as_mut(), &event)?;

        inner
            .index
            .entry(event.test_id)
            .or_default()
            .insert(
                event.subject_id,
                SubjectState {
                    variant_id: event.variant_id,
                    converted: false,
                },
            );
        Ok(true)
    }

    /// Record a conversion for `(test_id, subject_id)`.
    ///
    /// The conversion is attributed to the variant the subject was exposed
    /// to — the log, not the caller, knows the arm. Returns `Ok(true)` when
    /// committed, `Ok(false)` for the idempotent duplicate no-op, and
    /// [`SplitError::OrphanConversion`] when the subject was never exposed.
    pub async fn record_conversion(
        &self,
        test_id: &str,
        subject_id: &str,
        value: Option<f64>,
    ) -> Result<bool, SplitError> {
        let mut inner = self.inner.lock().await;
        self.check_accepts_events(test_id)?;

        let variant_id = match inner
            .index
            .get(test_id)
            .and_then(|subjects| subjects.get(subject_id))
        {
            None => {
                return Err(SplitError::OrphanConversion {
                    test_id: test_id.to_string(),
                    subject_id: subject_id.to_string(),
                })
            }
            Some(state) if state.converted => {
                tracing::debug!(test_id, subject_id, "duplicate conversion ignored");
                return Ok(false);
            }
            Some(state) => state.variant_id.clone(),
        };

        let event = EventRecord {
            id: Uuid::new_v4(),
            test_id: test_id.to_string(),
            subject_id: subject_id.to_string(),
            variant_id,
            kind: EventKind::Conversion { value },
            at_ms: now_ms(),
        };
        append_with_retry(inner.backend.as_mut(), &event)?;

        // Commit succeeded — only now does the index learn about it.
        if let Some(state) = inner
            .index
            .get_mut(test_id)
            .and_then(|subjects| subjects.get_mut(subject_id))
        {
            state.converted = true;
        }
        Ok(true)
    }

    /// Read-only snapshot stream of one test's events, in append order.
    /// Used by the aggregator.
    pub async fn events_for(
        &self,
        test_id: &str,
    ) -> Result<impl Stream<Item = EventRecord>, SplitError> {
        let mut inner = self.inner.lock().await;
        let events = inner.backend.load(Some(test_id))?;
        Ok(tokio_stream::iter(events))
    }

    /// The arm `(test_id, subject_id)` was durably exposed to, if any.
    pub async fn exposed_variant(&self, test_id: &str, subject_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .index
            .get(test_id)
            .and_then(|subjects| subjects.get(subject_id))
            .map(|state| state.variant_id.clone())
    }

    /// Number of distinct subjects exposed on a test.
    pub async fn distinct_exposed(&self, test_id: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .index
            .get(test_id)
            .map(|subjects| subjects.len() as u64)
            .unwrap_or(0)
    }

    fn check_accepts_events(&self, test_id: &str) -> Result<(), SplitError> {
        match self.registry.is_active(test_id) {
            None => Err(SplitError::Configuration(format!(
                "unknown test '{test_id}'"
            ))),
            Some(false) => Err(SplitError::TestStopped(test_id.to_string())),
            Some(true) => Ok(()),
        }
    }
}

/// One retry, then surface the failure. The warning fires on the first
/// failure so a flaky-but-recovering backend is still visible in logs.
fn append_with_retry(
    backend: &mut dyn EventBackend,
    event: &EventRecord,
) -> Result<(), SplitError> {
    match backend.append(event) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(
                test_id = %event.test_id,
                subject_id = %event.subject_id,
                kind = %event.kind,
                error = %first,
                "event append failed, retrying once"
            );
            backend.append(event).map_err(|second| {
                SplitError::Persistence(format!(
                    "append failed after retry: {second} (first failure: {first})"
                ))
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
