//! # Stage: Aggregator
//!
//! ## Responsibility
//! Fold a test's event stream into one [`ResultRow`] per defined variant:
//! visits, conversions, conversion rate, and summed conversion value.
//!
//! ## Guarantees
//! - Computed fresh from the log on every call — there is no counter that
//!   can drift from the events
//! - Every defined variant gets a row, in definition order, including
//!   variants with zero events (`visits=0`, `conversion_rate=0.0`)
//! - `conversion_rate` is 0.0 when `visits == 0`, never NaN
//!
//! ## NOT Responsible For
//! - Declaring winners (decision engine)
//! - Enforcing idempotence (already guaranteed by the event store)

use std::collections::HashMap;

use serde::Serialize;
use tokio_stream::{Stream, StreamExt};

use crate::registry::Test;
use crate::store::{EventKind, EventRecord};

/// Per-variant aggregate for one test. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub test_id: String,
    pub variant_id: String,
    pub visits: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Sum of the optional per-conversion values (revenue, typically).
    pub conversion_value: f64,
}

/// Fold `events` into result rows for `test`.
///
/// Events referencing a variant that is not (or no longer) defined on the
/// test are logged and excluded — rows always correspond exactly to the
/// defined variant list.
pub async fn compute_results(
    test: &Test,
    events: impl Stream<Item = EventRecord>,
) -> Vec<ResultRow> {
    let mut rows: Vec<ResultRow> = test
        .variants
        .iter()
        .map(|v| ResultRow {
            test_id: test.id.clone(),
            variant_id: v.id.clone(),
            visits: 0,
            conversions: 0,
            conversion_rate: 0.0,
            conversion_value: 0.0,
        })
        .collect();
    let row_index: HashMap<&str, usize> = test
        .variants
        .iter()
        .enumerate()
        .map(|(i, v)| (v.id.as_str(), i))
        .collect();

    let mut orphaned_events = 0u64;
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        let Some(&i) = row_index.get(event.variant_id.as_str()) else {
            orphaned_events += 1;
            continue;
        };
        match event.kind {
            EventKind::Exposure => rows[i].visits += 1,
            EventKind::Conversion { value } => {
                rows[i].conversions += 1;
                rows[i].conversion_value += value.unwrap_or(0.0);
            }
        }
    }
    if orphaned_events > 0 {
        tracing::warn!(
            test_id = %test.id,
            orphaned_events,
            "events reference variants not defined on the test; excluded from results"
        );
    }

    for row in &mut rows {
        if row.visits > 0 {
            row.conversion_rate = row.conversions as f64 / row.visits as f64;
        }
    }
    rows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
