//! # Stage: Decision Engine
//!
//! ## Responsibility
//! Given a test's aggregated rows, determine the leading variant under a
//! minimum-sample-size rule, and expose the per-test state machine
//! `InsufficientData -> LeadingCandidate -> WinnerDeclared`.
//!
//! A winner is declared only for a stopped test: the store rejects writes
//! after stop, so a declared winner can never regress. While a test is
//! active the leader may legitimately change as data arrives.
//!
//! ## Guarantees
//! - Below the minimum sample, no winner is reported regardless of
//!   apparent rate
//! - Tie-breaks are deterministic: equal rate → larger visit count (more
//!   evidence) → earliest-defined variant. Never random.
//!
//! This is a descriptive comparison (rate ordering with sample-size
//! gating), not a formal significance test. It makes no confidence claim
//! beyond the minimum-sample gate; treat a declared winner accordingly.

use serde::{Deserialize, Serialize};

use crate::aggregate::ResultRow;
use crate::registry::Test;

// ---------------------------------------------------------------------------
// DecisionConfig
// ---------------------------------------------------------------------------

/// Tunables for the decision rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// A variant is eligible to lead only once its visits reach this count.
    pub min_sample_size: u64,
    /// Required conversion-rate lead over the best other eligible variant
    /// before a winner is reported. 0.0 means any lead (with deterministic
    /// tie-breaks) is enough.
    pub min_lead: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            min_lead: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Where a test currently stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Decision {
    /// No variant has reached the minimum sample size.
    InsufficientData,
    /// The test is still collecting data (or the margin is not met); the
    /// leader may change.
    LeadingCandidate { variant_id: String },
    /// The test is stopped and the leader cleared the margin. Frozen —
    /// stopped tests accept no further events.
    WinnerDeclared { variant_id: String },
}

impl Decision {
    /// The named variant, if the decision names one.
    pub fn variant_id(&self) -> Option<&str> {
        match self {
            Decision::InsufficientData => None,
            Decision::LeadingCandidate { variant_id } => Some(variant_id),
            Decision::WinnerDeclared { variant_id } => Some(variant_id),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::InsufficientData => write!(f, "insufficient data"),
            Decision::LeadingCandidate { variant_id } => {
                write!(f, "leading candidate: {variant_id}")
            }
            Decision::WinnerDeclared { variant_id } => write!(f, "winner: {variant_id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision rule
// ---------------------------------------------------------------------------

/// Row comparison for leadership: rate, then visits, then definition order.
/// `rows` must be in definition order (the aggregator guarantees it).
fn leads(a: &(usize, &ResultRow), b: &(usize, &ResultRow)) -> bool {
    let (ai, a) = a;
    let (bi, b) = b;
    if a.conversion_rate != b.conversion_rate {
        return a.conversion_rate > b.conversion_rate;
    }
    if a.visits != b.visits {
        return a.visits > b.visits;
    }
    ai < bi
}

fn eligible_leader<'a>(
    rows: &'a [ResultRow],
    config: &DecisionConfig,
) -> Option<(usize, &'a ResultRow)> {
    let mut leader: Option<(usize, &ResultRow)> = None;
    for candidate in rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.visits >= config.min_sample_size)
    {
        leader = match leader {
            None => Some(candidate),
            Some(current) if leads(&candidate, &current) => Some(candidate),
            Some(current) => Some(current),
        };
    }
    leader
}

/// Does `leader` clear the configured margin over every other eligible row?
/// A sole eligible variant clears trivially.
fn clears_margin(
    leader: (usize, &ResultRow),
    rows: &[ResultRow],
    config: &DecisionConfig,
) -> bool {
    if config.min_lead <= 0.0 {
        return true;
    }
    let (leader_idx, leader_row) = leader;
    rows.iter()
        .enumerate()
        .filter(|(i, r)| *i != leader_idx && r.visits >= config.min_sample_size)
        .all(|(_, r)| leader_row.conversion_rate - r.conversion_rate >= config.min_lead)
}

/// Full state-machine view of a test.
pub fn decide(test: &Test, rows: &[ResultRow], config: &DecisionConfig) -> Decision {
    let Some(leader) = eligible_leader(rows, config) else {
        return Decision::InsufficientData;
    };
    let variant_id = leader.1.variant_id.clone();
    if test.is_stopped() && clears_margin(leader, rows, config) {
        Decision::WinnerDeclared { variant_id }
    } else {
        Decision::LeadingCandidate { variant_id }
    }
}

/// The winning variant, or `None` when no eligible variant clears the
/// gate and margin. Reports the current leader for active tests too — the
/// caller can distinguish a frozen winner from a live leader via [`decide`].
pub fn winning_variant(rows: &[ResultRow], config: &DecisionConfig) -> Option<String> {
    let leader = eligible_leader(rows, config)?;
    clears_margin(leader, rows, config).then(|| leader.1.variant_id.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
