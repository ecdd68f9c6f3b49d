//! # Stage: Test Registry
//!
//! ## Responsibility
//! The catalog of defined tests: id, name, ordered variant definitions,
//! active/stopped state, and lifecycle timestamps. Tests are created once,
//! stopped at most once, and never physically deleted — stopped tests stay
//! listable forever with their stop timestamp.
//!
//! ## Guarantees
//! - `stop_test` is a one-way transition; stopping a stopped test is a
//!   no-op returning the original stop timestamp (safe operator retries)
//! - Validation happens at creation; a test in the registry is well-formed
//! - Thread-safe: interior `RwLock`, shareable behind an `Arc` between the
//!   engine, the event store, and concurrent admin sessions
//!
//! ## NOT Responsible For
//! - Recording or rejecting events (the event store checks lifecycle here)
//! - Computing results (aggregator)

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::SplitError;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// VariantDef
// ---------------------------------------------------------------------------

/// One arm of an experiment.
///
/// `weight` is a relative allocation share: the probability of a subject
/// landing in this variant is `weight / sum(weights)` across the test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDef {
    pub id: String,
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl VariantDef {
    /// A variant with the default (equal-split) weight.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weight: 1.0,
        }
    }

    pub fn weighted(id: impl Into<String>, name: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            weight,
        }
    }
}

// ---------------------------------------------------------------------------
// Test
// ---------------------------------------------------------------------------

/// One defined experiment.
///
/// Variants are an ordered list: result rows and tie-breaks follow the
/// definition order, so it is part of the test's identity, not an
/// implementation detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub name: String,
    pub variants: Vec<VariantDef>,
    pub is_active: bool,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
}

impl Test {
    /// Validate the definition. Returns [`SplitError::Configuration`] on the
    /// first violation found.
    pub fn validate(&self) -> Result<(), SplitError> {
        if self.id.is_empty() {
            return Err(SplitError::Configuration("test id must not be empty".into()));
        }
        if self.variants.len() < 2 {
            return Err(SplitError::Configuration(format!(
                "test '{}' needs at least two variants, got {}",
                self.id,
                self.variants.len()
            )));
        }
        let mut seen = HashSet::new();
        for v in &self.variants {
            if v.id.is_empty() {
                return Err(SplitError::Configuration(format!(
                    "test '{}' has a variant with an empty id",
                    self.id
                )));
            }
            if !seen.insert(v.id.as_str()) {
                return Err(SplitError::Configuration(format!(
                    "test '{}' defines variant '{}' more than once",
                    self.id, v.id
                )));
            }
            if !v.weight.is_finite() || v.weight <= 0.0 {
                return Err(SplitError::Configuration(format!(
                    "variant '{}' of test '{}' has non-positive weight {}",
                    v.id, self.id, v.weight
                )));
            }
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_active
    }

    /// Lookup a variant by id.
    pub fn variant(&self, variant_id: &str) -> Option<&VariantDef> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// The earliest-defined variant. Used by the fail-open path.
    pub fn first_variant(&self) -> Option<&VariantDef> {
        self.variants.first()
    }
}

// ---------------------------------------------------------------------------
// TestRegistry
// ---------------------------------------------------------------------------

/// Shared catalog of tests.
///
/// Constructed per process and injected where needed — never a module-level
/// singleton, so tests can instantiate isolated registries.
pub struct TestRegistry {
    tests: RwLock<HashMap<String, Test>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self {
            tests: RwLock::new(HashMap::new()),
        }
    }

    /// Define a new test. Fails on validation errors or a duplicate id.
    pub fn create_test(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        variants: Vec<VariantDef>,
    ) -> Result<Test, SplitError> {
        let test = Test {
            id: id.into(),
            name: name.into(),
            variants,
            is_active: true,
            created_at_ms: now_ms(),
            stopped_at_ms: None,
        };
        test.validate()?;

        let mut tests = self.tests.write().expect("registry lock poisoned");
        if tests.contains_key(&test.id) {
            return Err(SplitError::Configuration(format!(
                "test '{}' already exists",
                test.id
            )));
        }
        tracing::info!(test_id = %test.id, variants = test.variants.len(), "test created");
        tests.insert(test.id.clone(), test.clone());
        Ok(test)
    }

    /// Re-insert a test restored from persistence, preserving its lifecycle
    /// state and timestamps. Still validated; an already-present id wins
    /// (the live definition is newer than the restored one).
    pub fn restore(&self, test: Test) -> Result<(), SplitError> {
        test.validate()?;
        let mut tests = self.tests.write().expect("registry lock poisoned");
        tests.entry(test.id.clone()).or_insert(test);
        Ok(())
    }

    /// Stop a test: one-way `is_active: true -> false`.
    ///
    /// Idempotent — stopping an already-stopped test returns its original
    /// stop timestamp. Unknown ids are a configuration error.
    pub fn stop_test(&self, test_id: &str) -> Result<u64, SplitError> {
        let mut tests = self.tests.write().expect("registry lock poisoned");
        let test = tests.get_mut(test_id).ok_or_else(|| {
            SplitError::Configuration(format!("unknown test '{test_id}'"))
        })?;
        if let Some(at) = test.stopped_at_ms {
            return Ok(at);
        }
        let at = now_ms();
        test.is_active = false;
        test.stopped_at_ms = Some(at);
        tracing::info!(test_id = %test_id, stopped_at_ms = at, "test stopped");
        Ok(at)
    }

    /// Clone of the test definition, or `None` if unknown.
    pub fn get_test(&self, test_id: &str) -> Option<Test> {
        self.tests
            .read()
            .expect("registry lock poisoned")
            .get(test_id)
            .cloned()
    }

    /// `Some(true)` if the test exists and accepts events.
    pub fn is_active(&self, test_id: &str) -> Option<bool> {
        self.tests
            .read()
            .expect("registry lock poisoned")
            .get(test_id)
            .map(|t| t.is_active)
    }

    pub fn list_active(&self) -> Vec<Test> {
        self.list(|t| t.is_active)
    }

    /// Every test ever defined, including stopped (archived) ones.
    pub fn list_all(&self) -> Vec<Test> {
        self.list(|_| true)
    }

    fn list(&self, keep: impl Fn(&Test) -> bool) -> Vec<Test> {
        let tests = self.tests.read().expect("registry lock poisoned");
        let mut out: Vec<Test> = tests.values().filter(|t| keep(t)).cloned().collect();
        // Stable listing order for the dashboard: oldest first, id as tiebreak.
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn active_count(&self) -> usize {
        self.tests
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|t| t.is_active)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.tests.read().expect("registry lock poisoned").len()
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
