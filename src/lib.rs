//! Deterministic A/B experimentation engine.
//!
//! Assigns subjects to weighted test variants with a stable hash (no RNG,
//! no persisted assignment needed), records exposure and conversion events
//! idempotently, aggregates per-variant results fresh from the event log,
//! and reports a winning variant under a minimum-sample rule.
//!
//! [`ExperimentEngine`] is the facade collaborators use; the modules
//! underneath are usable on their own when embedding only a piece.

pub mod aggregate;
pub mod bucketing;
pub mod cli;
pub mod config;
pub mod decision;
pub mod error;
pub mod registry;
pub mod store;

use std::sync::Arc;

use aggregate::ResultRow;
use config::{Config, StorageBackend};
use decision::{Decision, DecisionConfig};
use error::SplitError;
use registry::{Test, TestRegistry, VariantDef};
use store::memory::MemoryBackend;
use store::sqlite::SqliteBackend;
use store::EventStore;

// ---------------------------------------------------------------------------
// ExperimentEngine — registry + store + bucketing, wired
// ---------------------------------------------------------------------------

/// The experimentation facade.
///
/// Page code calls [`variant_for`](Self::variant_for) when rendering a
/// variant-dependent element, [`record_exposure`](Self::record_exposure) at
/// the moment the element is shown, and
/// [`record_conversion`](Self::record_conversion) when the tracked goal
/// completes. The dashboard reads [`results`](Self::results) and
/// [`decision`](Self::decision) and invokes [`stop_test`](Self::stop_test).
///
/// Orphan conversions and post-stop writes are logged and dropped here —
/// an experimentation hiccup must never break a booking flow. Persistence
/// failures are surfaced.
pub struct ExperimentEngine {
    registry: Arc<TestRegistry>,
    store: EventStore,
    decision: DecisionConfig,
}

impl ExperimentEngine {
    /// An isolated engine over process-lifetime storage. The constructor
    /// tests and embedded callers reach for first.
    pub fn in_memory() -> Self {
        let registry = Arc::new(TestRegistry::new());
        let store = EventStore::new(registry.clone(), Box::new(MemoryBackend::new()));
        Self {
            registry,
            store,
            decision: DecisionConfig::default(),
        }
    }

    /// Build an engine from configuration. A sqlite-backed engine
    /// rehydrates its idempotence index from the existing log.
    pub fn from_config(config: &Config) -> Result<Self, SplitError> {
        let registry = Arc::new(TestRegistry::new());
        let store = match config.storage.backend {
            StorageBackend::Memory => {
                EventStore::new(registry.clone(), Box::new(MemoryBackend::new()))
            }
            StorageBackend::Sqlite => {
                let backend = SqliteBackend::open(&config.storage.path)?;
                EventStore::open(registry.clone(), Box::new(backend))?
            }
        };
        Ok(Self {
            registry,
            store,
            decision: config.decision.clone(),
        })
    }

    /// The shared test catalog, for persistence layers that restore or
    /// snapshot definitions.
    pub fn registry(&self) -> &TestRegistry {
        &self.registry
    }

    pub fn decision_config(&self) -> &DecisionConfig {
        &self.decision
    }

    // --- test lifecycle -----------------------------------------------------

    pub fn create_test(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        variants: Vec<VariantDef>,
    ) -> Result<Test, SplitError> {
        self.registry.create_test(id, name, variants)
    }

    /// Stop a test; idempotent. Returns the stop timestamp (ms).
    pub fn stop_test(&self, test_id: &str) -> Result<u64, SplitError> {
        self.registry.stop_test(test_id)
    }

    pub fn get_test(&self, test_id: &str) -> Option<Test> {
        self.registry.get_test(test_id)
    }

    pub fn list_active(&self) -> Vec<Test> {
        self.registry.list_active()
    }

    pub fn list_all(&self) -> Vec<Test> {
        self.registry.list_all()
    }

    // --- assignment and event hooks ----------------------------------------

    /// The variant this subject belongs to.
    ///
    /// The durably recorded arm wins if the subject was already exposed;
    /// otherwise the deterministic bucketing result. Fail-open: if
    /// assignment fails on a known test, the first defined variant is
    /// returned (with a warning) so a page render never blocks on the
    /// experimentation layer. An unknown test is still an error — there is
    /// no variant to fail open to.
    pub async fn variant_for(
        &self,
        test_id: &str,
        subject_id: &str,
    ) -> Result<String, SplitError> {
        if let Some(variant_id) = self.store.exposed_variant(test_id, subject_id).await {
            return Ok(variant_id);
        }
        let test = self
            .registry
            .get_test(test_id)
            .ok_or_else(|| SplitError::Configuration(format!("unknown test '{test_id}'")))?;

        match bucketing::assign(test_id, subject_id, &test.variants) {
            Ok(variant) => Ok(variant.id.clone()),
            Err(err) => match test.first_variant() {
                Some(first) => {
                    tracing::warn!(
                        test_id,
                        subject_id,
                        error = %err,
                        fallback = %first.id,
                        "assignment failed; failing open to the first defined variant"
                    );
                    Ok(first.id.clone())
                }
                None => Err(err),
            },
        }
    }

    /// Report that the subject was shown its variant.
    ///
    /// Assigns (or re-reads) the variant and records the exposure. Returns
    /// the variant id so call sites can render directly from the same
    /// call. Post-stop exposures are logged and dropped, returning the
    /// recorded-or-bucketed arm anyway.
    pub async fn record_exposure(
        &self,
        test_id: &str,
        subject_id: &str,
    ) -> Result<String, SplitError> {
        let variant_id = self.variant_for(test_id, subject_id).await?;
        match self
            .store
            .record_exposure(test_id, subject_id, &variant_id)
            .await
        {
            Ok(_) => Ok(variant_id),
            Err(err) if err.is_droppable() => {
                tracing::warn!(test_id, subject_id, error = %err, "exposure dropped");
                Ok(variant_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Report that the subject completed the tracked goal.
    ///
    /// Attributed to the arm the subject was exposed to. Orphan conversions
    /// (no prior exposure) and post-stop conversions are logged and
    /// dropped; duplicates are no-ops. Returns whether a conversion was
    /// newly counted.
    pub async fn record_conversion(
        &self,
        test_id: &str,
        subject_id: &str,
        value: Option<f64>,
    ) -> Result<bool, SplitError> {
        match self.store.record_conversion(test_id, subject_id, value).await {
            Ok(counted) => Ok(counted),
            Err(err) if err.is_droppable() => {
                tracing::warn!(test_id, subject_id, error = %err, "conversion dropped");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    // --- reads --------------------------------------------------------------

    /// Per-variant results, computed fresh from the event log.
    pub async fn results(&self, test_id: &str) -> Result<Vec<ResultRow>, SplitError> {
        let test = self
            .registry
            .get_test(test_id)
            .ok_or_else(|| SplitError::Configuration(format!("unknown test '{test_id}'")))?;
        let events = self.store.events_for(test_id).await?;
        Ok(aggregate::compute_results(&test, events).await)
    }

    /// State-machine view: insufficient data, leading candidate, or a
    /// declared winner (stopped tests only).
    pub async fn decision(&self, test_id: &str) -> Result<Decision, SplitError> {
        let test = self
            .registry
            .get_test(test_id)
            .ok_or_else(|| SplitError::Configuration(format!("unknown test '{test_id}'")))?;
        let rows = self.results(test_id).await?;
        Ok(decision::decide(&test, &rows, &self.decision))
    }

    /// The winning variant under the minimum-sample (and margin) rule, or
    /// `None`.
    pub async fn winning_variant(&self, test_id: &str) -> Result<Option<String>, SplitError> {
        let rows = self.results(test_id).await?;
        Ok(decision::winning_variant(&rows, &self.decision))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ab() -> Vec<VariantDef> {
        vec![VariantDef::new("a", "A"), VariantDef::new("b", "B")]
    }

    #[tokio::test]
    async fn test_variant_for_is_stable_before_any_exposure() {
        let engine = ExperimentEngine::in_memory();
        engine.create_test("t", "t", ab()).unwrap();
        let first = engine.variant_for("t", "u1").await.unwrap();
        for _ in 0..20 {
            assert_eq!(engine.variant_for("t", "u1").await.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_variant_for_unknown_test_errors() {
        let engine = ExperimentEngine::in_memory();
        assert!(engine.variant_for("ghost", "u1").await.is_err());
    }

    #[tokio::test]
    async fn test_recorded_arm_wins_over_rebucketing() {
        let engine = ExperimentEngine::in_memory();
        engine.create_test("t", "t", ab()).unwrap();
        let exposed = engine.record_exposure("t", "u1").await.unwrap();
        // Whatever bucketing would now say, the durable arm is returned.
        assert_eq!(engine.variant_for("t", "u1").await.unwrap(), exposed);
    }

    #[tokio::test]
    async fn test_orphan_conversion_is_dropped_not_fatal() {
        let engine = ExperimentEngine::in_memory();
        engine.create_test("t", "t", ab()).unwrap();
        assert!(!engine.record_conversion("t", "u1", None).await.unwrap());
        let rows = engine.results("t").await.unwrap();
        assert_eq!(rows.iter().map(|r| r.conversions).sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn test_post_stop_exposure_dropped_but_still_returns_variant() {
        let engine = ExperimentEngine::in_memory();
        engine.create_test("t", "t", ab()).unwrap();
        engine.stop_test("t").unwrap();
        let variant = engine.record_exposure("t", "u1").await.unwrap();
        assert!(variant == "a" || variant == "b");
        let rows = engine.results("t").await.unwrap();
        assert_eq!(rows.iter().map(|r| r.visits).sum::<u64>(), 0);
    }

    #[tokio::test]
    async fn test_from_config_memory_backend() {
        let engine = ExperimentEngine::from_config(&Config::default()).unwrap();
        engine.create_test("t", "t", ab()).unwrap();
        assert_eq!(engine.list_active().len(), 1);
    }
}
