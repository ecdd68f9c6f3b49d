//! End-to-end tests for the experimentation engine facade — assignment
//! determinism, idempotent counting, stop freezing, and winner decisions.

use once_cell::sync::Lazy;
use splitlab::decision::Decision;
use splitlab::registry::VariantDef;
use splitlab::ExperimentEngine;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("splitlab=warn")
        .try_init();
});

fn engine() -> ExperimentEngine {
    Lazy::force(&TRACING);
    ExperimentEngine::in_memory()
}

fn ab() -> Vec<VariantDef> {
    vec![VariantDef::new("a", "A"), VariantDef::new("b", "B")]
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_assignment_is_deterministic_across_calls() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    let first = engine.variant_for("t1", "visitor-123").await.unwrap();
    for _ in 0..50 {
        assert_eq!(engine.variant_for("t1", "visitor-123").await.unwrap(), first);
    }
}

#[tokio::test]
async fn test_assignment_survives_engine_restart() {
    // No persisted assignment record: a fresh engine with the same test
    // definition buckets the same subject identically.
    let engine_a = engine();
    let engine_b = engine();
    engine_a.create_test("t1", "t1", ab()).unwrap();
    engine_b.create_test("t1", "t1", ab()).unwrap();
    for i in 0..100 {
        let subject = format!("visitor-{i}");
        assert_eq!(
            engine_a.variant_for("t1", &subject).await.unwrap(),
            engine_b.variant_for("t1", &subject).await.unwrap()
        );
    }
}

// ---------------------------------------------------------------------------
// Counting invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_visits_equal_distinct_exposed_subjects() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    for i in 0..40 {
        let subject = format!("visitor-{i}");
        engine.record_exposure("t1", &subject).await.unwrap();
        // Every subject double-fires (reload, double-click) — must not count.
        engine.record_exposure("t1", &subject).await.unwrap();
    }
    let rows = engine.results("t1").await.unwrap();
    assert_eq!(rows.iter().map(|r| r.visits).sum::<u64>(), 40);
}

#[tokio::test]
async fn test_triple_conversion_counts_once() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    engine.record_exposure("t1", "u1").await.unwrap();
    for _ in 0..3 {
        engine.record_conversion("t1", "u1", None).await.unwrap();
    }
    let rows = engine.results("t1").await.unwrap();
    assert_eq!(rows.iter().map(|r| r.conversions).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_orphan_conversion_affects_no_variant() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    engine.record_exposure("t1", "exposed").await.unwrap();
    engine.record_conversion("t1", "never-exposed", None).await.unwrap();
    let rows = engine.results("t1").await.unwrap();
    assert_eq!(rows.iter().map(|r| r.conversions).sum::<u64>(), 0);
}

// ---------------------------------------------------------------------------
// Stop freezing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stop_freezes_results() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    for i in 0..20 {
        engine
            .record_exposure("t1", &format!("visitor-{i}"))
            .await
            .unwrap();
    }
    engine.stop_test("t1").unwrap();
    let frozen = engine.results("t1").await.unwrap();

    for i in 20..40 {
        engine
            .record_exposure("t1", &format!("visitor-{i}"))
            .await
            .unwrap();
    }
    engine.record_conversion("t1", "visitor-0", None).await.unwrap();
    assert_eq!(engine.results("t1").await.unwrap(), frozen);
}

#[tokio::test]
async fn test_stop_twice_is_harmless() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    let first = engine.stop_test("t1").unwrap();
    let second = engine.stop_test("t1").unwrap();
    assert_eq!(first, second);
}

// ---------------------------------------------------------------------------
// Decision scenarios
// ---------------------------------------------------------------------------

/// 100 subjects split by hash; variant a converts at 50%, b at 20%.
async fn drive_ab_traffic(engine: &ExperimentEngine, test_id: &str) -> (u64, u64) {
    let mut seen = [0u64; 2];
    for i in 0..100 {
        let subject = format!("visitor-{i}");
        let variant = engine.record_exposure(test_id, &subject).await.unwrap();
        let convert = if variant == "a" {
            seen[0] += 1;
            seen[0] % 2 == 0 // 50%
        } else {
            seen[1] += 1;
            seen[1] % 5 == 0 // 20%
        };
        if convert {
            engine.record_conversion(test_id, &subject, None).await.unwrap();
        }
    }
    (seen[0], seen[1])
}

#[tokio::test]
async fn test_clear_leader_wins_with_sufficient_samples() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    let (a_visits, b_visits) = drive_ab_traffic(&engine, "t1").await;

    // Equal weights: the hash split should be near 50/50.
    assert!((35..=65).contains(&a_visits), "a_visits={a_visits}");
    assert!((35..=65).contains(&b_visits), "b_visits={b_visits}");

    assert_eq!(
        engine.winning_variant("t1").await.unwrap(),
        Some("a".to_string())
    );
    assert_eq!(
        engine.decision("t1").await.unwrap(),
        Decision::LeadingCandidate {
            variant_id: "a".into()
        }
    );
}

#[tokio::test]
async fn test_stopped_test_declares_winner() {
    let engine = engine();
    engine.create_test("t1", "t1", ab()).unwrap();
    drive_ab_traffic(&engine, "t1").await;
    engine.stop_test("t1").unwrap();
    assert_eq!(
        engine.decision("t1").await.unwrap(),
        Decision::WinnerDeclared {
            variant_id: "a".into()
        }
    );
}

#[tokio::test]
async fn test_below_minimum_sample_no_winner() {
    let engine = engine();
    engine.create_test("t2", "t2", ab()).unwrap();
    // 10 visits, 5 conversions — a great rate on far too little data.
    for i in 0..10 {
        let subject = format!("visitor-{i}");
        engine.record_exposure("t2", &subject).await.unwrap();
        if i % 2 == 0 {
            engine.record_conversion("t2", &subject, None).await.unwrap();
        }
    }
    assert_eq!(engine.winning_variant("t2").await.unwrap(), None);
    assert_eq!(
        engine.decision("t2").await.unwrap(),
        Decision::InsufficientData
    );
}

#[tokio::test]
async fn test_zero_visit_variant_still_reported() {
    let engine = engine();
    engine
        .create_test(
            "t3",
            "t3",
            vec![
                VariantDef::weighted("big", "Big", 1000.0),
                VariantDef::weighted("tiny", "Tiny", 0.001),
            ],
        )
        .unwrap();
    for i in 0..25 {
        engine
            .record_exposure("t3", &format!("visitor-{i}"))
            .await
            .unwrap();
    }
    let rows = engine.results("t3").await.unwrap();
    assert_eq!(rows.len(), 2);
    let tiny = rows.iter().find(|r| r.variant_id == "tiny").unwrap();
    assert_eq!(tiny.conversion_rate, 0.0);
    assert!(tiny.conversion_rate.is_finite());
}

// ---------------------------------------------------------------------------
// Weighted allocation through the facade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_weighted_allocation_statistically_respected() {
    let engine = engine();
    engine
        .create_test(
            "t4",
            "t4",
            vec![
                VariantDef::weighted("heavy", "Heavy", 4.0),
                VariantDef::weighted("light", "Light", 1.0),
            ],
        )
        .unwrap();
    let mut heavy = 0u64;
    for i in 0..1000 {
        if engine
            .record_exposure("t4", &format!("visitor-{i}"))
            .await
            .unwrap()
            == "heavy"
        {
            heavy += 1;
        }
    }
    // Expect ~800 of 1000.
    assert!((720..=880).contains(&heavy), "heavy={heavy}");
}
