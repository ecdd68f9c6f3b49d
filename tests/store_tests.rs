//! Persistence-focused tests: the sqlite-backed engine across restarts —
//! durable events, rehydrated idempotence, and stable results.

use std::path::Path;

use splitlab::config::{Config, StorageBackend};
use splitlab::registry::VariantDef;
use splitlab::ExperimentEngine;

fn sqlite_config(path: &Path) -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.path = path.to_path_buf();
    config
}

fn ab() -> Vec<VariantDef> {
    vec![VariantDef::new("a", "A"), VariantDef::new("b", "B")]
}

#[tokio::test]
async fn test_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(&dir.path().join("events.db"));

    {
        let engine = ExperimentEngine::from_config(&config).unwrap();
        engine.create_test("t", "t", ab()).unwrap();
        for i in 0..10 {
            engine
                .record_exposure("t", &format!("visitor-{i}"))
                .await
                .unwrap();
        }
        engine.record_conversion("t", "visitor-0", Some(59.0)).await.unwrap();
    }

    // Fresh process: same db file, test re-created in the registry.
    let engine = ExperimentEngine::from_config(&config).unwrap();
    engine.create_test("t", "t", ab()).unwrap();
    let rows = engine.results("t").await.unwrap();
    assert_eq!(rows.iter().map(|r| r.visits).sum::<u64>(), 10);
    assert_eq!(rows.iter().map(|r| r.conversions).sum::<u64>(), 1);
    assert_eq!(rows.iter().map(|r| r.conversion_value).sum::<f64>(), 59.0);
}

#[tokio::test]
async fn test_idempotence_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(&dir.path().join("events.db"));

    {
        let engine = ExperimentEngine::from_config(&config).unwrap();
        engine.create_test("t", "t", ab()).unwrap();
        engine.record_exposure("t", "u1").await.unwrap();
        engine.record_conversion("t", "u1", None).await.unwrap();
    }

    let engine = ExperimentEngine::from_config(&config).unwrap();
    engine.create_test("t", "t", ab()).unwrap();
    // The rehydrated index remembers both the exposure and the conversion.
    engine.record_exposure("t", "u1").await.unwrap();
    engine.record_conversion("t", "u1", None).await.unwrap();
    let rows = engine.results("t").await.unwrap();
    assert_eq!(rows.iter().map(|r| r.visits).sum::<u64>(), 1);
    assert_eq!(rows.iter().map(|r| r.conversions).sum::<u64>(), 1);
}

#[tokio::test]
async fn test_recorded_arm_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(&dir.path().join("events.db"));

    let arm = {
        let engine = ExperimentEngine::from_config(&config).unwrap();
        engine.create_test("t", "t", ab()).unwrap();
        engine.record_exposure("t", "u1").await.unwrap()
    };

    let engine = ExperimentEngine::from_config(&config).unwrap();
    engine.create_test("t", "t", ab()).unwrap();
    assert_eq!(engine.variant_for("t", "u1").await.unwrap(), arm);
}

#[tokio::test]
async fn test_two_tests_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let config = sqlite_config(&dir.path().join("events.db"));
    let engine = ExperimentEngine::from_config(&config).unwrap();
    engine.create_test("t1", "t1", ab()).unwrap();
    engine.create_test("t2", "t2", ab()).unwrap();

    engine.record_exposure("t1", "u1").await.unwrap();
    engine.record_exposure("t2", "u1").await.unwrap();
    engine.record_conversion("t1", "u1", None).await.unwrap();

    let t1 = engine.results("t1").await.unwrap();
    let t2 = engine.results("t2").await.unwrap();
    assert_eq!(t1.iter().map(|r| r.conversions).sum::<u64>(), 1);
    assert_eq!(t2.iter().map(|r| r.conversions).sum::<u64>(), 0);
    assert_eq!(t2.iter().map(|r| r.visits).sum::<u64>(), 1);
}
