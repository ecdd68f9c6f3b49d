use std::path::{Path, PathBuf};

use clap::Parser;
use colored::*;
use rand::Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use splitlab::aggregate::ResultRow;
use splitlab::cli::{parse_rates, parse_variant_arg, Args, Command};
use splitlab::config::{Config, StorageBackend};
use splitlab::decision::Decision;
use splitlab::registry::Test;
use splitlab::ExperimentEngine;

/// Results export shape for `results --json`.
#[derive(Serialize)]
struct ResultsExport {
    test: Test,
    rows: Vec<ResultRow>,
    decision: Decision,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = effective_config(&args)?;
    let engine = ExperimentEngine::from_config(&config)?;

    // The event log lives in sqlite; test definitions live in a JSON
    // catalog next to it so they survive between invocations too.
    let catalog = catalog_path(&config);
    if let Some(path) = &catalog {
        load_catalog(&engine, path)?;
    }

    match args.command {
        Command::Create {
            test_id,
            name,
            variants,
        } => {
            let variants = variants
                .iter()
                .map(|v| parse_variant_arg(v))
                .collect::<Result<Vec<_>, _>>()?;
            let name = name.unwrap_or_else(|| test_id.clone());
            let test = engine.create_test(&test_id, name, variants)?;
            println!(
                "{} '{}' with {} variants",
                "created".green().bold(),
                test.id,
                test.variants.len()
            );
        }

        Command::List { all } => {
            let tests = if all {
                engine.list_all()
            } else {
                engine.list_active()
            };
            if tests.is_empty() {
                println!("{}", "no tests defined".dimmed());
            }
            for test in tests {
                let status = if test.is_active {
                    "active".green()
                } else {
                    "stopped".red()
                };
                let variants: Vec<&str> = test.variants.iter().map(|v| v.id.as_str()).collect();
                println!(
                    "{:<24} {:<8} [{}]  {}",
                    test.id.bold(),
                    status,
                    variants.join(", "),
                    test.name.dimmed()
                );
            }
        }

        Command::Results { test_id, json } => {
            let rows = engine.results(&test_id).await?;
            let decision = engine.decision(&test_id).await?;
            print_results(&rows, &decision);
            if let Some(path) = json {
                let test = engine
                    .get_test(&test_id)
                    .expect("results above would have failed on an unknown test");
                let export = ResultsExport {
                    test,
                    rows,
                    decision,
                };
                let contents = serde_json::to_string_pretty(&export)?;
                std::fs::write(&path, contents)?;
                println!("{} {}", "wrote".green(), path.display());
            }
        }

        Command::Stop { test_id } => {
            let stopped_at = engine.stop_test(&test_id)?;
            println!(
                "{} '{}' (stopped_at_ms={})",
                "stopped".yellow().bold(),
                test_id,
                stopped_at
            );
        }

        Command::Expose {
            test_id,
            subject_id,
        } => {
            let variant = engine.record_exposure(&test_id, &subject_id).await?;
            println!("{} -> {}", subject_id, variant.cyan().bold());
        }

        Command::Convert {
            test_id,
            subject_id,
            value,
        } => {
            let counted = engine.record_conversion(&test_id, &subject_id, value).await?;
            if counted {
                println!("{}", "conversion recorded".green());
            } else {
                println!("{}", "not counted (duplicate or not exposed)".yellow());
            }
        }

        Command::Seed {
            test_id,
            subjects,
            rates,
        } => {
            seed(&engine, &test_id, subjects, rates.as_deref()).await?;
        }
    }

    if let Some(path) = &catalog {
        save_catalog(&engine, path)?;
    }
    Ok(())
}

/// Resolve the runtime config: file (or defaults), then flag overrides.
/// The CLI defaults to sqlite so state carries between invocations; the
/// library default stays in-memory.
fn effective_config(args: &Args) -> Result<Config, splitlab::error::SplitError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.storage.backend = StorageBackend::Sqlite;
            config
        }
    };
    if let Some(db) = &args.db {
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.path = db.clone();
    }
    Ok(config)
}

/// The test catalog sits next to the sqlite file. Memory-backed runs have
/// nothing to persist.
fn catalog_path(config: &Config) -> Option<PathBuf> {
    match config.storage.backend {
        StorageBackend::Sqlite => Some(config.storage.path.with_extension("tests.json")),
        StorageBackend::Memory => None,
    }
}

fn load_catalog(
    engine: &ExperimentEngine,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(());
    }
    let contents = std::fs::read_to_string(path)?;
    let tests: Vec<Test> = serde_json::from_str(&contents)?;
    for test in tests {
        engine.registry().restore(test)?;
    }
    Ok(())
}

fn save_catalog(
    engine: &ExperimentEngine,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let contents = serde_json::to_string_pretty(&engine.list_all())?;
    std::fs::write(path, contents)?;
    Ok(())
}

fn print_results(rows: &[ResultRow], decision: &Decision) {
    println!(
        "{:<16} {:>8} {:>12} {:>8} {:>10}",
        "variant".bold(),
        "visits".bold(),
        "conversions".bold(),
        "rate".bold(),
        "value".bold()
    );
    for row in rows {
        println!(
            "{:<16} {:>8} {:>12} {:>7.1}% {:>10.2}",
            row.variant_id,
            row.visits,
            row.conversions,
            row.conversion_rate * 100.0,
            row.conversion_value
        );
    }
    let line = match decision {
        Decision::InsufficientData => "insufficient data".dimmed(),
        Decision::LeadingCandidate { variant_id } => {
            format!("leading candidate: {variant_id}").yellow()
        }
        Decision::WinnerDeclared { variant_id } => format!("winner: {variant_id}").green().bold(),
    };
    println!("{line}");
}

/// Expose `subjects` synthetic visitors and convert them at per-variant
/// rates. Assignment stays deterministic (it is the same hash as real
/// traffic); only the conversion draw is random.
async fn seed(
    engine: &ExperimentEngine,
    test_id: &str,
    subjects: u64,
    rates: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let test = engine
        .get_test(test_id)
        .ok_or_else(|| format!("unknown test '{test_id}'"))?;
    let rates = match rates {
        Some(arg) => parse_rates(arg)?,
        None => vec![0.1; test.variants.len()],
    };

    let mut rng = rand::thread_rng();
    let run_tag: u32 = rng.gen();
    let mut conversions = 0u64;
    for i in 0..subjects {
        let subject = format!("seed-{run_tag:08x}-{i}");
        let variant = engine.record_exposure(test_id, &subject).await?;
        let index = test
            .variants
            .iter()
            .position(|v| v.id == variant)
            .unwrap_or(0);
        let rate = rates.get(index).copied().unwrap_or(0.0);
        if rate > 0.0 && rng.gen_bool(rate) {
            engine.record_conversion(test_id, &subject, None).await?;
            conversions += 1;
        }
    }
    println!(
        "{} {} subjects ({} conversions) into '{}'",
        "seeded".green().bold(),
        subjects,
        conversions,
        test_id
    );
    Ok(())
}
