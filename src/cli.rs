use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::registry::VariantDef;

#[derive(Parser)]
#[command(name = "splitlab")]
#[command(version)]
#[command(about = "Admin CLI for the splitlab A/B experimentation engine")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sqlite database path (overrides the config file's storage section)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Define a new test
    Create {
        /// Test id (slug)
        test_id: String,
        /// Human-readable name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Variant as ID[:WEIGHT], repeatable; at least two required
        #[arg(long = "variant", value_name = "ID[:WEIGHT]")]
        variants: Vec<String>,
    },
    /// List tests (active by default)
    List {
        /// Include stopped (archived) tests
        #[arg(long)]
        all: bool,
    },
    /// Show per-variant results and the current decision for a test
    Results {
        test_id: String,
        /// Also write the results as pretty JSON to this path
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Stop a test (idempotent; frozen afterwards)
    Stop { test_id: String },
    /// Record an exposure for a subject
    Expose { test_id: String, subject_id: String },
    /// Record a conversion for a subject
    Convert {
        test_id: String,
        subject_id: String,
        /// Optional conversion value (e.g. booking revenue)
        #[arg(long)]
        value: Option<f64>,
    },
    /// Drive synthetic traffic through a test (demo / dashboard checks)
    Seed {
        test_id: String,
        /// Number of synthetic subjects to expose
        #[arg(long, default_value = "100")]
        subjects: u64,
        /// Per-variant conversion rates in definition order, e.g. 0.30,0.20
        #[arg(long)]
        rates: Option<String>,
    },
}

/// Parse a `--variant` argument: `"cta-red"` or `"cta-red:2.5"`.
pub fn parse_variant_arg(arg: &str) -> Result<VariantDef, String> {
    let (id, weight) = match arg.rsplit_once(':') {
        None => (arg, 1.0),
        Some((id, weight)) => {
            let weight: f64 = weight
                .parse()
                .map_err(|_| format!("invalid weight in variant '{arg}'"))?;
            (id, weight)
        }
    };
    if id.is_empty() {
        return Err(format!("empty variant id in '{arg}'"));
    }
    Ok(VariantDef::weighted(id, id, weight))
}

/// Parse the `--rates` argument: comma-separated fractions in [0, 1].
pub fn parse_rates(arg: &str) -> Result<Vec<f64>, String> {
    arg.split(',')
        .map(|part| {
            let rate: f64 = part
                .trim()
                .parse()
                .map_err(|_| format!("invalid rate '{part}'"))?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(format!("rate '{part}' must be in [0, 1]"));
            }
            Ok(rate)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variant_plain() {
        let v = parse_variant_arg("control").unwrap();
        assert_eq!(v.id, "control");
        assert_eq!(v.weight, 1.0);
    }

    #[test]
    fn test_parse_variant_weighted() {
        let v = parse_variant_arg("treatment:2.5").unwrap();
        assert_eq!(v.id, "treatment");
        assert_eq!(v.weight, 2.5);
    }

    #[test]
    fn test_parse_variant_bad_weight() {
        assert!(parse_variant_arg("x:heavy").is_err());
    }

    #[test]
    fn test_parse_variant_empty_id() {
        assert!(parse_variant_arg(":2").is_err());
    }

    #[test]
    fn test_parse_rates() {
        assert_eq!(parse_rates("0.3, 0.2").unwrap(), vec![0.3, 0.2]);
    }

    #[test]
    fn test_parse_rates_rejects_out_of_range() {
        assert!(parse_rates("1.5").is_err());
        assert!(parse_rates("-0.1").is_err());
        assert!(parse_rates("0.2,junk").is_err());
    }

    #[test]
    fn test_args_parse_create() {
        let args = Args::parse_from([
            "splitlab", "create", "hero-cta", "--name", "Hero CTA", "--variant", "a", "--variant",
            "b:2",
        ]);
        match args.command {
            Command::Create {
                test_id,
                name,
                variants,
            } => {
                assert_eq!(test_id, "hero-cta");
                assert_eq!(name.as_deref(), Some("Hero CTA"));
                assert_eq!(variants, vec!["a", "b:2"]);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_args_parse_results_with_json() {
        let args = Args::parse_from(["splitlab", "results", "t1", "--json", "out.json"]);
        match args.command {
            Command::Results { test_id, json } => {
                assert_eq!(test_id, "t1");
                assert_eq!(json, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected results"),
        }
    }

    #[test]
    fn test_args_parse_global_db_flag() {
        let args = Args::parse_from(["splitlab", "list", "--db", "custom.db"]);
        assert_eq!(args.db, Some(PathBuf::from("custom.db")));
    }

    #[test]
    fn test_args_parse_seed_defaults() {
        let args = Args::parse_from(["splitlab", "seed", "t1"]);
        match args.command {
            Command::Seed {
                subjects, rates, ..
            } => {
                assert_eq!(subjects, 100);
                assert!(rates.is_none());
            }
            _ => panic!("expected seed"),
        }
    }
}
