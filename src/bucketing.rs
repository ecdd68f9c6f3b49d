//! # Stage: Bucketing Function
//!
//! ## Responsibility
//! Deterministic mapping from `(test id, subject id)` to a variant. An
//! FNV-1a hash of `test_id|subject_id` is normalized to [0, 1) and mapped
//! into the cumulative weight ranges of the test's variant list, so the
//! assignment is recoverable from the identifiers alone — no persisted
//! record, no RNG, no seeding.
//!
//! ## Guarantees
//! - Deterministic: same inputs always produce the same variant
//! - Stratified: the hash input includes the test id, so one subject's
//!   arms across unrelated tests are uncorrelated
//! - Weight-respecting: P(variant) = weight / sum(weights), statistically
//!   over many subjects
//! - Pure: no side effects, no I/O; malformed input fails fast
//!
//! ## NOT Responsible For
//! - Durable assignment. The event store records the arm a subject was
//!   actually exposed to; this function only computes *first* assignment.
//!   If the variant list changes mid-test, unexposed subjects re-bucket
//!   deterministically into the remaining cumulative ranges (unbiased —
//!   not pinned to the first variant).

use crate::error::SplitError;
use crate::registry::VariantDef;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Separator between the hash inputs. Keeps `("ab", "c")` and `("a", "bc")`
/// from colliding.
const SEP: u8 = b'|';

fn fnv1a_step(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash `(test_id, subject_id)` to a fraction in [0, 1).
///
/// The top 53 bits of the FNV-1a hash are used so the fraction is exactly
/// representable as an `f64`.
pub fn bucket_fraction(test_id: &str, subject_id: &str) -> f64 {
    let mut hash = FNV_OFFSET;
    hash = fnv1a_step(hash, test_id.as_bytes());
    hash = fnv1a_step(hash, &[SEP]);
    hash = fnv1a_step(hash, subject_id.as_bytes());
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

/// Assign a subject to one of the test's variants.
///
/// Returns [`SplitError::Configuration`] for an empty variant list or a
/// non-positive/non-finite total weight.
pub fn assign<'a>(
    test_id: &str,
    subject_id: &str,
    variants: &'a [VariantDef],
) -> Result<&'a VariantDef, SplitError> {
    if variants.is_empty() {
        return Err(SplitError::Configuration(format!(
            "test '{test_id}' has no variants to bucket into"
        )));
    }
    let mut total = 0.0_f64;
    for v in variants {
        if !v.weight.is_finite() || v.weight <= 0.0 {
            return Err(SplitError::Configuration(format!(
                "variant '{}' of test '{test_id}' has non-positive weight {}",
                v.id, v.weight
            )));
        }
        total += v.weight;
    }

    let point = bucket_fraction(test_id, subject_id) * total;
    let mut cumulative = 0.0_f64;
    for v in variants {
        cumulative += v.weight;
        if point < cumulative {
            return Ok(v);
        }
    }
    // Floating-point accumulation can leave `point` a hair past the final
    // boundary; the last range owns it.
    Ok(variants.last().expect("non-empty checked above"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
