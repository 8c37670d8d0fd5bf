//! Consensus: merge raw label values into one value per entity.
//!
//! Unsure (0) and placeholder values never vote. Weighted buckets pick
//! the winner; ties go to the value seen first. Contention is the
//! Shannon entropy (natural log) of the distinct contributing values,
//! computed from raw counts.

use serde::Serialize;

use super::error::{EngineError, Result};
use crate::domain::{AnnotationValue, NOT_ANNOTATED};

/// One annotator's raw value with an optional weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub value: i32,
    pub weight: Option<f64>,
}

impl Vote {
    pub fn new(value: i32) -> Self {
        Self { value, weight: None }
    }

    pub fn weighted(value: i32, weight: f64) -> Self {
        Self {
            value,
            weight: Some(weight),
        }
    }
}

/// Merged value of a set of votes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Consensus {
    /// Winning value; None when nothing voted
    pub value: Option<i32>,
    /// Entropy of the contributing values (0 when unanimous or empty)
    pub entropy: f64,
    pub contributing_votes: usize,
}

/// Reject negative or non-finite weights
pub fn validate_weight(weight: Option<f64>) -> Result<()> {
    match weight {
        Some(w) if !w.is_finite() || w < 0.0 => Err(EngineError::invalid(format!(
            "weight must be a finite number >= 0, got {}",
            w
        ))),
        _ => Ok(()),
    }
}

/// Weight a vote counts with; absent or zero means 1
fn effective_weight(weight: Option<f64>) -> f64 {
    match weight {
        Some(w) if w > 0.0 => w,
        _ => 1.0,
    }
}

/// Whether a raw value takes part in voting
fn is_vote(value: i32) -> Result<bool> {
    if value == NOT_ANNOTATED {
        return Ok(false);
    }
    Ok(AnnotationValue::try_from(value)? != AnnotationValue::Unsure)
}

struct Bucket {
    value: i32,
    weight: f64,
    count: usize,
}

/// Merge votes into a consensus value and contention score
pub fn merge(votes: &[Vote]) -> Result<Consensus> {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut contributing = 0;

    for vote in votes {
        validate_weight(vote.weight)?;
        if !is_vote(vote.value)? {
            continue;
        }

        contributing += 1;
        let weight = effective_weight(vote.weight);
        match buckets.iter_mut().find(|b| b.value == vote.value) {
            Some(bucket) => {
                bucket.weight += weight;
                bucket.count += 1;
            }
            None => buckets.push(Bucket {
                value: vote.value,
                weight,
                count: 1,
            }),
        }
    }

    // Strict comparison keeps the first-seen value on ties
    let mut winner: Option<&Bucket> = None;
    for bucket in &buckets {
        if winner.map_or(true, |w| bucket.weight > w.weight) {
            winner = Some(bucket);
        }
    }

    let counts: Vec<usize> = buckets.iter().map(|b| b.count).collect();

    Ok(Consensus {
        value: winner.map(|b| b.value),
        entropy: entropy(&counts),
        contributing_votes: contributing,
    })
}

/// Unweighted merge of raw values
pub fn merge_labels(values: &[i32]) -> Result<Consensus> {
    let votes: Vec<Vote> = values.iter().copied().map(Vote::new).collect();
    merge(&votes)
}

/// Unweighted majority value, None when nothing voted
pub fn majority(values: &[i32]) -> Result<Option<i32>> {
    Ok(merge_labels(values)?.value)
}

/// Shannon entropy (nats) of a count distribution
pub fn entropy(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    let distinct = counts.iter().filter(|&&c| c > 0).count();
    if distinct <= 1 {
        return 0.0;
    }

    let n = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum()
}
