//! Inter-annotator agreement: pairwise Cohen's kappa per label.
//!
//! Only annotator pairs that share at least one entity are visited; the
//! pairs are found through an entity -> annotators index, and results are
//! kept in a sparse map keyed by the unordered pair.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, instrument};

use super::error::{EngineError, Result};
use super::outcome::{FailureLog, FailurePolicy, Outcome};
use super::Engine;
use crate::domain::AnnotationValue;

/// annotator -> entity -> value, for one label
pub type AnnotationSets = BTreeMap<String, BTreeMap<String, i32>>;

/// Unordered annotator pair, stored with the smaller id first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnnotatorPair(String, String);

impl AnnotatorPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn first(&self) -> &str {
        &self.0
    }

    pub fn second(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for AnnotatorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.0, self.1)
    }
}

/// Sparse, symmetric kappa matrix for one label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgreementMatrix {
    pub label: String,
    /// Annotators compared in at least one pair
    annotators: BTreeSet<String>,
    pairs: BTreeMap<AnnotatorPair, f64>,
}

impl AgreementMatrix {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    fn add_annotators(&mut self, pair: &AnnotatorPair) {
        self.annotators.insert(pair.first().to_string());
        self.annotators.insert(pair.second().to_string());
    }

    fn insert(&mut self, pair: AnnotatorPair, kappa: f64) {
        self.add_annotators(&pair);
        self.pairs.insert(pair, kappa);
    }

    /// Kappa for two annotators in either order. The diagonal is 1.0 for
    /// every annotator that was compared with someone, including pairs
    /// whose kappa is undefined.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return self.annotators.contains(a).then_some(1.0);
        }
        self.pairs.get(&AnnotatorPair::new(a, b)).copied()
    }

    pub fn annotators(&self) -> impl Iterator<Item = &str> {
        self.annotators.iter().map(String::as_str)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&AnnotatorPair, f64)> {
        self.pairs.iter().map(|(pair, kappa)| (pair, *kappa))
    }

    /// No annotators were compared for this label
    pub fn is_empty(&self) -> bool {
        self.annotators.is_empty()
    }
}

/// Cohen's kappa over two equally long label sequences
pub fn cohen_kappa(a: &[i32], b: &[i32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(EngineError::invalid(format!(
            "Cannot compute kappa over sequences of unequal length ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    if a.is_empty() {
        return Err(EngineError::invalid("Cannot compute kappa over empty sequences"));
    }

    let n = a.len() as f64;
    let agreed = a.iter().zip(b).filter(|(x, y)| x == y).count();
    let observed = agreed as f64 / n;

    let mut marginals: BTreeMap<i32, (usize, usize)> = BTreeMap::new();
    for &x in a {
        marginals.entry(x).or_default().0 += 1;
    }
    for &y in b {
        marginals.entry(y).or_default().1 += 1;
    }
    let expected: f64 = marginals
        .values()
        .map(|&(ca, cb)| (ca as f64 / n) * (cb as f64 / n))
        .sum();

    if expected >= 1.0 - f64::EPSILON {
        return Err(EngineError::KappaUndefined);
    }

    Ok((observed - expected) / (1.0 - expected))
}

/// Paired values for two annotators over their shared entities, with
/// unsure positions removed. Returns the number of positions dropped.
fn paired_values(
    left: &BTreeMap<String, i32>,
    right: &BTreeMap<String, i32>,
) -> Result<(Vec<i32>, Vec<i32>, usize)> {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut dropped = 0;

    for (entity, &x) in left {
        let Some(&y) = right.get(entity) else {
            continue;
        };
        let (vx, vy) = (AnnotationValue::try_from(x)?, AnnotationValue::try_from(y)?);
        if vx == AnnotationValue::Unsure || vy == AnnotationValue::Unsure {
            dropped += 1;
            continue;
        }
        xs.push(x);
        ys.push(y);
    }

    Ok((xs, ys, dropped))
}

/// Pairs of annotators sharing at least one entity
fn overlapping_pairs(sets: &AnnotationSets) -> BTreeSet<AnnotatorPair> {
    let mut by_entity: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (annotator, values) in sets {
        for entity in values.keys() {
            by_entity.entry(entity.as_str()).or_default().push(annotator.as_str());
        }
    }

    let mut pairs = BTreeSet::new();
    for annotators in by_entity.values() {
        for (i, a) in annotators.iter().enumerate() {
            for b in &annotators[i + 1..] {
                pairs.insert(AnnotatorPair::new(*a, *b));
            }
        }
    }
    pairs
}

/// Pairwise kappa for every overlapping annotator pair of one label
#[instrument(skip(sets), fields(annotators = sets.len()))]
pub fn compute_agreement(
    label: &str,
    sets: &AnnotationSets,
    policy: FailurePolicy,
) -> Result<Outcome<AgreementMatrix>> {
    let mut matrix = AgreementMatrix::new(label);
    let mut failures = FailureLog::new(policy);

    for pair in overlapping_pairs(sets) {
        let (Some(left), Some(right)) = (sets.get(pair.first()), sets.get(pair.second())) else {
            continue;
        };

        let (xs, ys, dropped) = match paired_values(left, right) {
            Ok(paired) => paired,
            Err(err) => {
                failures.record(pair.to_string(), err)?;
                continue;
            }
        };
        if dropped > 0 {
            debug!(%pair, dropped, "Ignored unsure annotations for kappa");
        }
        if xs.is_empty() {
            continue;
        }

        // Both annotators were compared, even if kappa turns out undefined
        matrix.add_annotators(&pair);
        match cohen_kappa(&xs, &ys) {
            Ok(kappa) => matrix.insert(pair, kappa),
            Err(err) => failures.record(pair.to_string(), err)?,
        }
    }

    debug!(pairs = matrix.pairs.len(), "Agreement computed");
    Ok(failures.finish(matrix))
}

impl Engine {
    /// Agreement for one label of a task, from each annotator's latest
    /// answers
    #[instrument(skip(self))]
    pub async fn agreement_for_task(
        &self,
        task_id: &str,
        label: &str,
        policy: FailurePolicy,
    ) -> Result<Outcome<AgreementMatrix>> {
        self.task(task_id).await?;
        let sets = self.annotation_sets(task_id, label).await?;
        compute_agreement(label, &sets, policy)
    }

    /// Agreement for every active label of a task, in label order
    pub async fn agreement_report(
        &self,
        task_id: &str,
        policy: FailurePolicy,
    ) -> Result<Vec<Outcome<AgreementMatrix>>> {
        let task = self.task(task_id).await?;
        let latest = self.latest_records(task_id).await?;

        let mut report = Vec::with_capacity(task.labels.len());
        for label in &task.labels {
            let sets = sets_for_label(&latest, label);
            report.push(compute_agreement(label, &sets, policy)?);
        }
        Ok(report)
    }

    async fn annotation_sets(&self, task_id: &str, label: &str) -> Result<AnnotationSets> {
        let latest = self.latest_records(task_id).await?;
        Ok(sets_for_label(&latest, label))
    }
}

fn sets_for_label(latest: &super::LatestRecords, label: &str) -> AnnotationSets {
    let mut sets = AnnotationSets::new();
    for (annotator, records) in latest {
        let values: BTreeMap<String, i32> = records
            .values()
            .filter(|r| r.label == label && !r.is_placeholder())
            .map(|r| (r.entity.clone(), r.value))
            .collect();
        if !values.is_empty() {
            sets.insert(annotator.clone(), values);
        }
    }
    sets
}
