//! Reports over a task: annotation statistics, contention and the text
//! rendering of agreement matrices.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use tracing::instrument;

use super::agreement::AgreementMatrix;
use super::consensus::{merge, Vote};
use super::error::Result;
use super::outcome::{FailureLog, FailurePolicy, Outcome};
use super::Engine;

/// Counts describing annotation progress on a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnnotationStatistics {
    /// Latest answers across all annotators
    pub total_records: usize,
    /// Distinct entities with at least one answer
    pub labeled_examples: usize,
    pub records_per_annotator: BTreeMap<String, usize>,
    /// label -> value -> count
    pub label_histogram: BTreeMap<String, BTreeMap<i32, usize>>,
    pub outstanding_per_annotator: BTreeMap<String, usize>,
    pub outstanding_total: usize,
}

/// One entity's answers for a label, with contention and blended vote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentionRow {
    pub entity: String,
    pub text: String,
    /// annotator -> value
    pub values: BTreeMap<String, i32>,
    pub entropy: f64,
    pub majority_vote: Option<i32>,
}

impl Engine {
    #[instrument(skip(self))]
    pub async fn annotation_statistics(&self, task_id: &str) -> Result<AnnotationStatistics> {
        self.task(task_id).await?;
        let latest = self.latest_records(task_id).await?;
        let mut stats = AnnotationStatistics::default();
        let mut entities = std::collections::BTreeSet::new();

        for (annotator, records) in &latest {
            let answered: Vec<_> = records.values().filter(|r| !r.is_placeholder()).collect();
            if answered.is_empty() {
                continue;
            }

            stats.total_records += answered.len();
            stats
                .records_per_annotator
                .insert(annotator.clone(), answered.len());
            for record in answered {
                entities.insert(record.entity.clone());
                *stats
                    .label_histogram
                    .entry(record.label.clone())
                    .or_default()
                    .entry(record.value)
                    .or_default() += 1;
            }
        }
        stats.labeled_examples = entities.len();

        for annotator in self.store.list_annotators_for_task(task_id).await? {
            let pending = self.outstanding(task_id, &annotator).await?;
            if pending > 0 {
                stats.outstanding_total += pending;
                stats.outstanding_per_annotator.insert(annotator, pending);
            }
        }

        Ok(stats)
    }

    /// Per-entity answers for a label, most contentious first
    #[instrument(skip(self))]
    pub async fn contention_report(
        &self,
        task_id: &str,
        label: &str,
        policy: FailurePolicy,
    ) -> Result<Outcome<Vec<ContentionRow>>> {
        self.task(task_id).await?;
        let latest = self.latest_records(task_id).await?;
        let mut failures = FailureLog::new(policy);

        let mut by_entity: BTreeMap<&str, Vec<(&str, &crate::domain::AnnotationRecord)>> =
            BTreeMap::new();
        for (annotator, records) in &latest {
            for record in records.values() {
                if record.label == label && !record.is_placeholder() {
                    by_entity
                        .entry(record.entity.as_str())
                        .or_default()
                        .push((annotator.as_str(), record));
                }
            }
        }

        let mut rows = Vec::new();
        for (entity, answers) in by_entity {
            let votes: Vec<Vote> = answers
                .iter()
                .map(|(_, r)| Vote {
                    value: r.value,
                    weight: r.weight,
                })
                .collect();

            match merge(&votes) {
                Ok(consensus) => rows.push(ContentionRow {
                    entity: entity.to_string(),
                    text: answers
                        .iter()
                        .find_map(|(_, r)| r.context.text.clone())
                        .unwrap_or_default(),
                    values: answers
                        .iter()
                        .map(|(a, r)| (a.to_string(), r.value))
                        .collect(),
                    entropy: consensus.entropy,
                    majority_vote: consensus.value,
                }),
                Err(err) => failures.record(entity, err)?,
            }
        }

        rows.sort_by(|a, b| {
            b.entropy
                .total_cmp(&a.entropy)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        Ok(failures.finish(rows))
    }
}

/// Render a kappa matrix as a text table. Cells show two decimals;
/// pairs without a value stay blank.
pub fn render_matrix(matrix: &AgreementMatrix) -> String {
    let annotators: Vec<&str> = matrix.annotators().collect();
    let mut out = String::new();

    if annotators.is_empty() {
        let _ = writeln!(out, "{}: no overlapping annotators", matrix.label);
        return out;
    }

    let width = annotators.iter().map(|a| a.len()).max().unwrap_or(0).max(5);

    let _ = write!(out, "{:width$}", matrix.label, width = width);
    for a in &annotators {
        let _ = write!(out, " {:>width$}", a, width = width);
    }
    out.push('\n');

    for row in &annotators {
        let _ = write!(out, "{:width$}", row, width = width);
        for col in &annotators {
            let cell = match matrix.get(row, col) {
                // Normalize -0.0 so it never prints as "-0.00"
                Some(kappa) => format!("{:.2}", if kappa == 0.0 { 0.0 } else { kappa }),
                None => String::new(),
            };
            let _ = write!(out, " {:>width$}", cell, width = width);
        }
        out.push('\n');
    }

    out
}
