//! Corpus export: one labeled example per entity.
//!
//! Readers take each annotator's latest record per (entity, label).
//! Entities are emitted in sorted order, so repeated exports of the
//! same records produce identical output.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::consensus::{merge, merge_labels, Vote};
use super::error::Result;
use super::outcome::{FailureLog, FailurePolicy, Outcome};
use super::{Engine, LatestRecords};
use crate::domain::AnnotationRecord;

/// Training example: text plus the consensus value of each label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub text: String,
    pub labels: BTreeMap<String, i32>,
}

/// entity -> records from every annotator, annotators in sorted order
fn group_by_entity<'a>(
    latest: &'a LatestRecords,
    label: Option<&str>,
) -> BTreeMap<&'a str, Vec<&'a AnnotationRecord>> {
    let mut by_entity: BTreeMap<&str, Vec<&AnnotationRecord>> = BTreeMap::new();
    for records in latest.values() {
        for record in records.values() {
            if record.is_placeholder() || label.map_or(false, |l| record.label != l) {
                continue;
            }
            by_entity.entry(record.entity.as_str()).or_default().push(record);
        }
    }
    by_entity
}

/// First text any contributing record carries
fn entity_text(records: &[&AnnotationRecord]) -> String {
    records
        .iter()
        .find_map(|r| r.context.text.clone())
        .unwrap_or_default()
}

/// Unweighted consensus per (entity, label) over the latest records
pub(crate) fn build_corpus(
    latest: &LatestRecords,
    policy: FailurePolicy,
) -> Result<Outcome<Vec<LabeledExample>>> {
    let mut failures = FailureLog::new(policy);
    let mut examples = Vec::new();

    for (entity, records) in group_by_entity(latest, None) {
        let mut values: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
        for record in &records {
            values.entry(record.label.as_str()).or_default().push(record.value);
        }

        let merged: Result<BTreeMap<String, i32>> = values
            .into_iter()
            .filter_map(|(label, values)| match merge_labels(&values) {
                Ok(consensus) => consensus.value.map(|v| Ok((label.to_string(), v))),
                Err(err) => Some(Err(err)),
            })
            .collect();

        match merged {
            Ok(labels) if labels.is_empty() => {}
            Ok(labels) => examples.push(LabeledExample {
                text: entity_text(&records),
                labels,
            }),
            Err(err) => failures.record(entity, err)?,
        }
    }

    Ok(failures.finish(examples))
}

impl Engine {
    /// Deduplicated training corpus over every label of a task
    #[instrument(skip(self))]
    pub async fn export_labeled_corpus(
        &self,
        task_id: &str,
        policy: FailurePolicy,
    ) -> Result<Outcome<Vec<LabeledExample>>> {
        self.task(task_id).await?;
        let latest = self.latest_records(task_id).await?;
        let outcome = build_corpus(&latest, policy)?;

        info!(
            examples = outcome.value.len(),
            failures = outcome.failures.len(),
            "Exported labeled corpus"
        );
        Ok(outcome)
    }

    /// Training snapshot for one label using weighted majority vote
    #[instrument(skip(self))]
    pub async fn export_for_label(
        &self,
        task_id: &str,
        label: &str,
        policy: FailurePolicy,
    ) -> Result<Outcome<Vec<LabeledExample>>> {
        self.task(task_id).await?;
        let latest = self.latest_records(task_id).await?;
        let mut failures = FailureLog::new(policy);
        let mut examples = Vec::new();

        for (entity, records) in group_by_entity(&latest, Some(label)) {
            let votes: Vec<Vote> = records
                .iter()
                .map(|r| Vote {
                    value: r.value,
                    weight: r.weight,
                })
                .collect();

            match merge(&votes) {
                Ok(consensus) => {
                    if let Some(value) = consensus.value {
                        examples.push(LabeledExample {
                            text: entity_text(&records),
                            labels: BTreeMap::from([(label.to_string(), value)]),
                        });
                    }
                }
                Err(err) => failures.record(entity, err)?,
            }
        }

        Ok(failures.finish(examples))
    }
}

/// Write examples as JSON lines
pub fn write_jsonl<W: Write>(examples: &[LabeledExample], mut writer: W) -> std::io::Result<()> {
    for example in examples {
        serde_json::to_writer(&mut writer, example)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        latest_by_entity_label, AnnotationContext, AnnotationRequest, AnnotationValue, Datapoint,
    };

    fn record(annotator: &str, entity: &str, label: &str, value: i32) -> AnnotationRecord {
        let dp = Datapoint::new(entity, AnnotationContext::with_text(format!("text of {}", entity)));
        let request = AnnotationRequest::new("t1", annotator, &dp, label, "company", 0.0);
        let mut record = AnnotationRecord::from_request(&request, AnnotationValue::Unsure, None, None);
        record.value = value;
        record
    }

    fn latest(records: Vec<AnnotationRecord>) -> LatestRecords {
        let mut by_annotator: BTreeMap<String, Vec<AnnotationRecord>> = BTreeMap::new();
        for r in records {
            by_annotator.entry(r.annotator_id.clone()).or_default().push(r);
        }
        by_annotator
            .into_iter()
            .map(|(a, rs)| (a, latest_by_entity_label(rs)))
            .collect()
    }

    #[test]
    fn test_corpus_merges_and_drops_empty() {
        let latest = latest(vec![
            record("ann", "a.com", "HEALTH", 1),
            record("ben", "a.com", "HEALTH", 1),
            record("cat", "a.com", "HEALTH", -1),
            record("ann", "a.com", "AI", 0),
            record("ann", "b.com", "HEALTH", 0),
        ]);

        let outcome = build_corpus(&latest, FailurePolicy::Isolate).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(
            outcome.value,
            vec![LabeledExample {
                text: "text of a.com".to_string(),
                labels: BTreeMap::from([("HEALTH".to_string(), 1)]),
            }]
        );
    }

    #[test]
    fn test_bad_value_fails_whole_entity() {
        let latest = latest(vec![
            record("ann", "a.com", "HEALTH", 1),
            record("ann", "a.com", "AI", 7),
            record("ann", "b.com", "HEALTH", -1),
        ]);

        let outcome = build_corpus(&latest, FailurePolicy::Isolate).unwrap();
        assert_eq!(outcome.value.len(), 1);
        assert_eq!(outcome.value[0].text, "text of b.com");
        assert_eq!(outcome.failures[0].unit, "a.com");

        assert!(build_corpus(&latest, FailurePolicy::FailFast).is_err());
    }

    #[test]
    fn test_write_jsonl_lines() {
        let examples = vec![LabeledExample {
            text: "hello".to_string(),
            labels: BTreeMap::from([("L".to_string(), -1)]),
        }];
        let mut out = Vec::new();
        write_jsonl(&examples, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"text\":\"hello\",\"labels\":{\"L\":-1}}\n"
        );
    }
}
