//! Annotation records: the results of completed requests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::context::AnnotationContext;
use super::request::AnnotationRequest;

/// Raw value of a placeholder row that only marks a label's existence.
pub const NOT_ANNOTATED: i32 = -2;

/// A label value supplied by an annotator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationValue {
    Negative,
    Unsure,
    Positive,
}

impl AnnotationValue {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Negative => -1,
            Self::Unsure => 0,
            Self::Positive => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid annotation value {0} (expected -1, 0 or 1)")]
pub struct InvalidValue(pub i32);

impl TryFrom<i32> for AnnotationValue {
    type Error = InvalidValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Negative),
            0 => Ok(Self::Unsure),
            1 => Ok(Self::Positive),
            other => Err(InvalidValue(other)),
        }
    }
}

/// One annotator's answer for one entity under one label.
///
/// Records are never edited in place: a resubmission appends a newer
/// record and readers pick the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub task_id: String,

    /// Request this record answers
    pub request_id: String,

    pub annotator_id: String,

    pub entity: String,

    pub entity_type: String,

    pub label: String,

    /// -1 (negative), 0 (unsure), 1 (positive); stored raw
    pub value: i32,

    /// Vote weight; absent or 0 means unweighted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    /// Request context merged with what the annotator submitted
    #[serde(default)]
    pub context: AnnotationContext,

    pub created_at: DateTime<Utc>,
}

impl AnnotationRecord {
    /// Build the record answering `request`
    pub fn from_request(
        request: &AnnotationRequest,
        value: AnnotationValue,
        weight: Option<f64>,
        submitted: Option<&AnnotationContext>,
    ) -> Self {
        let context = match submitted {
            Some(submitted) => request.context.merged_with(submitted),
            None => request.context.clone(),
        };

        Self {
            task_id: request.task_id.clone(),
            request_id: request.request_id.clone(),
            annotator_id: request.annotator_id.clone(),
            entity: request.entity.clone(),
            entity_type: request.entity_type.clone(),
            label: request.label.clone(),
            value: value.as_i32(),
            weight,
            context,
            created_at: Utc::now(),
        }
    }

    /// Text payload of the entity (empty when the context has none)
    pub fn text(&self) -> &str {
        self.context.text.as_deref().unwrap_or("")
    }

    /// True for label-existence placeholder rows
    pub fn is_placeholder(&self) -> bool {
        self.value == NOT_ANNOTATED
    }
}

/// Keep only the most recent record per (entity, label).
///
/// Input is one annotator's records. Equal timestamps resolve to the
/// record appearing later in the input.
pub fn latest_by_entity_label(
    records: Vec<AnnotationRecord>,
) -> BTreeMap<(String, String), AnnotationRecord> {
    let mut latest: BTreeMap<(String, String), AnnotationRecord> = BTreeMap::new();

    for record in records {
        let key = (record.entity.clone(), record.label.clone());
        match latest.get(&key) {
            Some(existing) if existing.created_at > record.created_at => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }

    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::Datapoint;
    use chrono::Duration;

    fn request() -> AnnotationRequest {
        let dp = Datapoint::new(
            "foo.com",
            AnnotationContext::with_text("Foo makes hospital software").with_domain("foo.com"),
        );
        AnnotationRequest::new("t1", "ann", &dp, "HEALTHCARE", "company", 0.0)
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(AnnotationValue::try_from(1), Ok(AnnotationValue::Positive));
        assert_eq!(AnnotationValue::try_from(-1), Ok(AnnotationValue::Negative));
        assert_eq!(AnnotationValue::try_from(0), Ok(AnnotationValue::Unsure));
        assert_eq!(AnnotationValue::try_from(2), Err(InvalidValue(2)));
        assert_eq!(AnnotationValue::try_from(NOT_ANNOTATED), Err(InvalidValue(-2)));
    }

    #[test]
    fn test_record_carries_request_context() {
        let req = request();
        let mut submitted = AnnotationContext::default();
        submitted
            .extra
            .insert("comment".to_string(), serde_json::json!("clear case"));

        let record =
            AnnotationRecord::from_request(&req, AnnotationValue::Positive, None, Some(&submitted));

        assert_eq!(record.value, 1);
        assert_eq!(record.request_id, req.request_id);
        assert_eq!(record.text(), "Foo makes hospital software");
        assert_eq!(record.context.extra["comment"], serde_json::json!("clear case"));
    }

    #[test]
    fn test_latest_record_wins() {
        let req = request();
        let mut first = AnnotationRecord::from_request(&req, AnnotationValue::Negative, None, None);
        let mut second = AnnotationRecord::from_request(&req, AnnotationValue::Positive, None, None);
        first.created_at = Utc::now() - Duration::seconds(10);
        second.created_at = Utc::now();

        // Input order must not matter
        let latest = latest_by_entity_label(vec![second.clone(), first.clone()]);
        assert_eq!(latest.len(), 1);
        assert_eq!(
            latest[&("foo.com".to_string(), "HEALTHCARE".to_string())].value,
            1
        );
    }
}
