//! Annotation requests: units of assigned work.
//!
//! "Annotator X, please label entity Y for label Z."

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::AnnotationContext;
use super::task::Datapoint;

/// A request for one annotator to label one entity under one label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRequest {
    /// Task this request belongs to
    pub task_id: String,

    /// Who should annotate
    pub annotator_id: String,

    /// Unique within (task_id, annotator_id)
    pub request_id: String,

    /// Key of the thing being labeled
    pub entity: String,

    pub entity_type: String,

    pub label: String,

    pub status: RequestStatus,

    /// Priority; lower values are surfaced first
    pub order: f64,

    /// Friendly name to show to the annotator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// What is presented to the annotator; copied to the annotation
    #[serde(default)]
    pub context: AnnotationContext,

    pub created_at: DateTime<Utc>,
}

impl AnnotationRequest {
    /// Create a pending request for a datapoint
    pub fn new(
        task_id: impl Into<String>,
        annotator_id: impl Into<String>,
        datapoint: &Datapoint,
        label: impl Into<String>,
        entity_type: impl Into<String>,
        order: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            annotator_id: annotator_id.into(),
            request_id: Uuid::new_v4().to_string(),
            entity: datapoint.entity.clone(),
            entity_type: entity_type.into(),
            label: label.into(),
            status: RequestStatus::Pending,
            order,
            name: datapoint.context.meta.name.clone(),
            context: datapoint.context.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}

/// Status of an annotation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for the annotator
    Pending,

    /// The annotator submitted a value
    Complete,

    /// No longer part of the task's active label set; awaiting purge
    Stale,
}

impl Default for RequestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            "stale" => Some(Self::Stale),
            _ => None,
        }
    }
}

/// Sort requests into priority order: `order` ascending, then creation
/// time, then id so equal priorities still have a total order.
pub fn sort_by_priority(requests: &mut [AnnotationRequest]) {
    requests.sort_by(priority_cmp);
}

/// Compare two requests by priority (see [`sort_by_priority`])
pub fn priority_cmp(a: &AnnotationRequest, b: &AnnotationRequest) -> Ordering {
    a.order
        .total_cmp(&b.order)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.request_id.cmp(&b.request_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datapoint(entity: &str) -> Datapoint {
        Datapoint::new(entity, AnnotationContext::with_text(format!("about {}", entity)))
    }

    #[test]
    fn test_new_request_is_pending() {
        let req = AnnotationRequest::new("t1", "ann", &datapoint("foo.com"), "HEALTHCARE", "company", 1.0);

        assert!(req.is_pending());
        assert_eq!(req.entity, "foo.com");
        assert_eq!(req.context.text.as_deref(), Some("about foo.com"));
        assert!(Uuid::parse_str(&req.request_id).is_ok());
    }

    #[test]
    fn test_priority_sort() {
        let mut requests = vec![
            AnnotationRequest::new("t1", "ann", &datapoint("c"), "L", "company", 3.0),
            AnnotationRequest::new("t1", "ann", &datapoint("a"), "L", "company", -2.0),
            AnnotationRequest::new("t1", "ann", &datapoint("b"), "L", "company", 0.5),
        ];

        sort_by_priority(&mut requests);
        let entities: Vec<_> = requests.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RequestStatus::Stale).unwrap();
        assert_eq!(json, "\"stale\"");
        assert_eq!(RequestStatus::parse("complete"), Some(RequestStatus::Complete));
        assert_eq!(RequestStatus::parse("done"), None);
    }
}
