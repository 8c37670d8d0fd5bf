//! Tasks and the datapoints they draw work from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::context::AnnotationContext;

/// An annotation task: which entities get which labels from whom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    pub name: String,

    /// Kind of entity being labeled (e.g. "company")
    pub entity_type: String,

    /// Active label set
    pub labels: Vec<String>,

    pub annotators: Vec<String>,

    /// Data files the datapoints were imported from
    #[serde(default)]
    pub data_files: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a generated id
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            entity_type: entity_type.into(),
            labels: Vec::new(),
            annotators: Vec::new(),
            data_files: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Use an explicit id instead of the generated one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_annotators(
        mut self,
        annotators: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.annotators = annotators.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_data_files(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.data_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Whether a request for (label, entity_type) still belongs to this task
    pub fn is_active(&self, label: &str, entity_type: &str) -> bool {
        self.has_label(label) && self.entity_type == entity_type
    }

    /// Check required fields, collecting every problem found
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [("id", &self.id), ("name", &self.name), ("entity_type", &self.entity_type)] {
            if value.trim().is_empty() {
                errors.push(FieldError::new(field, format!("Field {} is empty.", field)));
            }
        }

        if !self.id.trim().is_empty() && !is_valid_task_id(&self.id) {
            errors.push(FieldError::new(
                "id",
                format!(
                    "Field id may only contain ASCII letters, digits, '-' and '_' (got {:?}).",
                    self.id
                ),
            ));
        }

        for (field, values) in [
            ("annotators", &self.annotators),
            ("labels", &self.labels),
            ("data_files", &self.data_files),
        ] {
            if values.is_empty() {
                errors.push(FieldError::new(field, format!("Field {} is empty.", field)));
            } else if values.iter().any(|v| v.trim().is_empty()) {
                errors.push(FieldError::new(
                    field,
                    format!("Field {} contains a blank entry.", field),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TaskValidationError { errors })
        }
    }
}

/// Task ids name store directories, so they are restricted to
/// `[A-Za-z0-9_-]+`
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// One invalid task field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: String) -> Self {
        Self {
            field: field.to_string(),
            message,
        }
    }
}

/// All problems found while validating a task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TaskValidationError {
    pub errors: Vec<FieldError>,
}

impl fmt::Display for TaskValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
        write!(f, "Invalid task: {}", messages.join(" "))
    }
}

/// A candidate entity to request labels for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub entity: String,

    #[serde(default)]
    pub context: AnnotationContext,
}

impl Datapoint {
    pub fn new(entity: impl Into<String>, context: AnnotationContext) -> Self {
        Self {
            entity: entity.into(),
            context,
        }
    }

    /// Build a datapoint from a data-file line's context, if it names an entity
    pub fn from_context(context: AnnotationContext) -> Option<Self> {
        let entity = context.entity_key()?;
        Some(Self { entity, context })
    }
}
