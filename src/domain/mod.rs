//! Domain types for the annotation engine.
//!
//! This module contains the core data structures:
//! - Task / Datapoint: what is being labeled, by whom
//! - AnnotationRequest: a unit of assigned work
//! - AnnotationRecord: an annotator's answer
//! - AnnotationContext: payload carried from request to record

pub mod context;
pub mod record;
pub mod request;
pub mod task;

// Re-export commonly used types
pub use context::{AnnotationContext, EntityMeta};
pub use record::{latest_by_entity_label, AnnotationRecord, AnnotationValue, InvalidValue, NOT_ANNOTATED};
pub use request::{sort_by_priority, AnnotationRequest, RequestStatus};
pub use task::{is_valid_task_id, Datapoint, FieldError, Task, TaskValidationError};
