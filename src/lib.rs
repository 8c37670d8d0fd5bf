//! annokit - annotation consensus and agreement engine
//!
//! Manages per-annotator annotation requests, merges annotators' labels
//! into consensus values, measures inter-annotator agreement and exports
//! labeled training corpora.
//!
//! # Architecture
//!
//! Everything persists through the [`store::AnnotationStore`] trait:
//! - Requests and records are keyed by `(task, annotator, request_id)`
//! - Records are append-only; readers take the latest per
//!   `(annotator, entity, label)`
//! - Consensus and kappa are pure functions over fetched records
//!
//! # Modules
//!
//! - `domain`: Data structures (Task, AnnotationRequest, AnnotationRecord)
//! - `store`: Store trait and the memory, JSONL and SQLite backends
//! - `engine`: Lifecycle, consensus, agreement, export and reports
//! - `config`: Configuration discovery
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create a task and import its data
//! annokit task create Companies -e company -l HEALTHCARE,AI -a ann,ben -d data/*.jsonl
//!
//! # Queue work and annotate
//! annokit generate <task-id> ann -e company
//! annokit next <task-id> ann
//! annokit annotate <task-id> ann <request-id> 1
//!
//! # Agreement and export
//! annokit agreement <task-id>
//! annokit export <task-id> -o corpus.jsonl
//! ```

pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod store;

// Re-export main types at crate root for convenience
pub use domain::{
    AnnotationContext, AnnotationRecord, AnnotationRequest, AnnotationValue, Datapoint,
    RequestStatus, Task,
};
pub use engine::{
    AgreementMatrix, Consensus, Engine, EngineError, FailurePolicy, GenerateOptions,
    LabeledExample, Outcome, StaleSweeper, Vote,
};
pub use store::{AnnotationStore, JsonlStore, MemoryStore, SqliteStore, StoreError};
