//! # Image Build Orchestration
//!
//! [`rbac`] makes sure the namespace-scoped build service account exists;
//! [`orchestrator`] submits and supervises the Kaniko jobs that turn a
//! stored build context into a pushed image.

pub mod orchestrator;
pub mod rbac;

pub use orchestrator::{BuildOrchestrator, BuildStatus};
