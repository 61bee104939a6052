//! Durable-workflow gateway and the permission-tagged task tracker.
//!
//! The engine behind [`WorkflowEngine`] is opaque to the rest of the
//! system; workflow ids are string handles. The tracker records enough
//! permission tags in the KV store for non-admins to observe exactly the
//! workflows they are allowed to see.

pub mod engine;
pub mod tracker;

pub use engine::{
    LocalWorkflowEngine, SharedEngine, TaskInfo, TaskResult, TaskState, TaskSubmission,
    WorkflowEngine,
};
pub use tracker::{TaskTracker, TaskTrackerEntry, TASK_TTL};
pub use tutor_test::{TutorTestStatus, TutorTestStore};
