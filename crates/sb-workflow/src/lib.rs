//! SyncBridge Workflow Engine
//!
//! Durable orchestration of multi-step business operations:
//! - WorkflowOrchestrator: drives a declared activity sequence, persisting
//!   progress after every attempt so a restart resumes instead of restarting
//! - WorkerPool: bounded-concurrency activity executor with per-task timeout
//! - TaskQueue: bounded queue with lease-based reclaim of abandoned tasks
//! - Activity/WorkflowDefinition: the seams business operations plug into
//!
//! Activities report explicit outcomes (SUCCESS / RETRYABLE_FAILURE /
//! FATAL_FAILURE); retriability is never inferred from error types. Every
//! retry of an activity carries the same idempotency key as the first
//! attempt, so external effects can detect and no-op duplicates.

pub mod activity;
pub mod definition;
pub mod execution;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod worker;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use activity::{Activity, ActivityContext, ActivityOutcome, ActivityRegistry};
pub use definition::{ActivityStep, Decision, WorkflowDefinition, WorkflowRegistry};
pub use execution::{
    has_succeeded, latest_success, ActivityInvocation, WorkflowExecution, WorkflowState,
};
pub use orchestrator::WorkflowOrchestrator;
pub use queue::{ActivityTask, TaskQueue, TaskQueueStats};
pub use store::{InMemoryWorkflowStore, WorkflowStore};
pub use worker::{TaskCompletion, WorkerPool};
