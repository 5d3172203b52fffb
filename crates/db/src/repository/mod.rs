//! Repository functions: one function per store operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No orchestration logic beyond the guarded transitions the records need.

pub mod node_executions;
pub mod outcomes;
pub mod plan_executions;
pub mod summaries;
