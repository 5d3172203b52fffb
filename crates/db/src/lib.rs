//! `db` crate: pure persistence layer.
//!
//! Provides the shared document store, typed record structs, the field-path
//! patch primitive, and repository functions for every collection the
//! orchestrator keeps.  No orchestration logic lives here.

pub mod error;
pub mod models;
pub mod patch;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use patch::{FieldPatch, PatchOp};
pub use pool::{create_pool, DbPool};
