//! `queue` crate: message transport between engine instances.
//!
//! An [`EventLog`] is an append-only, ordered stream of keyed JSON records.
//! Consumers in a named group read from their committed checkpoint, so a
//! listener that restarts resumes where its group left off.  Delivery is
//! at-least-once: a record is committed only after its listener accepted it.

pub mod consumer;
pub mod error;
pub mod log;

pub use consumer::{Consumer, ConsumerConfig, MessageListener};
pub use error::QueueError;
pub use log::{EventLog, LogRecord};
