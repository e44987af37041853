//! Bulk job handling
//!
//! - `bulk_create`: chunked multi-row INSERT
//! - `bulk_update`: chunked merge UPDATE
//! - `transaction`: one transaction around all chunks of a job
//! - `dispatcher`: routes deliveries and reports outcomes to the queue

use crate::models::UserId;

pub mod bulk_create;
pub mod bulk_update;
pub mod dispatcher;
pub mod transaction;

pub use dispatcher::Dispatcher;
pub use transaction::{execute, BulkOperation};

/// Default number of records per statement
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Effect of a committed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Records submitted by the job
    pub processed: usize,
    /// Ids created or matched, in statement order
    pub affected_ids: Vec<UserId>,
}
