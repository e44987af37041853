//! Bulk user operations worker
//!
//! Pulls `bulk-create` / `bulk-update` jobs from the durable queue and applies
//! them to the `users` table in chunked, multi-row statements. Every chunk of a
//! job runs inside one transaction, so a job either lands completely or not at
//! all. After commit, the cached `user:{id}` entries of every touched row are
//! invalidated in the background.
//!
//! ```text
//! queue ──► Worker slot ──► Dispatcher ──► bulk_create / bulk_update
//!                                │                 │ (chunks of ≤ 100)
//!                                │                 ▼
//!                                │           UserStoreTx (one per job)
//!                                ▼
//!                    complete / fail ──► queue retry policy
//!                                │
//!                                └──► InvalidationHook (after commit)
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod worker;

pub use config::Config;
pub use error::{ConfigError, JobError, StoreError};
pub use jobs::Dispatcher;
pub use worker::Worker;

/// Service name used in logs, metrics, and invalidation messages
pub const SERVICE_NAME: &str = "user-ops-worker";
