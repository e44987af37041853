use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::JobError;

/// Store-assigned user identifier
pub type UserId = i32;

/// Record for `bulk-create`; the store assigns the id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub age: i32,
}

/// Partial record for `bulk-update`
///
/// `None` leaves the stored column unchanged. A JSON `null` and a missing key
/// both deserialize to `None`, so a field cannot be cleared through this path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPatch {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<i32>,
}

impl UserPatch {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            name: None,
            email: None,
            age: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn age(mut self, age: i32) -> Self {
        self.age = Some(age);
        self
    }
}

/// Queue payload: `{ "users": [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkPayload<T> {
    pub users: Vec<T>,
}

/// Job types routed by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    BulkCreate,
    BulkUpdate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::BulkCreate => "bulk-create",
            JobKind::BulkUpdate => "bulk-update",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk-create" => Ok(JobKind::BulkCreate),
            "bulk-update" => Ok(JobKind::BulkUpdate),
            other => Err(JobError::UnknownJobType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
}

/// Result reported to the queue for a successful job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub processed: usize,
    pub status: JobStatus,
}

impl JobResult {
    pub fn completed(processed: usize) -> Self {
        Self {
            processed,
            status: JobStatus::Completed,
        }
    }
}
