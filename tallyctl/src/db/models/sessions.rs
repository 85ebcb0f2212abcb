//! Database models for web sessions.

use crate::types::{SessionToken, UserId};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A session row joined with the owning user, as returned by the durable session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDBResponse {
    pub token: SessionToken,
    pub user_id: UserId,
    pub browser: String,
    pub created_at: DateTime<Utc>,
    pub username: String,
    pub language: String,
    pub email: Option<String>,
    pub uuid: Uuid,
    pub role: String,
}
