//! Database models for users.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Database request for creating a new user
#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub username: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    /// Permission group name, see [`crate::auth::permissions::PermissionGroups::default_group`]
    pub role: String,
    pub language: String,
}

/// Database response for a user
#[derive(Debug, Clone)]
pub struct UserDBResponse {
    pub id: UserId,
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub role: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
}
