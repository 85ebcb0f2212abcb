//! Login, session and logout payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::session::SessionRecord, errors::Error, types::SessionToken};

pub const USERNAME_LENGTH: std::ops::RangeInclusive<usize> = 3..=30;
pub const PASSWORD_LENGTH: std::ops::RangeInclusive<usize> = 8..=56;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    /// Reject credentials that could never match a stored account before touching the database.
    pub fn validate(&self) -> Result<(), Error> {
        validate_credentials(&self.username, &self.password)
    }
}

/// Length bounds shared by login and account creation, counted in characters.
pub fn validate_credentials(username: &str, password: &str) -> Result<(), Error> {
    if !USERNAME_LENGTH.contains(&username.chars().count()) {
        return Err(Error::BadRequest {
            message: format!(
                "Username must be between {} and {} characters",
                USERNAME_LENGTH.start(),
                USERNAME_LENGTH.end()
            ),
        });
    }
    if !PASSWORD_LENGTH.contains(&password.chars().count()) {
        return Err(Error::BadRequest {
            message: format!(
                "Password must be between {} and {} characters",
                PASSWORD_LENGTH.start(),
                PASSWORD_LENGTH.end()
            ),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: SessionToken,
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub permissions: Vec<String>,
    pub language: String,
}

impl From<&SessionRecord> for LoginResponse {
    fn from(session: &SessionRecord) -> Self {
        Self {
            token: session.token,
            uuid: session.uuid,
            username: session.username.clone(),
            email: session.email.clone(),
            permissions: session.permissions.as_slice().to_vec(),
            language: session.language.clone(),
        }
    }
}

/// The calling session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: SessionToken,
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub browser: String,
    pub permissions: Vec<String>,
    pub language: String,
}

impl From<&SessionRecord> for SessionResponse {
    fn from(session: &SessionRecord) -> Self {
        Self {
            token: session.token,
            uuid: session.uuid,
            username: session.username.clone(),
            email: session.email.clone(),
            role: session.role.clone(),
            browser: session.browser.clone(),
            permissions: session.permissions.as_slice().to_vec(),
            language: session.language.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub message: String,
    /// Number of sessions ended by this call
    pub sessions_removed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_login_request_length_bounds() {
        assert!(request("bob", "12345678").validate().is_ok());
        assert!(request(&"a".repeat(30), &"p".repeat(56)).validate().is_ok());

        assert!(matches!(request("bo", "12345678").validate(), Err(Error::BadRequest { .. })));
        assert!(matches!(request(&"a".repeat(31), "12345678").validate(), Err(Error::BadRequest { .. })));
        assert!(matches!(request("bob", "1234567").validate(), Err(Error::BadRequest { .. })));
        assert!(matches!(request("bob", &"p".repeat(57)).validate(), Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_lengths_count_characters_not_bytes() {
        // Three characters, six bytes
        assert!(request("äöü", "12345678").validate().is_ok());
    }
}
