//! Common type definitions shared across the auth core and the database layer.
//!
//! # ID Types
//!
//! - [`UserId`]: Internal integer key of a user row
//! - [`SessionToken`]: Opaque bearer token handed out on login (always a UUIDv4)
//!
//! # Utility Functions
//!
//! - [`abbrev_token`]: Abbreviate tokens to first 8 chars for logging
//! - [`parse_session_token`]: Strict UUIDv4 validation for bearer tokens

use uuid::{Uuid, Version};

// Type aliases for IDs
pub type UserId = i64;
pub type SessionToken = Uuid;

/// Abbreviate a token to its first 8 characters so full bearer tokens never end up in logs.
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_token(token: &SessionToken) -> String {
    token.to_string().chars().take(8).collect()
}

/// Parse a bearer token, accepting only well-formed version 4 UUIDs.
pub fn parse_session_token(raw: &str) -> Option<SessionToken> {
    let token = Uuid::parse_str(raw.trim()).ok()?;
    (token.get_version() == Some(Version::Random)).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev_token() {
        let token = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_token(&token), "550e8400");
    }

    #[test]
    fn test_parse_session_token_accepts_v4() {
        let token = Uuid::new_v4();
        assert_eq!(parse_session_token(&token.to_string()), Some(token));
    }

    #[test]
    fn test_parse_session_token_rejects_other_versions_and_garbage() {
        // Version 1 (time based) UUID
        assert_eq!(parse_session_token("c232ab00-9414-11ec-b3c8-9f6bdeced846"), None);
        assert_eq!(parse_session_token(&Uuid::nil().to_string()), None);
        assert_eq!(parse_session_token("not-a-token"), None);
        assert_eq!(parse_session_token(""), None);
    }
}
