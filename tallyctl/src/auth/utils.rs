//! Authentication utility functions.

use axum::http::{HeaderMap, header};

use crate::types::{SessionToken, parse_session_token};

/// Raw bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Outcome of reading the bearer token from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerToken {
    Missing,
    Malformed,
    Valid(SessionToken),
}

impl BearerToken {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match bearer_token(headers) {
            None => Self::Missing,
            Some(raw) => parse_session_token(raw).map_or(Self::Malformed, Self::Valid),
        }
    }
}

/// Coarse browser family from a User-Agent string, bound to a session at login.
///
/// Order matters: Edge and Opera also advertise `Chrome/`, and Chrome advertises `Safari/`.
pub fn browser_fingerprint(user_agent: Option<&str>) -> String {
    let Some(ua) = user_agent else {
        return "unknown".to_string();
    };
    let family = if ua.contains("Edg/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Chrome/") {
        "Chrome"
    } else if ua.contains("Firefox/") {
        "Firefox"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "unknown"
    };
    family.to_string()
}

/// [`browser_fingerprint`] of a request's `User-Agent` header.
pub fn request_fingerprint(headers: &HeaderMap) -> String {
    browser_fingerprint(headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()))
}
