//! Extractors for the session attached by [`crate::auth::middleware`].

use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::{
    auth::{middleware::RequestMeta, session::SessionRecord},
    errors::Error,
};

/// The authenticated session. Rejects with 401 when the route was reached without one.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Arc<SessionRecord>);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<SessionRecord>>()
            .cloned()
            .map(CurrentUser)
            .ok_or(Error::InvalidToken { message: None })
    }
}

/// The session if one is attached, for public routes.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<Arc<SessionRecord>>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(parts.extensions.get::<Arc<SessionRecord>>().cloned()))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestMeta {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestMeta>().cloned().ok_or_else(|| Error::Internal {
            operation: "read request metadata: route is missing the authorization middleware".to_string(),
        })
    }
}
