//! Per-request authorization.
//!
//! [`RequestAuthorizer`] runs once per inbound request:
//!
//! 1. resolve the client IP and charge the IP limiter the request cost
//! 2. read the bearer token; routes without a required permission pass through without one
//! 3. look the session up, rejecting unknown tokens and charging the IP limiter extra for them
//! 4. reject and remove sessions bound to another browser or older than `session_max_age`
//! 5. check the route's required permission against the session's effective permissions
//!
//! Routes opt in with [`require`] or [`public`]:
//!
//! ```ignore
//! Router::new()
//!     .route("/api/v1/auth/check", post(check))
//!     .route_layer(from_fn_with_state(state.clone(), require("app.web.login")))
//! ```
//!
//! The resolved [`RequestMeta`] and, when authenticated, the `Arc<SessionRecord>` are attached as
//! request extensions for the [`current_user`](crate::auth::current_user) extractors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use futures::future::BoxFuture;
use tracing::{debug, info, instrument};

use crate::{
    AppState,
    auth::{
        client_ip::{ClientIpSource, resolve_client_ip},
        session::{SessionCache, SessionRecord},
        utils::{BearerToken, request_fingerprint},
    },
    clock::Clock,
    config::Config,
    errors::{Error, Result},
    limits::Limiters,
    types::abbrev_token,
};

/// Client details resolved for every request that passes the IP limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: String,
    /// Browser family derived from the User-Agent
    pub browser: String,
}

/// Result of a successful authorization.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub meta: RequestMeta,
    /// `None` on public routes called without a usable token.
    pub session: Option<Arc<SessionRecord>>,
}

#[derive(Debug)]
pub struct RequestAuthorizer {
    sessions: Arc<SessionCache>,
    limiters: Limiters,
    clock: Arc<dyn Clock>,
    client_ip: ClientIpSource,
    session_max_age: Option<Duration>,
    request_cost: f64,
    invalid_token_cost: f64,
}

impl RequestAuthorizer {
    pub fn new(sessions: Arc<SessionCache>, limiters: Limiters, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            sessions,
            limiters,
            clock,
            client_ip: config.auth.client_ip,
            session_max_age: config.auth.session_max_age,
            request_cost: config.limits.request_cost,
            invalid_token_cost: config.limits.invalid_token_cost,
        }
    }

    /// Authorize a request for a route requiring `required`, or a public route if `None`.
    pub async fn authorize(&self, required: Option<&str>, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<Authorized> {
        let result = self.evaluate(required, headers, peer).await;
        let outcome = match &result {
            Ok(Authorized { session: Some(_), .. }) => "authorized",
            Ok(Authorized { session: None, .. }) => "anonymous",
            Err(e) => e.reason_code(),
        };
        metrics::counter!("tally_auth_decisions_total", "outcome" => outcome).increment(1);
        result
    }

    #[instrument(skip_all, fields(required = required.unwrap_or("-")))]
    async fn evaluate(&self, required: Option<&str>, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<Authorized> {
        let ip = resolve_client_ip(self.client_ip, headers, peer);
        let now = self.clock.now();
        self.limiters.ip.check(&ip, self.request_cost, now)?.into_result()?;

        let meta = RequestMeta {
            ip,
            browser: request_fingerprint(headers),
        };

        let token = match BearerToken::from_headers(headers) {
            BearerToken::Valid(token) => token,
            BearerToken::Missing | BearerToken::Malformed if required.is_none() => {
                return Ok(Authorized { meta, session: None });
            }
            BearerToken::Missing => {
                return Err(Error::InvalidToken {
                    message: Some("Missing bearer token".to_string()),
                });
            }
            BearerToken::Malformed => {
                return Err(Error::InvalidToken {
                    message: Some("Malformed bearer token".to_string()),
                });
            }
        };

        let Some(session) = self.sessions.lookup(token).await? else {
            debug!(ip = %meta.ip, token = %abbrev_token(&token), "Unknown session token");
            self.limiters.ip.check(&meta.ip, self.invalid_token_cost, now)?.into_result()?;
            return Err(Error::InvalidToken { message: None });
        };

        if session.browser != meta.browser {
            info!(
                user_id = session.user_id,
                expected = %session.browser,
                actual = %meta.browser,
                "Session used from a different browser, revoking"
            );
            self.sessions.remove(token).await?;
            return Err(Error::InvalidToken { message: None });
        }

        if let Some(max_age) = self.session_max_age
            && chrono::Duration::from_std(max_age).is_ok_and(|max_age| now.signed_duration_since(session.created_at) > max_age)
        {
            debug!(user_id = session.user_id, "Session expired, revoking");
            self.sessions.remove(token).await?;
            return Err(Error::InvalidToken {
                message: Some("Session expired".to_string()),
            });
        }

        if let Some(required) = required {
            let check = session.permissions.check(required);
            if !check.granted {
                return Err(Error::PermissionDenied {
                    required: required.to_string(),
                });
            }
            debug!(user_id = session.user_id, rule = ?check.matched_rule, "Permission granted");
        }

        Ok(Authorized {
            meta,
            session: Some(session),
        })
    }
}

async fn authorize_request(state: AppState, required: Option<&'static str>, mut request: Request, next: Next) -> Result<Response> {
    let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
    let authorized = state.authorizer.authorize(required, request.headers(), peer).await?;

    request.extensions_mut().insert(authorized.meta);
    if let Some(session) = authorized.session {
        request.extensions_mut().insert(session);
    }
    Ok(next.run(request).await)
}

/// Middleware admitting only sessions granted `permission`, for use with
/// [`axum::middleware::from_fn_with_state`].
pub fn require(permission: &'static str) -> impl Fn(State<AppState>, Request, Next) -> BoxFuture<'static, Result<Response>> + Clone + Send + Sync + 'static {
    move |State(state): State<AppState>, request: Request, next: Next| -> BoxFuture<'static, Result<Response>> {
        Box::pin(authorize_request(state, Some(permission), request, next))
    }
}

/// Middleware for public routes: anonymous requests pass, and a valid token still attaches its
/// session.
pub fn public() -> impl Fn(State<AppState>, Request, Next) -> BoxFuture<'static, Result<Response>> + Clone + Send + Sync + 'static {
    move |State(state): State<AppState>, request: Request, next: Next| -> BoxFuture<'static, Result<Response>> {
        Box::pin(authorize_request(state, None, request, next))
    }
}
