use axum::{Json, extract::State};
use tracing::info;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::auth::{LoginRequest, LoginResponse, LogoutResponse, SessionResponse},
    auth::{
        current_user::CurrentUser,
        middleware::RequestMeta,
        password,
        session::{CacheWrite, SessionUser},
    },
    db::{errors::DbError, handlers::Users},
    errors::Error,
    limits::RouteLimit,
};

/// Permission a role needs to open a session.
pub const LOGIN_PERMISSION: &str = "app.web.login";
pub const LOGOUT_PERMISSION: &str = "app.web.logout";

/// Per-IP budget for login attempts on top of the global IP limiter.
pub const LOGIN_LIMIT: RouteLimit = RouteLimit::per_ip("auth.login", 1.0);

/// Exchange a username and password for a session token
#[tracing::instrument(skip_all, fields(username = %request.username, ip = %meta.ip))]
pub async fn login(State(state): State<AppState>, meta: RequestMeta, Json(request): Json<LoginRequest>) -> Result<Json<LoginResponse>, Error> {
    request.validate()?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let user = Users::new(&mut conn).get_by_username(&request.username).await?;
    // The session store needs a connection of its own below
    drop(conn);

    let verified = match user.as_ref().and_then(|user| user.password_hash.clone()) {
        Some(hash) => {
            // Verify password on a blocking thread to avoid blocking async runtime
            let password = request.password.clone();
            tokio::task::spawn_blocking(move || password::verify_password(&password, &hash))
                .await
                .map_err(|e| Error::Internal {
                    operation: format!("spawn password verification task: {e}"),
                })??
        }
        None => false,
    };

    let Some(user) = user.filter(|_| verified) else {
        state
            .limiters
            .ip
            .check(&meta.ip, state.config.limits.failed_login_cost, state.clock.now())?
            .into_result()?;
        return Err(Error::InvalidLogin);
    };

    let permissions = state.sessions.expand_role(&user.role);
    if !permissions.check(LOGIN_PERMISSION).granted {
        return Err(Error::PermissionDenied {
            required: LOGIN_PERMISSION.to_string(),
        });
    }

    let session = state
        .sessions
        .create(
            Uuid::new_v4(),
            SessionUser {
                user_id: user.id,
                uuid: user.uuid,
                username: user.username,
                email: user.email,
                role: user.role,
                language: user.language,
            },
            permissions,
            meta.browser,
            CacheWrite::WriteThrough,
        )
        .await?;

    info!(user_id = session.user_id, browser = %session.browser, "User logged in");
    Ok(Json(LoginResponse::from(&*session)))
}

/// Describe the calling session
#[tracing::instrument(skip_all)]
pub async fn check(CurrentUser(session): CurrentUser) -> Json<SessionResponse> {
    Json(SessionResponse::from(&*session))
}

/// End the calling session
#[tracing::instrument(skip_all, fields(user_id = session.user_id))]
pub async fn logout(State(state): State<AppState>, CurrentUser(session): CurrentUser) -> Result<Json<LogoutResponse>, Error> {
    state.sessions.remove(session.token).await?;
    Ok(Json(LogoutResponse {
        message: "Logout successful".to_string(),
        sessions_removed: 1,
    }))
}

/// End every session of the calling user, on every browser
#[tracing::instrument(skip_all, fields(user_id = session.user_id))]
pub async fn logout_all(State(state): State<AppState>, CurrentUser(session): CurrentUser) -> Result<Json<LogoutResponse>, Error> {
    let sessions_removed = state.sessions.remove_user_sessions(session.user_id).await?;
    info!(sessions_removed, "User logged out everywhere");
    Ok(Json(LogoutResponse {
        message: "Logout successful".to_string(),
        sessions_removed,
    }))
}

#[cfg(test)]
mod tests {
    use crate::{
        auth::client_ip::FORWARDED_FOR,
        test_utils::{ManualClock, create_test_app, create_test_config, create_test_user_with_password},
    };
    use axum::http::{StatusCode, header};
    use serde_json::{Value, json};
    use std::sync::Arc;

    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn proxied_config() -> crate::config::Config {
        let mut config = create_test_config();
        config.auth.client_ip = crate::auth::client_ip::ClientIpSource::AnyProxy;
        config
    }

    #[test_log::test(tokio::test)]
    async fn test_login_check_logout_flow() {
        let (server, state) = create_test_app(proxied_config(), Arc::new(ManualClock::default())).await;
        create_test_user_with_password(&state.db, "alice", "user", "password123").await;

        let response = server
            .post("/api/v1/auth/login")
            .add_header(header::USER_AGENT, FIREFOX)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .json(&json!({"username": "alice", "password": "password123"}))
            .await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["username"], "alice");
        assert!(body["permissions"].as_array().unwrap().contains(&json!("app.web.login")));
        let token = body["token"].as_str().unwrap().to_string();

        let response = server
            .post("/api/v1/auth/check")
            .authorization_bearer(&token)
            .add_header(header::USER_AGENT, FIREFOX)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert_eq!(body["browser"], "Firefox");
        assert_eq!(body["role"], "user");
        assert_eq!(body["token"], token.as_str());

        server
            .post("/api/v1/auth/logout")
            .authorization_bearer(&token)
            .add_header(header::USER_AGENT, FIREFOX)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .await
            .assert_status_ok();

        server
            .post("/api/v1/auth/check")
            .authorization_bearer(&token)
            .add_header(header::USER_AGENT, FIREFOX)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_failed_logins_are_rate_limited() {
        let (server, state) = create_test_app(proxied_config(), Arc::new(ManualClock::default())).await;
        create_test_user_with_password(&state.db, "alice", "user", "password123").await;

        let attempt = |password: &'static str| {
            server
                .post("/api/v1/auth/login")
                .add_header(FORWARDED_FOR, "198.51.100.7")
                .json(&json!({"username": "alice", "password": password}))
        };

        // Each failure costs the request itself plus the failed login penalty
        let response = attempt("wrong-password").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"], "invalid_login");
        attempt("wrong-password").await.assert_status(StatusCode::UNAUTHORIZED);
        attempt("wrong-password").await.assert_status(StatusCode::TOO_MANY_REQUESTS);

        // Unknown users are charged the same way
        let response = server
            .post("/api/v1/auth/login")
            .add_header(FORWARDED_FOR, "198.51.100.8")
            .json(&json!({"username": "nobody", "password": "password123"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<Value>()["error"], "invalid_login");
    }

    #[tokio::test]
    async fn test_login_rejects_out_of_range_credentials() {
        let (server, _state) = create_test_app(proxied_config(), Arc::new(ManualClock::default())).await;

        let response = server
            .post("/api/v1/auth/login")
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .json(&json!({"username": "al", "password": "password123"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_role_without_login_permission_cannot_log_in() {
        let mut config = proxied_config();
        config
            .permissions
            .groups
            .insert("banned".to_string(), crate::auth::permissions::PermissionGroup::default());
        let (server, state) = create_test_app(config, Arc::new(ManualClock::default())).await;
        create_test_user_with_password(&state.db, "mallory", "banned", "password123").await;

        let response = server
            .post("/api/v1/auth/login")
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .json(&json!({"username": "mallory", "password": "password123"}))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.json::<Value>()["required"], "app.web.login");
        assert_eq!(state.sessions.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_logout_all_ends_sessions_on_every_browser() {
        let (server, state) = create_test_app(proxied_config(), Arc::new(ManualClock::default())).await;
        create_test_user_with_password(&state.db, "alice", "user", "password123").await;

        let mut tokens = Vec::new();
        for agent in [FIREFOX, CHROME] {
            let response = server
                .post("/api/v1/auth/login")
                .add_header(header::USER_AGENT, agent)
                .add_header(FORWARDED_FOR, "10.0.0.1")
                .json(&json!({"username": "alice", "password": "password123"}))
                .await;
            tokens.push(response.json::<Value>()["token"].as_str().unwrap().to_string());
        }

        let response = server
            .post("/api/v1/auth/logout/all")
            .authorization_bearer(&tokens[0])
            .add_header(header::USER_AGENT, FIREFOX)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["sessions_removed"], 2);

        server
            .post("/api/v1/auth/check")
            .authorization_bearer(&tokens[1])
            .add_header(header::USER_AGENT, CHROME)
            .add_header(FORWARDED_FOR, "10.0.0.1")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }
}
