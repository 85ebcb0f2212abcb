use axum::{Json, extract::State, http::StatusCode};
use tracing::info;

use crate::{
    AppState,
    api::models::users::{HasUsersResponse, UserCreate, UserResponse},
    auth::password,
    db::{errors::DbError, handlers::{Repository, Users}},
    errors::Error,
    limits::RouteLimit,
};

pub const REGISTER_LIMIT: RouteLimit = RouteLimit::per_ip("users.register", 20.0);
pub const FIRST_ADMIN_LIMIT: RouteLimit = RouteLimit::per_ip("users.first_admin", 20.0);
pub const HAS_USERS_LIMIT: RouteLimit = RouteLimit::per_ip("users.exists", 10.0);

async fn hash_password(state: &AppState, password: String) -> Result<String, Error> {
    let params = state.config.auth.password.argon2_params();
    // Hash on a blocking thread to avoid blocking async runtime
    tokio::task::spawn_blocking(move || password::hash_password_with_params(&password, Some(params)))
        .await
        .map_err(|e| Error::Internal {
            operation: format!("spawn password hashing task: {e}"),
        })?
}

/// Create an account in the configured default group
#[tracing::instrument(skip_all, fields(username = %request.username))]
pub async fn register(State(state): State<AppState>, Json(request): Json<UserCreate>) -> Result<(StatusCode, Json<UserResponse>), Error> {
    if !state.config.auth.allow_registration {
        return Err(Error::BadRequest {
            message: "User registration is disabled".to_string(),
        });
    }
    request.validate()?;

    let password_hash = hash_password(&state, request.password.clone()).await?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let user = Users::new(&mut conn)
        .create(&request.into_db_request(password_hash, state.sessions.default_role()))
        .await?;

    info!(user_id = user.id, role = %user.role, "User registered");
    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

/// Create the first account, in the admin group. Only available while no account exists.
#[tracing::instrument(skip_all, fields(username = %request.username))]
pub async fn create_first_admin(State(state): State<AppState>, Json(request): Json<UserCreate>) -> Result<(StatusCode, Json<UserResponse>), Error> {
    request.validate()?;

    let password_hash = hash_password(&state, request.password.clone()).await?;
    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    let mut users = Users::new(&mut tx);
    if users.count().await? > 0 {
        return Err(Error::Conflict {
            message: "Users already exist".to_string(),
        });
    }
    let user = users
        .create(&request.into_db_request(password_hash, &state.config.permissions.admin_group))
        .await?;
    tx.commit().await.map_err(DbError::from)?;

    info!(user_id = user.id, role = %user.role, "First administrator created");
    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

/// Whether any account exists yet
#[tracing::instrument(skip_all)]
pub async fn has_users(State(state): State<AppState>) -> Result<Json<HasUsersResponse>, Error> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let count = Users::new(&mut conn).count().await?;
    Ok(Json(HasUsersResponse { has_users: count > 0 }))
}
