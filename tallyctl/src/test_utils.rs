//! Test utilities for integration testing (available with `test-utils` feature).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use axum_test::TestServer;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use uuid::Uuid;

use crate::{
    AppState,
    auth::{
        password::{Argon2Params, hash_password_with_params},
        permissions::PermissionGroups,
        session::{CacheWrite, SessionStore, SessionUser},
    },
    clock::Clock,
    config::{Config, PermissionsConfig},
    db::{
        errors::Result as DbResult,
        handlers::{Repository, Users},
        models::{sessions::SessionDBResponse, users::UserCreateDBRequest, users::UserDBResponse},
    },
    types::{SessionToken, UserId},
};

/// A migrated in-memory database.
///
/// Every SQLite in-memory connection is its own database, so the pool is pinned to a single
/// connection that is never recycled.
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    crate::migrator().run(&pool).await.expect("Failed to run migrations");
    pool
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        enable_metrics: false,
        ..Default::default()
    };
    config.database.url = "sqlite::memory:".to_string();
    config.limits.sweep.enabled = false;
    config.auth.password.argon2_memory_kib = 1024;
    config.auth.password.argon2_iterations = 1;
    config
}

/// Clock that only moves when told to. Starts at 2025-01-01T00:00:00Z.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Session store wrapper counting durable reads and writes.
#[derive(Debug)]
pub struct CountingStore<S> {
    inner: S,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Creates and deletes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl<S: SessionStore> SessionStore for CountingStore<S> {
    async fn create_session(&self, token: SessionToken, user_id: UserId, browser: &str, created_at: DateTime<Utc>) -> DbResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.create_session(token, user_id, browser, created_at).await
    }

    async fn get_session(&self, token: SessionToken) -> DbResult<Option<SessionDBResponse>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_session(token).await
    }

    async fn delete_session(&self, token: SessionToken) -> DbResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_session(token).await
    }

    async fn delete_sessions_for_user(&self, user_id: UserId) -> DbResult<Vec<SessionToken>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_sessions_for_user(user_id).await
    }
}

/// The default permission groups (`app`, `user`, `admin`, `root`).
pub fn test_permission_groups() -> PermissionGroups {
    PermissionsConfig::default()
        .build_groups()
        .expect("Default permission groups are valid")
}

pub async fn create_test_user(pool: &SqlitePool, username: &str, role: &str) -> UserDBResponse {
    insert_user(pool, username, role, None).await
}

/// A user that can log in with `password`. Hashed with cheap parameters to keep tests fast.
pub async fn create_test_user_with_password(pool: &SqlitePool, username: &str, role: &str, password: &str) -> UserDBResponse {
    let params = Argon2Params {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };
    let hash = hash_password_with_params(password, Some(params)).expect("Failed to hash password");
    insert_user(pool, username, role, Some(hash)).await
}

async fn insert_user(pool: &SqlitePool, username: &str, role: &str, password_hash: Option<String>) -> UserDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Users::new(&mut conn)
        .create(&UserCreateDBRequest {
            username: username.to_string(),
            email: Some(format!("{username}@example.com")),
            password_hash,
            role: role.to_string(),
            language: "en".to_string(),
        })
        .await
        .expect("Failed to create test user")
}

/// Application state over a fresh in-memory database, driven by `clock`.
pub async fn create_test_state(config: Config, clock: Arc<ManualClock>) -> AppState {
    let pool = create_test_pool().await;
    AppState::assemble(pool, config, clock).expect("Failed to assemble test state")
}

/// Create a user with `role` and a persisted session for it from `browser`.
pub async fn login_session(state: &AppState, username: &str, role: &str, browser: &str) -> SessionToken {
    let user = create_test_user(&state.db, username, role).await;
    let token = Uuid::new_v4();
    state
        .sessions
        .create(
            token,
            SessionUser {
                user_id: user.id,
                uuid: user.uuid,
                username: user.username,
                email: user.email,
                role: user.role,
                language: user.language,
            },
            state.sessions.expand_role(role),
            browser.to_string(),
            CacheWrite::WriteThrough,
        )
        .await
        .expect("Failed to create test session");
    token
}

/// The full router over a fresh test state.
pub async fn create_test_app(config: Config, clock: Arc<ManualClock>) -> (TestServer, AppState) {
    let state = create_test_state(config, clock).await;
    let server = TestServer::new(crate::build_router(&state)).expect("Failed to create test server");
    (server, state)
}
