//! # tallyctl: Authorization and Session Control
//!
//! `tallyctl` is the gatekeeper in front of the Tally ledger API. Every request that reaches a
//! handler has been rate limited by client IP, matched to a session by its bearer token, and
//! checked against the permission its route declares.
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer and
//! uses SQLite (through `sqlx`) as the durable session store. Sessions live in memory in front of
//! the store and are read through on a miss, so a restart or a cache wipe never logs anyone out.
//!
//! ### Request Flow
//!
//! Each route is wrapped in [`auth::middleware::require`] (or [`auth::middleware::public`]),
//! which hands the request to the [`auth::middleware::RequestAuthorizer`]:
//!
//! 1. The client IP is resolved according to `auth.client_ip` and charged to the IP
//!    [`limits::RateLimiter`]. Over the threshold the request gets a 429 with `Retry-After`.
//! 2. The bearer token is looked up in the [`auth::session::SessionCache`]. Unknown tokens are
//!    charged extra so token guessing trips the limiter quickly.
//! 3. The session must come from the browser family it was created in.
//! 4. The route's permission is checked against the session's effective permissions, expanded
//!    once at login from the configured permission groups.
//!
//! ### Core Components
//!
//! - [`api`]: Login, logout, registration and cache administration handlers
//! - [`auth`]: Permission grammar, sessions, client IPs and the authorization middleware
//! - [`limits`]: Leaky-bucket rate limiters
//! - [`db`]: Users and sessions in SQLite
//! - [`config`]: YAML plus environment configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use tallyctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = tallyctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     tallyctl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Database Setup
//!
//! Migrations are embedded and run on startup:
//!
//! ```no_run
//! # use sqlx::SqlitePool;
//! # async fn example(pool: SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
//! tallyctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod limits;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use bon::Builder;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::{net::TcpListener, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, instrument};

pub use config::Config;
pub use types::{SessionToken, UserId};

use crate::{
    api::handlers::{admin, auth as auth_handlers, users as user_handlers},
    auth::{
        middleware::{RequestAuthorizer, public, require},
        password,
        session::SessionCache,
    },
    clock::{Clock, SystemClock},
    config::SweepConfig,
    db::{
        handlers::{Repository, Sessions, Users},
        models::users::UserCreateDBRequest,
    },
    errors::Error,
    limits::{Limiters, route_limit},
};

/// Application state shared across all request handlers and middleware.
///
/// # Fields
///
/// - `db`: SQLite connection pool backing users and durable sessions
/// - `config`: Application configuration loaded from file/environment
/// - `sessions`: The in-memory session cache in front of the durable store
/// - `limiters`: IP and per-route rate limiters
/// - `authorizer`: Per-request authorization, shared by every route middleware
/// - `clock`: Time source for rate decay and session timestamps
/// - `metrics_recorder`: Prometheus handle (when metrics are enabled)
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Config,
    pub sessions: Arc<SessionCache>,
    pub limiters: Limiters,
    pub authorizer: Arc<RequestAuthorizer>,
    pub clock: Arc<dyn Clock>,
    pub metrics_recorder: Option<PrometheusHandle>,
}

impl AppState {
    /// Assemble the auth core over `db`: permission groups, session cache, limiters and the
    /// authorizer that ties them together.
    ///
    /// # Errors
    ///
    /// Returns an error if the permission group configuration is invalid.
    pub fn assemble(db: SqlitePool, config: Config, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let groups = Arc::new(config.permissions.build_groups()?);
        let sessions = Arc::new(
            SessionCache::builder()
                .store(Arc::new(Sessions::new(db.clone())))
                .permissions(groups)
                .clock(clock.clone())
                .app_permissions(config.permissions.app_permissions.clone())
                .store_timeout(config.auth.store_timeout)
                .max_sessions(config.auth.max_cached_sessions)
                .build(),
        );
        let limiters = Limiters::new(&config.limits);
        let authorizer = Arc::new(RequestAuthorizer::new(sessions.clone(), limiters.clone(), clock.clone(), &config));

        Ok(AppState::builder()
            .db(db)
            .config(config)
            .sessions(sessions)
            .limiters(limiters)
            .authorizer(authorizer)
            .clock(clock)
            .build())
    }
}

/// Get the tallyctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the initial admin user if it doesn't exist.
///
/// Idempotent: an existing user keeps its id and role, and only has its password replaced.
///
/// # Returns
///
/// Returns the user ID of the created or existing admin user.
#[instrument(skip_all, fields(username = %username))]
pub async fn create_initial_admin_user(username: &str, password: &str, role: &str, db: &SqlitePool) -> Result<UserId, sqlx::Error> {
    let password_hash =
        password::hash_password(password).map_err(|e| sqlx::Error::Encode(format!("Failed to hash admin password: {e}").into()))?;

    let mut tx = db.begin().await?;
    let mut user_repo = Users::new(&mut tx);

    if let Some(existing_user) = user_repo
        .get_by_username(username)
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("Failed to check existing user: {e}")))?
    {
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(&password_hash)
            .bind(existing_user.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(existing_user.id);
    }

    let created_user = user_repo
        .create(&UserCreateDBRequest {
            username: username.to_string(),
            email: None,
            password_hash: Some(password_hash),
            role: role.to_string(),
            language: "en".to_string(),
        })
        .await
        .map_err(|e| sqlx::Error::Protocol(format!("Failed to create admin user: {e}")))?;

    tx.commit().await?;
    info!(user_id = created_user.id, "Created initial admin user");
    Ok(created_user.id)
}

/// Open the pool, run migrations and seed the admin user.
async fn setup_database(config: &Config) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database.url)?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.pool.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.pool.acquire_timeout_secs))
        .connect_with(options)
        .await?;

    migrator().run(&pool).await?;

    if let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password) {
        create_initial_admin_user(username, password, &config.permissions.admin_group, &pool).await?;
    }

    Ok(pool)
}

/// Install the global Prometheus recorder once per process and return its handle.
fn prometheus_handle() -> anyhow::Result<PrometheusHandle> {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Build the HTTP router.
///
/// Every route under `/api/v1` declares its permission (or that it is public) with a route
/// layer; nothing is reachable without passing the [`RequestAuthorizer`].
pub fn build_router(state: &AppState) -> Router {
    // Layers run outermost-last: the authorizer charges the IP before the login route limit
    let login = Router::new()
        .route("/auth/login", post(auth_handlers::login))
        .route_layer(from_fn_with_state(state.clone(), route_limit(auth_handlers::LOGIN_LIMIT)))
        .route_layer(from_fn_with_state(state.clone(), public()));

    let register = Router::new()
        .route("/users", post(user_handlers::register))
        .route_layer(from_fn_with_state(state.clone(), route_limit(user_handlers::REGISTER_LIMIT)))
        .route_layer(from_fn_with_state(state.clone(), public()));

    let first_admin = Router::new()
        .route("/users/admin", post(user_handlers::create_first_admin))
        .route_layer(from_fn_with_state(state.clone(), route_limit(user_handlers::FIRST_ADMIN_LIMIT)))
        .route_layer(from_fn_with_state(state.clone(), public()));

    let has_users = Router::new()
        .route("/users/exists", get(user_handlers::has_users))
        .route_layer(from_fn_with_state(state.clone(), route_limit(user_handlers::HAS_USERS_LIMIT)))
        .route_layer(from_fn_with_state(state.clone(), public()));

    let check = Router::new()
        .route("/auth/check", post(auth_handlers::check))
        .route_layer(from_fn_with_state(state.clone(), require(auth_handlers::LOGIN_PERMISSION)));

    let logout = Router::new()
        .route("/auth/logout", post(auth_handlers::logout))
        .route("/auth/logout/all", post(auth_handlers::logout_all))
        .route_layer(from_fn_with_state(state.clone(), require(auth_handlers::LOGOUT_PERMISSION)));

    let cache_read = Router::new()
        .route("/admin/cache", get(admin::get_cache))
        .route_layer(from_fn_with_state(state.clone(), require(admin::CACHE_READ_PERMISSION)));

    let cache_write = Router::new()
        .route("/admin/cache", delete(admin::wipe_cache))
        .route_layer(from_fn_with_state(state.clone(), require(admin::CACHE_WRITE_PERMISSION)));

    let api = login
        .merge(register)
        .merge(first_admin)
        .merge(has_users)
        .merge(check)
        .merge(logout)
        .merge(cache_read)
        .merge(cache_write);

    let mut router = Router::new().nest("/api/v1", api).route("/healthz", get(|| async { "OK" }));

    if let Some(handle) = state.metrics_recorder.clone() {
        router = router.route(
            "/internal/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.with_state(state.clone()).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    )
}

/// Background tasks that run alongside the HTTP server.
///
/// Currently the rate bucket sweeper, which drops drained buckets so the limiters do not grow
/// with every IP ever seen. When dropped, the `drop_guard` cancels the shutdown token.
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    fn start(state: &AppState) -> Self {
        let shutdown_token = CancellationToken::new();
        let mut background_tasks = Vec::new();

        if state.config.limits.sweep.enabled {
            background_tasks.push(spawn_rate_sweeper(
                state.limiters.clone(),
                state.clock.clone(),
                state.config.limits.sweep.clone(),
                shutdown_token.clone(),
            ));
        }

        Self {
            background_tasks,
            drop_guard: Some(shutdown_token.clone().drop_guard()),
            shutdown_token,
        }
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            if let Err(e) = handle.await {
                tracing::warn!("Background task failed during shutdown: {}", e);
            }
        }
    }
}

fn spawn_rate_sweeper(limiters: Limiters, clock: Arc<dyn Clock>, config: SweepConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Rate bucket sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let removed = limiters.sweep(clock.now(), config.retention);
                    if removed > 0 {
                        debug!(removed, "Swept drained rate buckets");
                    }
                }
            }
        }
    })
}

pub struct Application {
    router: Router,
    config: Config,
    pool: SqlitePool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting tallyctl with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;

        let mut app_state = AppState::assemble(pool.clone(), config.clone(), Arc::new(SystemClock))?;
        if config.enable_metrics {
            app_state.metrics_recorder = Some(prometheus_handle()?);
        }

        let bg_services = BackgroundServices::start(&app_state);
        let router = build_router(&app_state);

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "tallyctl listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        // Connect info gives the direct client IP policy its peer address
        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{ManualClock, create_test_config, create_test_pool};
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    fn app_config(admin_password: &str) -> Config {
        let mut config = create_test_config();
        config.database.url = "sqlite::memory:".to_string();
        config.database.pool.max_connections = 1;
        config.admin_username = Some("operator".to_string());
        config.admin_password = Some(admin_password.to_string());
        config.limits.sweep.enabled = true;
        config
    }

    #[test_log::test(tokio::test)]
    async fn test_application_seeds_admin_and_serves_login() {
        let app = Application::new(app_config("operator-password")).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        server.get("/healthz").await.assert_text("OK");

        let response = server
            .post("/api/v1/auth/login")
            .json(&json!({"username": "operator", "password": "operator-password"}))
            .await;
        response.assert_status_ok();
        let token = response.json::<Value>()["token"].as_str().unwrap().to_string();

        let response = server.get("/api/v1/admin/cache").authorization_bearer(&token).await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["sessions"]["sessions"], 1);

        bg_services.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_routes_are_not_found() {
        let app = Application::new(app_config("operator-password")).await.unwrap();
        let (server, _bg_services) = app.into_test_server();

        server.get("/api/v1/nope").await.assert_status(StatusCode::NOT_FOUND);
        server.get("/admin/cache").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_initial_admin_user_is_idempotent() {
        let pool = create_test_pool().await;

        let first = create_initial_admin_user("operator", "first-password", "admin", &pool).await.unwrap();
        let second = create_initial_admin_user("operator", "second-password", "admin", &pool).await.unwrap();
        assert_eq!(first, second);

        let mut conn = pool.acquire().await.unwrap();
        let user = Users::new(&mut conn).get_by_username("operator").await.unwrap().unwrap();
        assert_eq!(user.role, "admin");
        assert!(password::verify_password("second-password", user.password_hash.as_deref().unwrap()).unwrap());
        assert_eq!(Users::new(&mut conn).count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_permission_config_fails_assembly() {
        let pool = create_test_pool().await;
        let mut config = create_test_config();
        config.permissions.groups.insert(
            "user".to_string(),
            crate::auth::permissions::PermissionGroup::new(["web.user.*"], ["missing"]),
        );

        let result = AppState::assemble(pool, config, Arc::new(SystemClock));
        assert!(matches!(result, Err(Error::Internal { .. })));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_only_when_enabled() {
        let pool = create_test_pool().await;
        let state = AppState::assemble(pool, create_test_config(), Arc::new(SystemClock)).unwrap();
        let server = axum_test::TestServer::new(build_router(&state)).unwrap();
        server.get("/internal/metrics").await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sweeper_drops_drained_buckets_until_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let limiters = Limiters::new(&create_test_config().limits);
        limiters.ip.check("203.0.113.1", 1.0, clock.now()).unwrap();
        clock.advance(chrono::Duration::minutes(10));

        let shutdown = CancellationToken::new();
        let sweep = SweepConfig {
            enabled: true,
            interval: Duration::from_millis(10),
            retention: Duration::from_secs(60),
        };
        let task = spawn_rate_sweeper(limiters.clone(), clock.clone(), sweep, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiters.ip.is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
