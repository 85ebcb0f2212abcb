//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `TALLY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `TALLY_` override YAML values
//! 3. **DATABASE_URL** - Special case: overrides `database.url` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `TALLY_LIMITS__IP__THRESHOLD=120` sets the `limits.ip.threshold` field.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`
//! - **Database**: `database.url`, `database.pool` - SQLite connection settings
//! - **Admin User**: `admin_username`, `admin_password` - Initial admin user created on first startup
//! - **Permissions**: `permissions.groups`, `permissions.default_group` - Permission groups and role assignment
//! - **Authentication**: `auth.client_ip`, `auth.store_timeout`, `auth.session_max_age`,
//!   `auth.allow_registration`, `auth.password`
//! - **Limits**: `limits.ip`, `limits.routes`, `limits.sweep` - Rate limiting
//! - **Features**: `enable_metrics`, `enable_otel_export`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! TALLY_PORT=8080
//! DATABASE_URL="sqlite://tally.db?mode=rwc"
//! TALLY_AUTH__CLIENT_IP=cloudflare
//! TALLY_AUTH__STORE_TIMEOUT=2s
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::auth::client_ip::ClientIpSource;
use crate::auth::password::Argon2Params;
use crate::auth::permissions::{PermissionGroup, PermissionGroups};
use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TALLY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Set from the `DATABASE_URL` environment variable; folded into `database.url` on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    /// Username of the admin account created on first startup
    pub admin_username: Option<String>,
    /// Password of the admin account created on first startup
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    /// Serve Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP, configured by the standard `OTEL_*` environment variables
    pub enable_otel_export: bool,
    pub permissions: PermissionsConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_url: None,
            database: DatabaseConfig::default(),
            admin_username: None,
            admin_password: None,
            enable_metrics: true,
            enable_otel_export: false,
            permissions: PermissionsConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLx SQLite URL, e.g. `sqlite://tally.db?mode=rwc`
    pub url: String,
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://tally.db?mode=rwc".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

/// Permission groups and role assignment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionsConfig {
    /// Granted to every session ahead of its role's permissions
    pub app_permissions: Vec<String>,
    /// Role of newly created users
    pub default_group: String,
    /// Role of the seeded admin user
    pub admin_group: String,
    pub groups: BTreeMap<String, PermissionGroup>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            "app".to_string(),
            PermissionGroup::new(["app.web.login", "app.web.logout"], Vec::<String>::new()),
        );
        groups.insert(
            "user".to_string(),
            PermissionGroup::new(["group.user", "web.user.*", "app.user.settings.*"], ["app"]),
        );
        groups.insert("admin".to_string(), PermissionGroup::new(["web.admin.*"], ["user"]));
        groups.insert("root".to_string(), PermissionGroup::new(["*"], Vec::<String>::new()));

        Self {
            app_permissions: Vec::new(),
            default_group: "user".to_string(),
            admin_group: "admin".to_string(),
            groups,
        }
    }
}

impl PermissionsConfig {
    /// Build the validated group graph.
    pub fn build_groups(&self) -> Result<PermissionGroups, Error> {
        let groups = PermissionGroups::new(self.groups.clone(), self.default_group.clone()).map_err(|e| Error::Internal {
            operation: format!("Config validation: {e}"),
        })?;
        if !groups.contains(&self.admin_group) {
            return Err(Error::Internal {
                operation: format!("Config validation: admin group '{}' is not defined", self.admin_group),
            });
        }
        Ok(groups)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Where the client IP is read from
    pub client_ip: ClientIpSource,
    /// Upper bound on every session store round trip
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
    /// Sessions older than this are rejected and removed. Unset means sessions never expire.
    #[serde(with = "humantime_serde")]
    pub session_max_age: Option<Duration>,
    /// Creating a session beyond this many cached sessions fails
    pub max_cached_sessions: usize,
    /// Anyone may create an account in `permissions.default_group`
    pub allow_registration: bool,
    pub password: PasswordConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_ip: ClientIpSource::Direct,
            store_timeout: Duration::from_secs(5),
            session_max_age: None,
            max_cached_sessions: 100_000,
            allow_registration: true,
            password: PasswordConfig::default(),
        }
    }
}

/// Argon2id cost of newly hashed passwords. Existing hashes keep the parameters they were
/// created with.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordConfig {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        let params = Argon2Params::default();
        Self {
            argon2_memory_kib: params.memory_kib,
            argon2_iterations: params.iterations,
            argon2_parallelism: params.parallelism,
        }
    }
}

impl PasswordConfig {
    pub fn argon2_params(&self) -> Argon2Params {
        Argon2Params {
            memory_kib: self.argon2_memory_kib,
            iterations: self.argon2_iterations,
            parallelism: self.argon2_parallelism,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Limiter keyed by client IP
    pub ip: RateLimiterConfig,
    /// Limiter keyed by per-route limiter ids
    pub routes: RateLimiterConfig,
    /// Charged to the IP limiter on every request
    pub request_cost: f64,
    /// Charged to the IP limiter when a well-formed token matches no session
    pub invalid_token_cost: f64,
    /// Charged to the IP limiter on a failed login
    pub failed_login_cost: f64,
    pub sweep: SweepConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip: RateLimiterConfig::default(),
            routes: RateLimiterConfig::default(),
            request_cost: 1.0,
            invalid_token_cost: 20.0,
            failed_login_cost: 20.0,
            sweep: SweepConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Requests are admitted while the bucket cost plus the request cost stays below this
    pub threshold: f64,
    /// Linear decay of the bucket cost
    pub decrease_per_minute: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            threshold: 60.0,
            decrease_per_minute: 60.0,
        }
    }
}

/// Periodic removal of drained rate limit buckets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Buckets untouched for longer than this are eligible once drained
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(600),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        self.permissions.build_groups()?;

        for (name, limiter) in [("ip", &self.limits.ip), ("routes", &self.limits.routes)] {
            if !(limiter.threshold.is_finite() && limiter.threshold > 0.0) {
                return Err(Error::Internal {
                    operation: format!("Config validation: limits.{name}.threshold must be a positive number"),
                });
            }
            if !(limiter.decrease_per_minute.is_finite() && limiter.decrease_per_minute > 0.0) {
                return Err(Error::Internal {
                    operation: format!("Config validation: limits.{name}.decrease_per_minute must be a positive number"),
                });
            }
        }

        for (name, cost) in [
            ("request_cost", self.limits.request_cost),
            ("invalid_token_cost", self.limits.invalid_token_cost),
            ("failed_login_cost", self.limits.failed_login_cost),
        ] {
            if !(cost.is_finite() && cost >= 0.0) {
                return Err(Error::Internal {
                    operation: format!("Config validation: limits.{name} must be a non-negative number"),
                });
            }
        }

        if self.limits.sweep.enabled && self.limits.sweep.interval.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: limits.sweep.interval must be greater than zero".to_string(),
            });
        }

        if self.auth.store_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: auth.store_timeout must be greater than zero".to_string(),
            });
        }

        if self.auth.max_cached_sessions == 0 {
            return Err(Error::Internal {
                operation: "Config validation: auth.max_cached_sessions must be at least 1".to_string(),
            });
        }

        let password = &self.auth.password;
        if password.argon2_iterations == 0 || password.argon2_parallelism == 0 || password.argon2_memory_kib < 8 * password.argon2_parallelism {
            return Err(Error::Internal {
                operation: "Config validation: auth.password needs at least one iteration, one lane and 8 KiB of memory per lane"
                    .to_string(),
            });
        }

        if self.admin_username.is_some() != self.admin_password.is_some() {
            return Err(Error::Internal {
                operation: "Config validation: admin_username and admin_password must be set together".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("TALLY_").ignore(&["config"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
