//! Authentication and authorization.
//!
//! Sessions are opaque UUIDv4 bearer tokens minted at login. Each session carries the effective
//! permission list of its user's role, expanded once from the configured permission groups, and
//! the browser family it was created from.
//!
//! Every route declares its requirement through [`middleware::require`] or
//! [`middleware::public`]; the [`middleware::RequestAuthorizer`] then rate limits the client IP,
//! resolves the session through the [`session::SessionCache`], and checks the permission with
//! [`permissions::check`].
//!
//! # Modules
//!
//! - [`client_ip`]: Client IP resolution policies
//! - [`current_user`]: Extractors for the authenticated session in handlers
//! - [`middleware`]: Per-request authorization and route middleware
//! - [`password`]: Password hashing and verification using Argon2
//! - [`permissions`]: Permission groups, expansion and the matching grammar
//! - [`session`]: Cache-aside session storage
//! - [`utils`]: Bearer token parsing and browser fingerprints
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use tallyctl::auth::current_user::CurrentUser;
//!
//! async fn protected_handler(CurrentUser(session): CurrentUser) -> String {
//!     format!("Hello, {}!", session.username)
//! }
//! ```

pub mod client_ip;
pub mod current_user;
pub mod middleware;
pub mod password;
pub mod permissions;
pub mod session;
pub mod utils;
