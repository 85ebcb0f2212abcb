//! HTTP request handlers.
//!
//! Handlers never check permissions themselves: every route declares its requirement with
//! [`crate::auth::middleware::require`] or [`crate::auth::middleware::public`] in
//! [`crate::build_router`], and handlers read the session through
//! [`crate::auth::current_user::CurrentUser`].
//!
//! - [`auth`]: Login, session check and logout
//! - [`admin`]: Session cache and rate limiter administration
//! - [`users`]: Registration into the default group and first-run admin creation

pub mod admin;
pub mod auth;
pub mod users;
