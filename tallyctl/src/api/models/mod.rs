//! API request and response data models.
//!
//! These are distinct from the database models in [`crate::db::models`] so the wire format can
//! evolve independently of storage.
//!
//! - [`auth`]: Login, session and logout payloads
//! - [`admin`]: Cache and rate limiter statistics
//! - [`users`]: Account creation

pub mod admin;
pub mod auth;
pub mod users;
