//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! Everything is served under `/api/v1`:
//!
//! - **Authentication** (`/auth/*`): Login, session check, logout
//! - **Administration** (`/admin/*`): Session cache statistics and wipes

pub mod handlers;
pub mod models;
