//! Database layer for data persistence and access.
//!
//! SQLite through SQLx, following the repository pattern:
//!
//! ```text
//! ┌──────────────┐
//! │ Auth / API   │  (session cache, route handlers)
//! └──────┬───────┘
//!        ↓
//! ┌──────────────┐
//! │ Repositories │  (db::handlers)
//! └──────┬───────┘
//!        ↓
//! ┌──────────────┐
//! │   Models     │  (db::models)
//! └──────┬───────┘
//!        ↓
//! ┌──────────────┐
//! │    SQLite    │
//! └──────────────┘
//! ```
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are embedded in the binary:
//!
//! ```ignore
//! tallyctl::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod models;
