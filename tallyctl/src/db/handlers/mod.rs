//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection, transaction or pool and returns models from
//! [`crate::db::models`].
//!
//! - [`Users`]: user accounts, implementing [`Repository`] over a borrowed connection
//! - [`Sessions`]: the durable [`SessionStore`](crate::auth::session::SessionStore), over the pool
//!
//! ```ignore
//! use tallyctl::db::handlers::{Repository, Users};
//!
//! let mut tx = pool.begin().await?;
//! let user = Users::new(&mut tx).get_by_username("alice").await?;
//! tx.commit().await?;
//! ```

pub mod repository;
pub mod sessions;
pub mod users;

pub use repository::Repository;
pub use sessions::Sessions;
pub use users::Users;
