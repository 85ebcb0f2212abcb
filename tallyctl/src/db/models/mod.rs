//! Database record structures matching the table schemas.

pub mod sessions;
pub mod users;
