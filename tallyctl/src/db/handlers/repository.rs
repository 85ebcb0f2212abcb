//! Base repository trait for database operations.

use crate::db::errors::Result;

/// A repository is the data access layer for one table. Each repository wraps a borrowed
/// SQLite connection (or transaction) and exposes strongly typed operations on it.
#[async_trait::async_trait]
pub trait Repository {
    /// The request type for creating entities
    type CreateRequest;

    /// The response/DTO type returned by operations
    type Response;

    /// Create a new entity
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response>;
}
