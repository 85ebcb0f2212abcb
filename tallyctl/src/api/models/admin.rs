//! Operator views of the in-memory auth state.

use serde::{Deserialize, Serialize};

use crate::auth::session::CacheStats;

/// Bucket counts per rate limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateBucketCounts {
    pub ip: usize,
    pub routes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub sessions: CacheStats,
    pub rate_buckets: RateBucketCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheWipeResponse {
    /// Sessions dropped from memory. Their durable rows are untouched.
    pub sessions_wiped: usize,
}
