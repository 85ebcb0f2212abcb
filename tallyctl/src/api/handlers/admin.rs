use axum::{Json, extract::State};
use tracing::info;

use crate::{
    AppState,
    api::models::admin::{CacheInfo, CacheWipeResponse, RateBucketCounts},
    auth::current_user::CurrentUser,
};

pub const CACHE_READ_PERMISSION: &str = "web.admin.cache.read";
pub const CACHE_WRITE_PERMISSION: &str = "web.admin.cache.write";

/// Session cache and rate limiter occupancy
#[tracing::instrument(skip_all)]
pub async fn get_cache(State(state): State<AppState>) -> Json<CacheInfo> {
    Json(CacheInfo {
        sessions: state.sessions.stats(),
        rate_buckets: RateBucketCounts {
            ip: state.limiters.ip.len(),
            routes: state.limiters.routes.len(),
        },
    })
}

/// Drop every cached session. Sessions stay valid and reload from the store on next use.
#[tracing::instrument(skip_all, fields(user_id = session.user_id))]
pub async fn wipe_cache(State(state): State<AppState>, CurrentUser(session): CurrentUser) -> Json<CacheWipeResponse> {
    let sessions_wiped = state.sessions.wipe();
    info!(sessions_wiped, by = %session.username, "Session cache wiped");
    Json(CacheWipeResponse { sessions_wiped })
}
