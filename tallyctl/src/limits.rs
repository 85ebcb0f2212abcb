//! Rate limiting for protecting the auth surface.
//!
//! Every limiter is a leaky bucket with linear decay: each key accumulates a cost which drains at
//! `decrease_per_minute`, and a request is admitted while the drained cost plus the incoming cost
//! stays below `threshold`. Decay is computed lazily when a key is touched, so no timer runs per
//! bucket. A periodic [`sweep`](RateLimiter::sweep) drops buckets that have fully drained.
//!
//! Two limiters exist, with disjoint key spaces:
//!
//! - the IP limiter, charged on every request by the authorizer and charged extra for unknown
//!   tokens and failed logins
//! - the route limiter, keyed by the identifier each route declares through [`route_limit`]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, trace};

use crate::AppState;
use crate::auth::client_ip::request_client_ip;
use crate::config::{LimitsConfig, RateLimiterConfig};
use crate::errors::{Error, Result};

/// Container for all rate limiters.
#[derive(Debug, Clone)]
pub struct Limiters {
    /// Keyed by client IP.
    pub ip: Arc<RateLimiter>,
    /// Keyed by route limiter id, optionally suffixed with the client IP.
    pub routes: Arc<RateLimiter>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            ip: Arc::new(RateLimiter::new("ip", &config.ip)),
            routes: Arc::new(RateLimiter::new("route", &config.routes)),
        }
    }

    /// Sweep both limiters, returning the number of buckets removed.
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        self.ip.sweep(now, retention) + self.routes.sweep(now, retention)
    }
}

/// Outcome of charging (or peeking at) a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub limited: bool,
    /// Milliseconds until a request of the same cost would be admitted. Zero when not limited.
    pub retry_after_ms: u64,
}

impl RateDecision {
    const ADMITTED: Self = Self {
        limited: false,
        retry_after_ms: 0,
    };

    /// Convert a limited decision into the client-facing error.
    pub fn into_result(self) -> Result<()> {
        if self.limited {
            Err(Error::TooManyRequests {
                retry_after_ms: self.retry_after_ms,
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    cost: f64,
    last_update: DateTime<Utc>,
}

impl Bucket {
    /// Cost remaining at `now`. A clock that moved backwards decays nothing.
    fn decayed(&self, now: DateTime<Utc>, decay_per_ms: f64) -> f64 {
        let elapsed_ms = (now - self.last_update).num_milliseconds().max(0) as f64;
        (self.cost - elapsed_ms * decay_per_ms).max(0.0)
    }
}

/// A leaky-bucket limiter over string keys.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    threshold: f64,
    decay_per_ms: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: &RateLimiterConfig) -> Self {
        Self {
            name,
            threshold: config.threshold,
            decay_per_ms: config.decrease_per_minute / 60_000.0,
            buckets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Charge `cost` to `key`.
    ///
    /// The first call for a key is always admitted. Later calls are admitted while the decayed
    /// cost plus `cost` is below the threshold; a rejected call stores only the decayed cost.
    /// The bucket entry is held locked for the whole read-modify-write.
    pub fn check(&self, key: &str, cost: f64, now: DateTime<Utc>) -> Result<RateDecision> {
        validate_cost(cost)?;

        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Bucket { cost, last_update: now });
                RateDecision::ADMITTED
            }
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                let decayed = bucket.decayed(now, self.decay_per_ms);
                let decision = self.decide(decayed, cost);
                bucket.cost = if decision.limited { decayed } else { decayed + cost };
                // Time already decayed must not be decayed again once the clock recovers
                bucket.last_update = bucket.last_update.max(now);
                decision
            }
        };

        if decision.limited {
            debug!(limiter = self.name, key, retry_after_ms = decision.retry_after_ms, "Rate limited");
            metrics::counter!("tally_rate_limited_total", "limiter" => self.name).increment(1);
        } else {
            trace!(limiter = self.name, key, cost, "Rate limit charged");
        }
        Ok(decision)
    }

    /// What [`check`](Self::check) would decide for `cost` at `now`, without charging anything.
    pub fn peek(&self, key: &str, cost: f64, now: DateTime<Utc>) -> Result<RateDecision> {
        validate_cost(cost)?;
        Ok(match self.buckets.get(key) {
            Some(bucket) => self.decide(bucket.decayed(now, self.decay_per_ms), cost),
            None => RateDecision::ADMITTED,
        })
    }

    /// Decayed cost currently held by `key`, if it has a bucket.
    pub fn cost_of(&self, key: &str, now: DateTime<Utc>) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.decayed(now, self.decay_per_ms))
    }

    /// Remove buckets that have fully drained and were last touched more than `retention` ago.
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let stale = now.signed_duration_since(bucket.last_update) > retention;
            !(stale && bucket.decayed(now, self.decay_per_ms) <= 0.0)
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(limiter = self.name, removed, "Swept drained rate buckets");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn decide(&self, decayed: f64, cost: f64) -> RateDecision {
        let total = decayed + cost;
        if total < self.threshold {
            return RateDecision::ADMITTED;
        }
        // Smallest whole millisecond after which decayed + cost drops below the threshold.
        let retry_after_ms = ((total - self.threshold) / self.decay_per_ms).floor() + 1.0;
        RateDecision {
            limited: true,
            retry_after_ms: retry_after_ms as u64,
        }
    }
}

fn validate_cost(cost: f64) -> Result<()> {
    if cost.is_finite() && cost >= 0.0 {
        Ok(())
    } else {
        Err(Error::Internal {
            operation: format!("charge rate limiter with invalid cost {cost}"),
        })
    }
}

/// Whether a route limit is shared by all clients or tracked per client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    PerIp,
    Global,
}

/// A route's declared limit on the route limiter.
#[derive(Debug, Clone, Copy)]
pub struct RouteLimit {
    pub id: &'static str,
    pub scope: LimitScope,
    pub cost: f64,
}

impl RouteLimit {
    pub const fn per_ip(id: &'static str, cost: f64) -> Self {
        Self {
            id,
            scope: LimitScope::PerIp,
            cost,
        }
    }

    pub const fn global(id: &'static str, cost: f64) -> Self {
        Self {
            id,
            scope: LimitScope::Global,
            cost,
        }
    }

    pub fn key(&self, ip: &str) -> String {
        match self.scope {
            LimitScope::PerIp => format!("{}:{}", self.id, ip),
            LimitScope::Global => self.id.to_string(),
        }
    }
}

/// Middleware charging the route limiter for `limit`, for use with
/// [`axum::middleware::from_fn_with_state`].
pub fn route_limit(limit: RouteLimit) -> impl Fn(State<AppState>, Request, Next) -> BoxFuture<'static, Result<Response>> + Clone + Send + Sync + 'static {
    move |State(state): State<AppState>, request: Request, next: Next| -> BoxFuture<'static, Result<Response>> {
        Box::pin(async move {
            let ip = request_client_ip(state.config.auth.client_ip, &request);
            let now = state.clock.now();
            state.limiters.routes.check(&limit.key(&ip), limit.cost, now)?.into_result()?;
            Ok(next.run(request).await)
        })
    }
}
