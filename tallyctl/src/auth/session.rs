//! Session cache over the durable session store.
//!
//! [`SessionCache`] is cache-aside: lookups are served from an in-memory map and fall back to
//! the [`SessionStore`] on a miss, repopulating the map without writing anything back. Creates
//! write through to the store (unless asked not to) before caching, so the store stays the system
//! of record. Removes evict before deleting the durable row: cache hits take no lock, so an entry
//! must never outlive its row.
//!
//! Mutations of one token are serialized by a striped lock table. Inserts are checked against
//! `max_sessions` under a single capacity lock, so the cache never grows past it.
//! Every store call is bounded by `store_timeout`; a timeout or connection fault surfaces as
//! [`Error::StoreUnavailable`], never as an authentication failure.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::{
    auth::permissions::{EffectivePermissions, PermissionGroups},
    clock::Clock,
    db::{
        errors::{DbError, Result as DbResult},
        models::sessions::SessionDBResponse,
    },
    errors::{Error, Result},
    types::{SessionToken, UserId, abbrev_token},
};

const LOCK_STRIPES: usize = 64;

/// Durable session storage. The system of record for sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn create_session(&self, token: SessionToken, user_id: UserId, browser: &str, created_at: DateTime<Utc>) -> DbResult<()>;

    /// Fetch a session joined with its user.
    async fn get_session(&self, token: SessionToken) -> DbResult<Option<SessionDBResponse>>;

    /// Delete a session. Deleting an unknown token is not an error.
    async fn delete_session(&self, token: SessionToken) -> DbResult<()>;

    /// Delete every session of a user, returning the deleted tokens.
    async fn delete_sessions_for_user(&self, user_id: UserId) -> DbResult<Vec<SessionToken>>;
}

/// User fields copied into a session at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: UserId,
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub language: String,
}

/// An authenticated session as held in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub token: SessionToken,
    pub user_id: UserId,
    pub uuid: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub browser: String,
    pub permissions: EffectivePermissions,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// Whether [`SessionCache::create`] persists the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    WriteThrough,
    /// The durable row already exists.
    CacheOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub sessions: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct SessionCache {
    sessions: DashMap<SessionToken, Arc<SessionRecord>>,
    locks: Vec<Mutex<()>>,
    capacity: std::sync::Mutex<()>,
    store: Arc<dyn SessionStore>,
    permissions: Arc<PermissionGroups>,
    app_permissions: Vec<String>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    max_sessions: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[bon::bon]
impl SessionCache {
    #[builder]
    pub fn new(
        store: Arc<dyn SessionStore>,
        permissions: Arc<PermissionGroups>,
        clock: Arc<dyn Clock>,
        #[builder(default)]
        app_permissions: Vec<String>,
        #[builder(default = Duration::from_secs(5))] store_timeout: Duration,
        #[builder(default = 100_000)] max_sessions: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            capacity: std::sync::Mutex::new(()),
            store,
            permissions,
            app_permissions,
            clock,
            store_timeout,
            max_sessions,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl SessionCache {
    /// Effective permissions for `role`: the app-wide permissions followed by the role's
    /// expansion.
    pub fn expand_role(&self, role: &str) -> EffectivePermissions {
        self.permissions.expand(&self.app_permissions, role)
    }

    /// Role given to accounts created without one.
    pub fn default_role(&self) -> &str {
        self.permissions.default_group()
    }

    /// Cache a new session, persisting it first unless `write` is [`CacheWrite::CacheOnly`].
    ///
    /// A full cache is a hard error: the session is not persisted (or is rolled back if the cache
    /// filled up while persisting) and the caller must fail.
    #[instrument(skip(self, token, user, permissions), fields(token = %abbrev_token(&token), user_id = user.user_id))]
    pub async fn create(
        &self,
        token: SessionToken,
        user: SessionUser,
        permissions: EffectivePermissions,
        browser: String,
        write: CacheWrite,
    ) -> Result<Arc<SessionRecord>> {
        let record = Arc::new(SessionRecord {
            token,
            user_id: user.user_id,
            uuid: user.uuid,
            username: user.username,
            email: user.email,
            role: user.role,
            browser,
            permissions,
            language: user.language,
            created_at: self.clock.now(),
        });

        let _guard = self.lock_for(&token).lock().await;
        self.ensure_capacity(&token)?;

        if write == CacheWrite::WriteThrough {
            self.store_call(
                "create session",
                self.store.create_session(token, record.user_id, &record.browser, record.created_at),
            )
            .await?;
        }

        if let Err(e) = self.insert_within_capacity(token, record.clone()) {
            if write == CacheWrite::WriteThrough
                && let Err(rollback) = self.store_call("roll back session", self.store.delete_session(token)).await
            {
                error!("Failed to roll back session that did not fit the cache: {rollback}");
            }
            return Err(e);
        }
        debug!("Session created");
        Ok(record)
    }

    /// Find a session, reading through to the store on a miss.
    ///
    /// `Ok(None)` means the token exists in neither layer.
    pub async fn lookup(&self, token: SessionToken) -> Result<Option<Arc<SessionRecord>>> {
        if let Some(record) = self.cached(&token) {
            self.record_hit(&token);
            return Ok(Some(record));
        }

        let _guard = self.lock_for(&token).lock().await;
        // Another task may have repopulated while this one waited for the lock
        if let Some(record) = self.cached(&token) {
            self.record_hit(&token);
            return Ok(Some(record));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tally_session_cache_total", "result" => "miss").increment(1);
        debug!(token = %abbrev_token(&token), "Session cache miss");

        let Some(row) = self.store_call("get session", self.store.get_session(token)).await? else {
            return Ok(None);
        };

        let record = Arc::new(SessionRecord {
            token: row.token,
            user_id: row.user_id,
            uuid: row.uuid,
            username: row.username,
            email: row.email,
            permissions: self.expand_role(&row.role),
            role: row.role,
            browser: row.browser,
            language: row.language,
            created_at: row.created_at,
        });
        self.insert_within_capacity(token, record.clone())?;
        Ok(Some(record))
    }

    /// Evict a session, then delete it from the store. Idempotent.
    ///
    /// Lookups racing the removal either miss and wait on the stripe lock, or see nothing once it
    /// is released. If the store delete fails, the durable row repopulates on the next lookup.
    #[instrument(skip(self, token), fields(token = %abbrev_token(&token)))]
    pub async fn remove(&self, token: SessionToken) -> Result<()> {
        let _guard = self.lock_for(&token).lock().await;
        self.sessions.remove(&token);
        self.store_call("delete session", self.store.delete_session(token)).await?;
        debug!("Session removed");
        Ok(())
    }

    /// Delete every session of `user_id` from both layers, returning how many were removed.
    #[instrument(skip(self))]
    pub async fn remove_user_sessions(&self, user_id: UserId) -> Result<usize> {
        let cached: Vec<SessionToken> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| *entry.key())
            .collect();
        for token in &cached {
            self.sessions.remove(token);
        }

        let mut tokens = self
            .store_call("delete user sessions", self.store.delete_sessions_for_user(user_id))
            .await?;
        // Cache-only sessions have no durable row to report
        for token in cached {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }

        // A lookup may have repopulated a row between the eviction and the delete
        for token in &tokens {
            let _guard = self.lock_for(token).lock().await;
            self.sessions.remove(token);
        }
        debug!(removed = tokens.len(), "User sessions removed");
        Ok(tokens.len())
    }

    /// Drop every cached session. Durable rows are untouched and repopulate on demand.
    pub fn wipe(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        debug!(count, "Session cache wiped");
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            sessions: self.sessions.len(),
            capacity: self.max_sessions,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn cached(&self, token: &SessionToken) -> Option<Arc<SessionRecord>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    fn record_hit(&self, token: &SessionToken) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tally_session_cache_total", "result" => "hit").increment(1);
        debug!(token = %abbrev_token(token), "Session cache hit");
    }

    fn lock_for(&self, token: &SessionToken) -> &Mutex<()> {
        let (_, low) = token.as_u64_pair();
        &self.locks[(low % self.locks.len() as u64) as usize]
    }

    fn insert_within_capacity(&self, token: SessionToken, record: Arc<SessionRecord>) -> Result<()> {
        let _capacity = self.capacity.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.ensure_capacity(&token)?;
        self.sessions.insert(token, record);
        Ok(())
    }

    fn ensure_capacity(&self, token: &SessionToken) -> Result<()> {
        if self.sessions.len() >= self.max_sessions && !self.sessions.contains_key(token) {
            error!(capacity = self.max_sessions, "Session cache is full");
            return Err(Error::Internal {
                operation: format!("cache session: cache is full at {} sessions", self.max_sessions),
            });
        }
        Ok(())
    }

    async fn store_call<T>(&self, operation: &str, call: impl Future<Output = DbResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DbError::Other(e))) => {
                error!("Session store failed to {operation}: {e:#}");
                Err(Error::StoreUnavailable {
                    operation: operation.to_string(),
                })
            }
            Ok(Err(e)) => Err(Error::Database(e)),
            Err(_) => {
                error!(timeout = ?self.store_timeout, "Session store timed out trying to {operation}");
                Err(Error::StoreUnavailable {
                    operation: operation.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Sessions;
    use crate::test_utils::{CountingStore, ManualClock, create_test_pool, create_test_user, test_permission_groups};

    struct Fixture {
        cache: SessionCache,
        store: Arc<CountingStore<Sessions>>,
        clock: Arc<ManualClock>,
        user: SessionUser,
    }

    async fn fixture() -> Fixture {
        let pool = create_test_pool().await;
        let user = create_test_user(&pool, "alice", "user").await;
        let store = Arc::new(CountingStore::new(Sessions::new(pool)));
        let clock = Arc::new(ManualClock::default());
        let cache = SessionCache::builder()
            .store(store.clone())
            .permissions(Arc::new(test_permission_groups()))
            .clock(clock.clone())
            .build();
        Fixture {
            cache,
            store,
            clock,
            user: SessionUser {
                user_id: user.id,
                uuid: user.uuid,
                username: user.username,
                email: user.email,
                role: user.role,
                language: user.language,
            },
        }
    }

    #[tokio::test]
    async fn test_lookup_after_create_hits_cache_without_store_reads() {
        let f = fixture().await;
        let token = Uuid::new_v4();
        let permissions = f.cache.expand_role("user");

        let created = f
            .cache
            .create(token, f.user.clone(), permissions.clone(), "Firefox".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();
        let found = f.cache.lookup(token).await.unwrap().unwrap();

        assert_eq!(*found, *created);
        assert_eq!(found.permissions, permissions);
        assert_eq!(found.created_at, f.clock.now());
        assert_eq!(f.store.writes(), 1);
        assert_eq!(f.store.reads(), 0);
        assert_eq!(f.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_repopulates_from_store_once() {
        let f = fixture().await;
        let token = Uuid::new_v4();
        f.cache
            .create(token, f.user.clone(), f.cache.expand_role("user"), "Chrome".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();
        assert_eq!(f.cache.wipe(), 1);

        let first = f.cache.lookup(token).await.unwrap().unwrap();
        assert_eq!(first.username, "alice");
        assert_eq!(first.browser, "Chrome");
        assert_eq!(first.permissions, f.cache.expand_role("user"));
        assert_eq!(f.store.reads(), 1);

        let second = f.cache.lookup(token).await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(f.store.reads(), 1);
        // Repopulation never writes back
        assert_eq!(f.store.writes(), 1);

        let stats = f.cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_only_create_does_not_persist() {
        let f = fixture().await;
        let token = Uuid::new_v4();
        f.cache
            .create(token, f.user.clone(), EffectivePermissions::default(), "Safari".to_string(), CacheWrite::CacheOnly)
            .await
            .unwrap();
        assert_eq!(f.store.writes(), 0);

        f.cache.wipe();
        assert!(f.cache.lookup(token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_token_is_none() {
        let f = fixture().await;
        assert!(f.cache.lookup(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(f.cache.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_remove_clears_both_layers_and_is_idempotent() {
        let f = fixture().await;
        let token = Uuid::new_v4();
        f.cache
            .create(token, f.user.clone(), f.cache.expand_role("user"), "Edge".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();

        f.cache.remove(token).await.unwrap();
        f.cache.remove(token).await.unwrap();
        assert!(f.cache.lookup(token).await.unwrap().is_none());
        assert_eq!(f.store.reads(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_remove_and_lookup_never_resurrect() {
        let f = fixture().await;
        let cache = Arc::new(f.cache);
        let token = Uuid::new_v4();
        cache
            .create(token, f.user.clone(), cache.expand_role("user"), "Edge".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();
        cache.wipe();

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.lookup(token).await.unwrap() })
            })
            .collect();
        cache.remove(token).await.unwrap();
        for lookup in lookups {
            lookup.await.unwrap();
        }

        assert!(cache.lookup(token).await.unwrap().is_none());
        assert_eq!(cache.stats().sessions, 0);
    }

    /// Deletes the durable row, then holds the delete open for a while.
    #[derive(Debug)]
    struct SlowDelete(Sessions);

    #[async_trait::async_trait]
    impl SessionStore for SlowDelete {
        async fn create_session(&self, token: SessionToken, user_id: UserId, browser: &str, created_at: DateTime<Utc>) -> DbResult<()> {
            self.0.create_session(token, user_id, browser, created_at).await
        }
        async fn get_session(&self, token: SessionToken) -> DbResult<Option<SessionDBResponse>> {
            self.0.get_session(token).await
        }
        async fn delete_session(&self, token: SessionToken) -> DbResult<()> {
            self.0.delete_session(token).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
        async fn delete_sessions_for_user(&self, user_id: UserId) -> DbResult<Vec<SessionToken>> {
            self.0.delete_sessions_for_user(user_id).await
        }
    }

    #[tokio::test]
    async fn test_lookup_during_remove_sees_no_session() {
        let pool = create_test_pool().await;
        let user = create_test_user(&pool, "alice", "user").await;
        let cache = Arc::new(
            SessionCache::builder()
                .store(Arc::new(SlowDelete(Sessions::new(pool))))
                .permissions(Arc::new(test_permission_groups()))
                .clock(Arc::new(ManualClock::default()))
                .build(),
        );
        let token = Uuid::new_v4();
        cache
            .create(
                token,
                SessionUser {
                    user_id: user.id,
                    uuid: user.uuid,
                    username: user.username,
                    email: user.email,
                    role: user.role,
                    language: user.language,
                },
                cache.expand_role("user"),
                "Firefox".to_string(),
                CacheWrite::WriteThrough,
            )
            .await
            .unwrap();

        let remover = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.remove(token).await })
        };
        // The durable row is gone and the store call is still in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.lookup(token).await.unwrap().is_none());

        remover.await.unwrap().unwrap();
        assert_eq!(cache.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_remove_user_sessions() {
        let f = fixture().await;
        let durable = Uuid::new_v4();
        let cache_only = Uuid::new_v4();
        f.cache
            .create(durable, f.user.clone(), f.cache.expand_role("user"), "Edge".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();
        f.cache
            .create(cache_only, f.user.clone(), f.cache.expand_role("user"), "Edge".to_string(), CacheWrite::CacheOnly)
            .await
            .unwrap();

        assert_eq!(f.cache.remove_user_sessions(f.user.user_id).await.unwrap(), 2);
        assert!(f.cache.lookup(durable).await.unwrap().is_none());
        assert!(f.cache.lookup(cache_only).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_cache_fails_before_persisting() {
        let pool = create_test_pool().await;
        let user = create_test_user(&pool, "bob", "user").await;
        let store = Arc::new(CountingStore::new(Sessions::new(pool)));
        let cache = SessionCache::builder()
            .store(store.clone())
            .permissions(Arc::new(test_permission_groups()))
            .clock(Arc::new(ManualClock::default()))
            .max_sessions(1)
            .build();
        let session_user = SessionUser {
            user_id: user.id,
            uuid: user.uuid,
            username: user.username,
            email: None,
            role: user.role,
            language: user.language,
        };

        cache
            .create(Uuid::new_v4(), session_user.clone(), EffectivePermissions::default(), "x".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap();
        let err = cache
            .create(Uuid::new_v4(), session_user, EffectivePermissions::default(), "x".to_string(), CacheWrite::WriteThrough)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_exceed_capacity() {
        let pool = create_test_pool().await;
        let user = create_test_user(&pool, "carol", "user").await;
        let cache = Arc::new(
            SessionCache::builder()
                .store(Arc::new(Sessions::new(pool.clone())))
                .permissions(Arc::new(test_permission_groups()))
                .clock(Arc::new(ManualClock::default()))
                .max_sessions(4)
                .build(),
        );
        let session_user = SessionUser {
            user_id: user.id,
            uuid: user.uuid,
            username: user.username,
            email: None,
            role: user.role,
            language: user.language,
        };

        let creates: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let session_user = session_user.clone();
                tokio::spawn(async move {
                    cache
                        .create(Uuid::new_v4(), session_user, EffectivePermissions::default(), "x".to_string(), CacheWrite::WriteThrough)
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for create in creates {
            if create.await.unwrap().is_ok() {
                created += 1;
            }
        }

        assert_eq!(created, 4);
        assert_eq!(cache.stats().sessions, 4);
        // Sessions that did not fit were not left behind in the store
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM websessions").fetch_one(&pool).await.unwrap();
        assert_eq!(rows, 4);
    }

    #[derive(Debug)]
    struct StalledStore;

    #[async_trait::async_trait]
    impl SessionStore for StalledStore {
        async fn create_session(&self, _: SessionToken, _: UserId, _: &str, _: DateTime<Utc>) -> DbResult<()> {
            std::future::pending().await
        }
        async fn get_session(&self, _: SessionToken) -> DbResult<Option<SessionDBResponse>> {
            std::future::pending().await
        }
        async fn delete_session(&self, _: SessionToken) -> DbResult<()> {
            Err(DbError::Other(anyhow::anyhow!("connection refused")))
        }
        async fn delete_sessions_for_user(&self, _: UserId) -> DbResult<Vec<SessionToken>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_store_faults_are_store_unavailable() {
        let cache = SessionCache::builder()
            .store(Arc::new(StalledStore))
            .permissions(Arc::new(test_permission_groups()))
            .clock(Arc::new(ManualClock::default()))
            .store_timeout(Duration::from_millis(20))
            .build();

        let err = cache.lookup(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));

        let err = cache.remove(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
    }
}
