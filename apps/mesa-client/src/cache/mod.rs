//! Per-resource snapshot caches.
//!
//! One [`ResourceCache`] exists per remote collection type. It is a presence
//! cache, not a TTL cache: a held snapshot is served until something
//! explicitly invalidates it (a successful mutation, a push-channel signal)
//! or a caller forces a refresh.

pub mod source;

pub use source::{ApiError, ResourceSource};

use std::sync::Arc;

use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::session::SessionStore;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: Vec<T>,
    fetched_at: OffsetDateTime,
}

pub struct ResourceCache<S: ResourceSource> {
    name: &'static str,
    source: S,
    session: Arc<SessionStore>,
    entry: RwLock<Option<CacheEntry<S::Item>>>,
}

impl<S: ResourceSource> ResourceCache<S> {
    pub fn new(name: &'static str, source: S, session: Arc<SessionStore>) -> Self {
        Self {
            name,
            source,
            session,
            entry: RwLock::new(None),
        }
    }

    /// Return the held snapshot, or call the remote API when `force` is set
    /// or nothing is cached yet.
    ///
    /// A successful fetch replaces the whole entry; a failed one leaves the
    /// previous snapshot untouched and hands the typed failure back without
    /// retrying. Concurrent fetches are not deduplicated; the last writer
    /// wins, which is fine because every write is a full server snapshot.
    pub async fn fetch(&self, force: bool) -> Result<Vec<S::Item>, ApiError> {
        if !force {
            if let Some(entry) = self.entry.read().as_ref() {
                return Ok(entry.value.clone());
            }
        }

        match self.source.list().await {
            Ok(items) => {
                tracing::debug!(
                    target: "mesa::cache",
                    resource = self.name,
                    count = items.len(),
                    "snapshot refreshed"
                );
                *self.entry.write() = Some(CacheEntry {
                    value: items.clone(),
                    fetched_at: OffsetDateTime::now_utc(),
                });
                Ok(items)
            }
            Err(err) => {
                if err.is_unauthorized() {
                    // Recovery by side effect: drop the credential so the
                    // next authenticated check fails closed and forces a
                    // re-login.
                    tracing::warn!(
                        target: "mesa::cache",
                        resource = self.name,
                        "unauthorized response; clearing session"
                    );
                    if let Err(clear_err) = self.session.clear() {
                        tracing::warn!(
                            target: "mesa::cache",
                            error = %clear_err,
                            "failed to clear session after unauthorized response"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    pub fn cached(&self) -> Option<Vec<S::Item>> {
        self.entry.read().as_ref().map(|entry| entry.value.clone())
    }

    pub fn last_fetched_at(&self) -> Option<OffsetDateTime> {
        self.entry.read().as_ref().map(|entry| entry.fetched_at)
    }

    /// Drop the held snapshot. Called after every successful mutation against
    /// this resource type and by the sync policy on channel signals.
    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<Vec<String>, ApiError>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<String>, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ResourceSource for Arc<ScriptedSource> {
        type Item = String;

        async fn list(&self) -> Result<Vec<String>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Ok(vec!["empty".into()]);
            }
            responses.remove(0)
        }
    }

    fn session() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn unforced_fetch_serves_the_cached_snapshot() {
        let source = ScriptedSource::new(vec![Ok(vec!["order-1".to_string()])]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), session());

        let first = cache.fetch(false).await.unwrap();
        assert_eq!(first, vec!["order-1".to_string()]);
        assert_eq!(source.calls(), 1);

        let second = cache.fetch(false).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(source.calls(), 1, "cached read must not hit the network");
    }

    #[tokio::test]
    async fn forced_fetch_always_hits_the_source() {
        let source = ScriptedSource::new(vec![
            Ok(vec!["v1".to_string()]),
            Ok(vec!["v2".to_string()]),
        ]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), session());

        cache.fetch(true).await.unwrap();
        let second = cache.fetch(true).await.unwrap();
        assert_eq!(second, vec!["v2".to_string()]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn failed_forced_fetch_keeps_the_previous_snapshot() {
        let source = ScriptedSource::new(vec![
            Ok(vec!["kept".to_string()]),
            Err(ApiError::Network("connection refused".into())),
        ]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), session());

        cache.fetch(true).await.unwrap();
        let err = cache.fetch(true).await.unwrap_err();
        assert_eq!(err, ApiError::Network("connection refused".into()));

        let after = cache.fetch(false).await.unwrap();
        assert_eq!(after, vec!["kept".to_string()]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_the_snapshot() {
        let source = ScriptedSource::new(vec![
            Ok(vec!["v1".to_string()]),
            Ok(vec!["v2".to_string()]),
        ]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), session());

        cache.fetch(false).await.unwrap();
        cache.invalidate();
        assert_eq!(cache.cached(), None);

        let refetched = cache.fetch(false).await.unwrap();
        assert_eq!(refetched, vec!["v2".to_string()]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn unauthorized_response_clears_the_session() {
        let exp = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
        let payload = format!(r#"{{"username":"amir","exp":{exp}}}"#);
        let encoded = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes())
        };
        let session = session();
        session.save_token(&format!("h.{encoded}.s")).unwrap();
        assert!(session.is_authenticated());

        let source = ScriptedSource::new(vec![Err(ApiError::Status(401))]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), Arc::clone(&session));

        let err = cache.fetch(true).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(session.token(), None);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn timeout_is_surfaced_without_touching_the_session() {
        let session = session();
        let source = ScriptedSource::new(vec![Err(ApiError::Timeout)]);
        let cache = ResourceCache::new("orders", Arc::clone(&source), Arc::clone(&session));

        assert_eq!(cache.fetch(true).await.unwrap_err(), ApiError::Timeout);
        assert_eq!(cache.cached(), None);
    }
}
