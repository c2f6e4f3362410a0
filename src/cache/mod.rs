//! # Cache Module
//!
//! Resolve-result caching in front of any [`TrackResolver`].
//!
//! Resolving the same query twice (a popular song requested again, a user
//! re-adding a playlist) hits the node's search endpoint only once per TTL.
//! Entries are keyed by search backend plus normalized query text; the cached
//! tracks are re-attributed to whoever asks.
//!
//! ```env
//! RESOLVE_CACHE_TTL_SECS=600   # Time-to-live in seconds
//! ```

pub mod lru_cache;

use async_trait::async_trait;
use serenity::model::id::UserId;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::sources::{Query, ResolveError, SearchBackend, TrackRef, TrackResolver};
pub use lru_cache::{CacheMetrics, LRUCache};

const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    backend: SearchBackend,
    text: String,
}

impl From<&Query> for CacheKey {
    fn from(query: &Query) -> Self {
        // Las URLs no dependen del backend y su path distingue mayúsculas
        if query.is_url() {
            return Self {
                backend: SearchBackend::default(),
                text: query.text.clone(),
            };
        }
        Self {
            backend: query.backend,
            text: query.text.to_lowercase(),
        }
    }
}

pub struct CachedResolver<R> {
    inner: R,
    cache: LRUCache<CacheKey, Arc<Vec<TrackRef>>>,
}

impl<R: TrackResolver> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self::with_capacity(inner, ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: R, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            cache: LRUCache::new(capacity, ttl),
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }
}

#[async_trait]
impl<R: TrackResolver> TrackResolver for CachedResolver<R> {
    async fn resolve(&self, query: &Query, requester: UserId) -> Result<Vec<TrackRef>, ResolveError> {
        let key = CacheKey::from(query);

        if let Some(cached) = self.cache.get(&key) {
            debug!("💾 Cache hit para '{}'", query.text);
            return Ok(cached
                .iter()
                .cloned()
                .map(|track| track.with_requester(requester))
                .collect());
        }

        let tracks = self.inner.resolve(query, requester).await?;
        self.cache.insert(key, Arc::new(tracks.clone()));
        Ok(tracks)
    }
}
