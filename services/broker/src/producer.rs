//! Producer-side route cache.
//!
//! Destinations a connection publishes to resolve lazily through the router
//! and are cached in a small LRU. Evicting a route disconnects it from the
//! router first, so the router never leaks a producer attachment.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::router::{DestinationId, Route, Router};

pub const DEFAULT_CACHE_SIZE: usize = 10;

pub struct ProducerRoutes {
    router: Arc<dyn Router>,
    cache: LruCache<DestinationId, Route>,
}

impl ProducerRoutes {
    pub fn new(router: Arc<dyn Router>, capacity: usize) -> ProducerRoutes {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("nonzero default"));
        ProducerRoutes {
            router,
            cache: LruCache::new(capacity),
        }
    }

    /// Resolve the route for `destination`, connecting through the router on
    /// a cache miss. The caller is suspended for the duration of the connect.
    pub async fn resolve(&mut self, destination: &DestinationId) -> Route {
        if let Some(route) = self.cache.get(destination) {
            return route.clone();
        }
        let route = self.router.connect(destination.clone()).await;
        // Disconnect the coldest route before it is forgotten.
        if self.cache.len() == usize::from(self.cache.cap()) {
            if let Some((evicted_dest, evicted)) = self.cache.pop_lru() {
                debug!(destination = %evicted_dest, "evicting producer route");
                self.router.disconnect(&evicted);
            }
        }
        self.cache.put(destination.clone(), route.clone());
        route
    }

    /// Disconnect every cached route (connection teardown).
    pub fn clear(&mut self) {
        while let Some((_, route)) = self.cache.pop_lru() {
            self.router.disconnect(&route);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
